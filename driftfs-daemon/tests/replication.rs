//! Two-node scenarios exercising the full stack below the event loop:
//! consensus, reconciliation, blob store and transfer, wired through an
//! in-process router. Ticks and timeouts fire only when the test asks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use driftfs_raft::controller::{Controller, TimerLength};
use driftfs_raft::log::Log;
use driftfs_raft::message::Envelope;
use driftfs_raft::request::Request;
use driftfs_raft::{NodeId, Transport};

use driftfs_daemon::fs::node::NodeKind;
use driftfs_daemon::fs::paths::encode_path;
use driftfs_daemon::fs::{FsConfig, FsListener, FsState, OpenMode};
use driftfs_daemon::store::ChangeStore;
use driftfs_daemon::transfer::{ChangeTransfer, TransferMessage, MODULE as CHANGETX};

type Wire = Arc<Mutex<VecDeque<(NodeId, NodeId, Envelope)>>>;

struct WireTransport {
    from: NodeId,
    peers: Vec<NodeId>,
    wire: Wire,
}

impl Transport for WireTransport {
    fn send(&mut self, target: &NodeId, envelope: Envelope) {
        self.wire
            .lock()
            .unwrap()
            .push_back((self.from.clone(), target.clone(), envelope));
    }

    fn broadcast(&mut self, envelope: Envelope) {
        for target in self.peers.clone() {
            self.send(&target, envelope.clone());
        }
    }
}

/// Everything one daemon owns, minus the event loop.
struct Node {
    id: NodeId,
    _dir: TempDir,
    controller: Controller<WireTransport>,
    store: ChangeStore,
    fs: FsState,
    transfer: ChangeTransfer,
    rx_sync: UnboundedReceiver<Request>,
    rx_arrival: UnboundedReceiver<(String, String)>,
}

impl Node {
    fn new(id: &str, peers: &[&str], wire: &Wire, seed: u64) -> Node {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path().join("raftlog")).unwrap();
        let peer_ids: Vec<NodeId> = peers.iter().map(|p| (*p).to_owned()).collect();
        let controller = Controller::new(
            id.to_owned(),
            peer_ids.clone(),
            log,
            WireTransport {
                from: id.to_owned(),
                peers: peer_ids,
                wire: wire.clone(),
            },
            TimerLength::new(seed, 150, 300, 50),
        );
        let store =
            ChangeStore::open(dir.path().join("store"), dir.path().join("scratch")).unwrap();
        let (sync_tx, rx_sync) = mpsc::unbounded_channel();
        let fs = FsState::new(
            FsConfig {
                id: id.to_owned(),
                uid: 1000,
                gid: 1000,
                file_mode: 0o644,
                dir_mode: 0o755,
                seed,
            },
            sync_tx,
        );
        let (arrival_tx, rx_arrival) = mpsc::unbounded_channel();
        Node {
            id: id.to_owned(),
            _dir: dir,
            controller,
            store,
            fs,
            transfer: ChangeTransfer::new(arrival_tx),
            rx_sync,
            rx_arrival,
        }
    }

    fn timeout(&mut self) {
        let mut listener = FsListener {
            fs: &mut self.fs,
            store: &mut self.store,
        };
        self.controller.on_timeout(&mut listener).unwrap();
    }

    /// One reconciliation tick: submit queue heads, chase missing blobs,
    /// absorb arrivals.
    fn tick(&mut self) {
        self.fs.tick(&self.store);
        while let Ok(request) = self.rx_sync.try_recv() {
            let mut listener = FsListener {
                fs: &mut self.fs,
                store: &mut self.store,
            };
            self.controller.submit(request, &mut listener).unwrap();
        }
        for (key, version) in self.fs.pending_blobs() {
            let origin = match self.controller.client().version(&key) {
                Some((current, origin)) if *current == version => origin.clone(),
                _ => continue,
            };
            if origin == self.id {
                continue;
            }
            self.transfer
                .fetch(
                    &key,
                    &version,
                    &origin,
                    &mut self.store,
                    self.controller.transport_mut(),
                )
                .unwrap();
        }
        self.absorb_arrivals();
    }

    fn deliver(&mut self, from: &NodeId, envelope: Envelope) {
        if envelope.module == CHANGETX {
            let message: TransferMessage = serde_json::from_value(envelope.content).unwrap();
            self.transfer.handle_message(
                from,
                message,
                &mut self.store,
                self.controller.transport_mut(),
            );
            self.absorb_arrivals();
            return;
        }
        let mut listener = FsListener {
            fs: &mut self.fs,
            store: &mut self.store,
        };
        self.controller
            .dispatch(from, envelope, &mut listener)
            .unwrap();
    }

    fn absorb_arrivals(&mut self) {
        while let Ok((key, version)) = self.rx_arrival.try_recv() {
            self.fs.notify_arrival(&key, &version);
        }
    }

    fn write_file(&mut self, path: &str, data: &[u8]) {
        self.fs.create(&mut self.store, path).unwrap();
        self.fs.write(&mut self.store, path, 0, data).unwrap();
        self.fs.release(&mut self.store, path).unwrap();
    }

    fn rewrite_file(&mut self, path: &str, data: &[u8]) {
        self.fs
            .open(&mut self.store, path, OpenMode::Write)
            .unwrap();
        self.fs.write(&mut self.store, path, 0, data).unwrap();
        self.fs.release(&mut self.store, path).unwrap();
    }

    fn read_file(&self, path: &str) -> Vec<u8> {
        self.fs.read(&self.store, path, 0, 1 << 16).unwrap()
    }

    fn file_names(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .fs
            .readdir(dir)
            .unwrap()
            .into_iter()
            .filter(|entry| entry.kind == NodeKind::File)
            .map(|entry| entry.name)
            .collect();
        names.sort();
        names
    }
}

struct Pair {
    wire: Wire,
    nodes: BTreeMap<NodeId, Node>,
}

impl Pair {
    fn new() -> Pair {
        let wire: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let mut nodes = BTreeMap::new();
        nodes.insert("foo".to_owned(), Node::new("foo", &["bar"], &wire, 1));
        nodes.insert("bar".to_owned(), Node::new("bar", &["foo"], &wire, 2));
        let mut pair = Pair { wire, nodes };

        // foo wins the first election.
        pair.node("foo").timeout();
        pair.settle();
        assert!(pair.node("foo").controller.state().role().is_leader());
        pair
    }

    fn node(&mut self, id: &str) -> &mut Node {
        self.nodes.get_mut(id).expect("unknown node")
    }

    fn settle(&mut self) {
        for _ in 0..10_000 {
            let next = self.wire.lock().unwrap().pop_front();
            let Some((from, to, envelope)) = next else {
                return;
            };
            self.node(&to).deliver(&from, envelope);
        }
        panic!("wire failed to settle");
    }

    /// Tick every node, then a leader heartbeat, until quiet. Mirrors a
    /// few hundred milliseconds of daemon time.
    fn round(&mut self) {
        for id in ["foo", "bar"] {
            self.node(id).tick();
            self.settle();
        }
        self.node("foo").timeout();
        self.settle();
    }
}

/// A committed add reaches the other node before its blob; the entry sits
/// pending until the transfer lands, then reads like the original.
#[test]
fn committed_add_pulls_its_blob_lazily() {
    let mut pair = Pair::new();

    pair.node("foo").write_file("/f", b"payload");
    pair.round();
    pair.round();

    // The metadata has committed on bar and the content followed.
    let bar = pair.node("bar");
    assert!(bar
        .controller
        .client()
        .version(&encode_path("/f"))
        .is_some());
    assert!(bar.store.exists(&encode_path("/f"), {
        let (version, _) = bar.controller.client().version(&encode_path("/f")).unwrap();
        version
    }));
    assert_eq!(bar.read_file("/f"), b"payload");
}

/// Two nodes race updates to the same file; the loser's bytes survive
/// under a recovered name that then replicates cluster-wide.
#[test]
fn racing_updates_preserve_the_losing_side() {
    let mut pair = Pair::new();

    pair.node("foo").write_file("/f", b"base");
    pair.round();
    pair.round();
    assert_eq!(pair.node("bar").read_file("/f"), b"base");

    // Both nodes rewrite from the same base version.
    pair.node("foo").rewrite_file("/f", b"ours");
    pair.node("bar").rewrite_file("/f", b"theirs");

    // The leader's own update reaches consensus first; bar's conflicting
    // update is rejected and its commit notification triggers recovery.
    for _ in 0..4 {
        pair.round();
    }

    // Both nodes converge on the same directory listing.
    let foo_names = pair.node("foo").file_names("/");
    let bar_names = pair.node("bar").file_names("/");
    assert_eq!(foo_names, bar_names);
    assert_eq!(foo_names.len(), 2, "expected /f plus one recovered file");

    let recovered = foo_names
        .iter()
        .find(|name| name.starts_with("f."))
        .expect("recovered name missing")
        .clone();
    let recovered_path = format!("/{recovered}");

    // The winning update owns the original path on both nodes; the losing
    // bytes live on under the recovered name.
    for id in ["foo", "bar"] {
        assert_eq!(pair.node(id).read_file("/f"), b"ours", "path /f on {id}");
        assert_eq!(
            pair.node(id).read_file(&recovered_path),
            b"theirs",
            "recovered path on {id}"
        );
    }
}
