//! Fixtures for testing the consensus stack.
//!
//! A [`Cluster`] holds one controller per node, wired together through an
//! in-process router that queues every envelope. Tests drive the cluster
//! deterministically: timeouts fire only when asked, and [`Cluster::settle`]
//! pumps queued messages until the network is quiet.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing_subscriber::prelude::*;

use driftfs_raft::controller::{Controller, TimerLength};
use driftfs_raft::log::Log;
use driftfs_raft::message::Envelope;
use driftfs_raft::request::{Add, Delete, Rename, Request, Update};
use driftfs_raft::state::Role;
use driftfs_raft::{ConsensusListener, NodeId, Transport};

/// Initialize the tracing system for a test run.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_test_writer()
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

type Wire = Arc<Mutex<VecDeque<(NodeId, NodeId, Envelope)>>>;

/// A transport that queues envelopes on the shared in-process wire.
pub struct RouterTransport {
    from: NodeId,
    peers: Vec<NodeId>,
    wire: Wire,
}

impl Transport for RouterTransport {
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

/// A listener that records every commit notification it receives.
#[derive(Default)]
pub struct Recorder {
    pub adds: Vec<Add>,
    pub updates: Vec<Update>,
    pub deletes: Vec<Delete>,
    pub renames: Vec<Rename>,
}

impl ConsensusListener for Recorder {
    fn on_add(&mut self, add: &Add) {
        self.adds.push(add.clone());
    }
    fn on_update(&mut self, update: &Update) {
        self.updates.push(update.clone());
    }
    fn on_delete(&mut self, delete: &Delete) {
        self.deletes.push(delete.clone());
    }
    fn on_rename(&mut self, rename: &Rename) {
        self.renames.push(rename.clone());
    }
}

/// A deterministic multi-node test cluster.
pub struct Cluster {
    wire: Wire,
    nodes: BTreeMap<NodeId, Controller<RouterTransport>>,
    pub listeners: BTreeMap<NodeId, Recorder>,
    isolated: HashSet<NodeId>,
    _dir: TempDir,
}

impl Cluster {
    pub fn new(ids: &[&str]) -> Cluster {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let wire: Wire = Arc::new(Mutex::new(VecDeque::new()));

        let mut nodes = BTreeMap::new();
        let mut listeners = BTreeMap::new();
        for (seat, id) in ids.iter().enumerate() {
            let peers: Vec<NodeId> = ids
                .iter()
                .filter(|other| *other != id)
                .map(|other| (*other).to_owned())
                .collect();
            let log = Log::open(dir.path().join(format!("journal-{id}"))).expect("open journal");
            let transport = RouterTransport {
                from: (*id).to_owned(),
                peers: peers.clone(),
                wire: wire.clone(),
            };
            let controller = Controller::new(
                (*id).to_owned(),
                peers,
                log,
                transport,
                TimerLength::new(seat as u64, 150, 300, 50),
            );
            nodes.insert((*id).to_owned(), controller);
            listeners.insert((*id).to_owned(), Recorder::default());
        }

        Cluster {
            wire,
            nodes,
            listeners,
            isolated: HashSet::new(),
            _dir: dir,
        }
    }

    /// Fire the timer on `id`, then pump the network quiet.
    pub fn timeout(&mut self, id: &str) {
        let listener = self.listeners.get_mut(id).expect("unknown node");
        self.nodes
            .get_mut(id)
            .expect("unknown node")
            .on_timeout(listener)
            .expect("timeout handling failed");
        self.settle();
    }

    /// Elect `id` leader by firing its election timeout.
    pub fn elect(&mut self, id: &str) {
        self.timeout(id);
        assert_eq!(self.role(id), Role::Leader, "{id} failed to win election");
    }

    /// Submit a KV request at `id`, as if its reconciliation layer asked.
    pub fn submit(&mut self, id: &str, request: Request) {
        let listener = self.listeners.get_mut(id).expect("unknown node");
        self.nodes
            .get_mut(id)
            .expect("unknown node")
            .submit(request, listener)
            .expect("submit failed");
        self.settle();
    }

    /// Deliver queued messages until the wire is quiet. Envelopes to or
    /// from an isolated node are dropped, like frames on a dead link.
    pub fn settle(&mut self) {
        for _ in 0..10_000 {
            let next = self.wire.lock().unwrap().pop_front();
            let Some((from, to, envelope)) = next else {
                return;
            };
            if self.isolated.contains(&from) || self.isolated.contains(&to) {
                continue;
            }
            let listener = self.listeners.get_mut(&to).expect("unknown node");
            self.nodes
                .get_mut(&to)
                .expect("unknown node")
                .dispatch(&from, envelope, listener)
                .expect("dispatch failed");
        }
        panic!("network failed to settle");
    }

    pub fn isolate(&mut self, id: &str) {
        self.isolated.insert(id.to_owned());
    }

    pub fn heal(&mut self, id: &str) {
        self.isolated.remove(id);
    }

    pub fn role(&self, id: &str) -> Role {
        self.nodes[id].state().role()
    }

    pub fn term(&self, id: &str) -> u64 {
        self.nodes[id].state().term()
    }

    pub fn leader_seen_by(&self, id: &str) -> Option<NodeId> {
        self.nodes[id].state().leader().cloned()
    }

    pub fn last_index(&self, id: &str) -> u64 {
        self.nodes[id].state().log().last_index()
    }

    pub fn commit_index(&self, id: &str) -> u64 {
        self.nodes[id].state().log().commit_index()
    }

    /// The committed version info for `key` at `id`.
    pub fn version(&self, id: &str, key: &str) -> Option<(String, String)> {
        self.nodes[id].client().version(key).cloned()
    }

    /// Every node currently believing it is leader.
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.state().role().is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Assert every node's log agrees with every other up to their common
    /// prefix (the log-matching property, checked through entry terms).
    pub fn assert_logs_consistent(&self) {
        let ids: Vec<&NodeId> = self.nodes.keys().collect();
        for a in &ids {
            for b in &ids {
                if a >= b {
                    continue;
                }
                let log_a = self.nodes[*a].state().log();
                let log_b = self.nodes[*b].state().log();
                let common = log_a.last_index().min(log_b.last_index());
                for index in 1..=common {
                    let ea = log_a.entry(index).unwrap();
                    let eb = log_b.entry(index).unwrap();
                    assert_eq!(
                        (ea.term, &ea.action),
                        (eb.term, &eb.action),
                        "logs of {a} and {b} diverge at index {index}"
                    );
                }
            }
        }
    }
}
