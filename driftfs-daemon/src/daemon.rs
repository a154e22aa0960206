//! Daemon assembly: one event loop driving consensus, reconciliation,
//! blob transfer and the POSIX bridge.
//!
//! Everything stateful runs here, single-threaded: the timer, inbound
//! envelopes, the periodic tick, bridged POSIX calls and blob arrivals are
//! multiplexed through one `select!` loop, so none of the subsystems need
//! locks between them.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

use driftfs_raft::controller::{Controller, TimerLength};
use driftfs_raft::error::DispatchError;
use driftfs_raft::log::Log;
use driftfs_raft::message::Envelope;
use driftfs_raft::request::Request;
use driftfs_raft::state::TimeoutKind;
use driftfs_raft::{NodeId, Transport};

use crate::config::Config;
use crate::fs::bridge::{self, FsOp};
use crate::fs::{FsConfig, FsListener, FsState};
use crate::store::ChangeStore;
use crate::transfer::{self, ChangeTransfer, TransferMessage};

/// The assembled daemon for one node.
pub struct Daemon<T: Transport> {
    config: Config,
    controller: Controller<T>,
    store: ChangeStore,
    fs: FsState,
    transfer: ChangeTransfer,

    rx_net: UnboundedReceiver<(NodeId, Envelope)>,
    rx_fsop: UnboundedReceiver<FsOp>,
    rx_sync: UnboundedReceiver<Request>,
    rx_arrival: UnboundedReceiver<(String, String)>,
}

impl<T: Transport> Daemon<T> {
    /// Recover durable state and wire the subsystems together.
    pub fn new(
        config: Config,
        transport: T,
        rx_net: UnboundedReceiver<(NodeId, Envelope)>,
        rx_fsop: UnboundedReceiver<FsOp>,
    ) -> anyhow::Result<Daemon<T>> {
        let log: Log<Request> = Log::open(config.journal_path())
            .with_context(|| format!("recovering journal {}", config.journal_path().display()))?;
        let timers = TimerLength::new(
            config.seed,
            config.leader_timeout_ms,
            config.election_timeout_ms,
            config.timeout_fuzz_ms,
        );
        let mut controller =
            Controller::new(config.id.clone(), config.peer_ids(), log, transport, timers);
        controller.bootstrap();

        let store = ChangeStore::open(config.store_root(), config.scratch_root())
            .context("opening blob store")?;

        let (sync_tx, rx_sync) = mpsc::unbounded_channel();
        let mut fs = FsState::new(
            FsConfig {
                id: config.id.clone(),
                uid: config.uid,
                gid: config.gid,
                file_mode: config.file_mode,
                dir_mode: config.dir_mode,
                seed: config.seed,
            },
            sync_tx,
        );

        // Mirror the replayed version map into the directory tree.
        let seeded: Vec<(String, String)> = controller
            .client()
            .versions()
            .map(|(key, (version, _))| (key.clone(), version.clone()))
            .collect();
        for (key, version) in seeded {
            fs.populate(&key, &version, &store);
        }

        let (arrival_tx, rx_arrival) = mpsc::unbounded_channel();
        let transfer = ChangeTransfer::new(arrival_tx);

        Ok(Daemon {
            config,
            controller,
            store,
            fs,
            transfer,
            rx_net,
            rx_fsop,
            rx_sync,
            rx_arrival,
        })
    }

    /// Run the event loop until a fatal error.
    pub async fn run(self) -> anyhow::Result<()> {
        let Daemon {
            config,
            mut controller,
            mut store,
            mut fs,
            mut transfer,
            mut rx_net,
            mut rx_fsop,
            mut rx_sync,
            mut rx_arrival,
        } = self;

        let mut tick = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        let initial = controller.arm(TimeoutKind::Election);
        let mut timer = Box::pin(tokio::time::sleep(initial));

        tracing::info!(id = %config.id, "daemon running");
        loop {
            tokio::select! {
                _ = timer.as_mut() => {
                    let mut listener = FsListener { fs: &mut fs, store: &mut store };
                    let next = controller.on_timeout(&mut listener)?;
                    let next = next.unwrap_or_else(|| controller.arm(TimeoutKind::Election));
                    timer.as_mut().reset(Instant::now() + next);
                }

                Some((from, envelope)) = rx_net.recv() => {
                    if envelope.module == transfer::MODULE {
                        match serde_json::from_value::<TransferMessage>(envelope.content) {
                            Ok(message) => transfer.handle_message(
                                &from,
                                message,
                                &mut store,
                                controller.transport_mut(),
                            ),
                            Err(err) => {
                                tracing::warn!(%from, error = %err, "bad changetx message");
                            }
                        }
                        continue;
                    }
                    let mut listener = FsListener { fs: &mut fs, store: &mut store };
                    match controller.dispatch(&from, envelope, &mut listener) {
                        Ok(Some(next)) => timer.as_mut().reset(Instant::now() + next),
                        Ok(None) => {}
                        Err(err @ DispatchError::Log(_)) => {
                            return Err(err).context("journal failure while dispatching");
                        }
                        Err(err) => tracing::warn!(%from, error = %err, "dropping message"),
                    }
                }

                _ = tick.tick() => {
                    fs.tick(&store);

                    // Submit whatever the tick queued.
                    while let Ok(request) = rx_sync.try_recv() {
                        let mut listener = FsListener { fs: &mut fs, store: &mut store };
                        match controller.submit(request, &mut listener) {
                            Ok(Some(next)) => timer.as_mut().reset(Instant::now() + next),
                            Ok(None) => {}
                            Err(err) => return Err(err).context("journal failure on submit"),
                        }
                    }

                    // Chase blobs the committed state says we should hold.
                    for (key, version) in fs.pending_blobs() {
                        let origin = match controller.client().version(&key) {
                            Some((current, origin)) if *current == version => origin.clone(),
                            _ => continue,
                        };
                        if origin == config.id {
                            continue;
                        }
                        if let Err(err) = transfer.fetch(
                            &key,
                            &version,
                            &origin,
                            &mut store,
                            controller.transport_mut(),
                        ) {
                            tracing::warn!(key, version, error = %err, "failed to request blob");
                        }
                    }
                }

                Some(op) = rx_fsop.recv() => {
                    bridge::apply(op, &mut fs, &mut store);
                }

                Some((key, version)) = rx_arrival.recv() => {
                    fs.notify_arrival(&key, &version);
                }
            }
        }
    }
}
