//! Wiring between the Raft state machine, the KV client and the message
//! transport.
//!
//! The controller owns both consensus objects, routes inbound envelopes to
//! the right module handler, wraps everything outbound in the two-level
//! envelope, and converts the state machine's timer requests into concrete
//! randomised durations for the event loop to arm.

use std::time::Duration;

use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::client::{KvClient, Validity};
use crate::error::DispatchError;
use crate::log::Log;
use crate::message::{Envelope, StateMessage, MODULE_CLIENT, MODULE_STATE};
use crate::request::Request;
use crate::state::{RaftState, StateHandlers, TimeoutKind};
use crate::{ConsensusListener, MessageSummary, NodeId, Transport};

/// Generator for the two timer lengths, drawn from seeded uniform
/// distributions so a cluster can be made deterministic under test.
pub struct TimerLength {
    rng: StdRng,
    leader: Uniform<u64>,
    election: Uniform<u64>,
}

impl TimerLength {
    /// `leader_ms` and `election_ms` are the average periods; actual values
    /// are drawn uniformly from `avg - fuzz/2 ..= avg + fuzz/2`.
    pub fn new(seed: u64, leader_ms: u64, election_ms: u64, fuzz_ms: u64) -> TimerLength {
        let spread = |avg: u64| {
            let half = fuzz_ms / 2;
            Uniform::new_inclusive(avg.saturating_sub(half), avg + half)
                .expect("timer bounds are ordered")
        };
        TimerLength {
            rng: StdRng::seed_from_u64(seed),
            leader: spread(leader_ms),
            election: spread(election_ms),
        }
    }

    /// Draw the next timer duration of the given kind.
    pub fn duration(&mut self, kind: TimeoutKind) -> Duration {
        let ms = match kind {
            TimeoutKind::Leader => self.leader.sample(&mut self.rng),
            TimeoutKind::Election => self.election.sample(&mut self.rng),
        };
        tracing::trace!(?kind, ms, "timeout requested");
        Duration::from_millis(ms)
    }
}

/// The consensus controller for one node.
pub struct Controller<T: Transport> {
    transport: T,
    timers: TimerLength,
    state: RaftState<Request>,
    client: KvClient,

    rx_rpc: UnboundedReceiver<(NodeId, StateMessage<Request>)>,
    rx_timeout: UnboundedReceiver<TimeoutKind>,
    rx_commit: UnboundedReceiver<Request>,
}

impl<T: Transport> Controller<T> {
    /// Assemble the controller around a recovered journal.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        log: Log<Request>,
        transport: T,
        timers: TimerLength,
    ) -> Controller<T> {
        let (tx_rpc, rx_rpc) = mpsc::unbounded_channel();
        let (tx_timeout, rx_timeout) = mpsc::unbounded_channel();
        let (tx_commit, rx_commit) = mpsc::unbounded_channel();

        let state = RaftState::new(
            id,
            peers,
            log,
            StateHandlers {
                rpc: tx_rpc,
                timeout: tx_timeout,
                commit: tx_commit,
            },
        );

        Controller {
            transport,
            timers,
            state,
            client: KvClient::new(),
            rx_rpc,
            rx_timeout,
            rx_commit,
        }
    }

    pub fn state(&self) -> &RaftState<Request> {
        &self.state
    }

    pub fn client(&self) -> &KvClient {
        &self.client
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Draw a concrete duration of the given kind; the event loop uses
    /// this to arm the very first timer.
    pub fn arm(&mut self, kind: TimeoutKind) -> Duration {
        self.timers.duration(kind)
    }

    /// Rebuild the KV version map from the journal's committed prefix.
    /// Called once at startup, before anything is dispatched.
    pub fn bootstrap(&mut self) {
        let client = &mut self.client;
        self.state.replay_committed(|request| client.replay(request));
        tracing::info!(
            commit_index = self.state.log().commit_index(),
            "replayed committed entries into the version map"
        );
    }

    /// Route one inbound envelope to its module handler. Returns the next
    /// timer to arm, if the handlers asked for one.
    pub fn dispatch(
        &mut self,
        from: &NodeId,
        envelope: Envelope,
        listener: &mut dyn ConsensusListener,
    ) -> Result<Option<Duration>, DispatchError> {
        match envelope.module.as_str() {
            MODULE_STATE => {
                let msg: StateMessage<Request> = serde_json::from_value(envelope.content)
                    .map_err(|source| DispatchError::BadContent {
                        module: MODULE_STATE,
                        source,
                    })?;
                tracing::debug!(%from, msg = %msg.summary(), "dispatching state message");
                match msg {
                    StateMessage::AppendEntries(rpc) => {
                        let response = self.state.handle_append_entries(rpc)?;
                        self.transport.send(
                            from,
                            Envelope::new(
                                MODULE_STATE,
                                &StateMessage::<Request>::AppendEntriesResponse(response),
                            ),
                        );
                    }
                    StateMessage::AppendEntriesResponse(rpc) => {
                        self.state.handle_append_entries_response(from, rpc)?;
                    }
                    StateMessage::RequestVote(rpc) => {
                        let response = self.state.handle_request_vote(rpc)?;
                        self.transport.send(
                            from,
                            Envelope::new(
                                MODULE_STATE,
                                &StateMessage::<Request>::RequestVoteResponse(response),
                            ),
                        );
                    }
                    StateMessage::RequestVoteResponse(rpc) => {
                        self.state.handle_request_vote_response(from, rpc)?;
                    }
                }
                Ok(self.drain(listener))
            }
            MODULE_CLIENT => {
                let request: Request = serde_json::from_value(envelope.content).map_err(
                    |source| DispatchError::BadContent {
                        module: MODULE_CLIENT,
                        source,
                    },
                )?;
                self.submit(request, listener)
            }
            other => Err(DispatchError::UnknownModule(other.to_owned())),
        }
    }

    /// Submit a KV request, locally originated or forwarded.
    ///
    /// On the leader a valid request is appended to the log; elsewhere it
    /// is forwarded to the known leader or dropped. Done and invalid
    /// requests are dropped silently either way.
    pub fn submit(
        &mut self,
        request: Request,
        listener: &mut dyn ConsensusListener,
    ) -> Result<Option<Duration>, DispatchError> {
        if self.state.role().is_leader() {
            match self.client.check(&request) {
                Validity::Valid => {
                    self.client.note_pending(&request);
                    self.state.append(request)?;
                }
                validity => {
                    tracing::info!(request = %request.summary(), ?validity, "dropping request");
                }
            }
        } else {
            match self.client.check(&request) {
                Validity::Valid => match self.state.leader().cloned() {
                    Some(leader) => {
                        tracing::debug!(%leader, request = %request.summary(), "forwarding request");
                        self.transport
                            .send(&leader, Envelope::new(MODULE_CLIENT, &request));
                    }
                    None => {
                        tracing::info!(request = %request.summary(), "no known leader; dropping request");
                    }
                },
                validity => {
                    tracing::info!(request = %request.summary(), ?validity, "dropping request");
                }
            }
        }
        Ok(self.drain(listener))
    }

    /// Handler for the armed timer firing.
    pub fn on_timeout(
        &mut self,
        listener: &mut dyn ConsensusListener,
    ) -> Result<Option<Duration>, DispatchError> {
        self.state.timeout()?;
        Ok(self.drain(listener))
    }

    /// Drain the state handler channels: outbound RPCs to the transport,
    /// commits to the client (and through it the listener), and the last
    /// timer request into a concrete duration.
    fn drain(&mut self, listener: &mut dyn ConsensusListener) -> Option<Duration> {
        while let Ok((target, msg)) = self.rx_rpc.try_recv() {
            self.transport
                .send(&target, Envelope::new(MODULE_STATE, &msg));
        }

        while let Ok(request) = self.rx_commit.try_recv() {
            self.client.commit(&request, listener);
        }

        let mut kind = None;
        while let Ok(requested) = self.rx_timeout.try_recv() {
            kind = Some(requested);
        }
        kind.map(|kind| self.timers.duration(kind))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::request::{Add, Delete, Rename, Update};

    /// Transport that records what it was asked to send.
    #[derive(Default)]
    struct SinkTransport {
        sent: Vec<(NodeId, Envelope)>,
    }

    impl Transport for SinkTransport {
        fn send(&mut self, target: &NodeId, envelope: Envelope) {
            self.sent.push((target.clone(), envelope));
        }

        fn broadcast(&mut self, envelope: Envelope) {
            self.sent.push(("*".to_owned(), envelope));
        }
    }

    struct NullListener;

    impl ConsensusListener for NullListener {
        fn on_add(&mut self, _: &Add) {}
        fn on_update(&mut self, _: &Update) {}
        fn on_delete(&mut self, _: &Delete) {}
        fn on_rename(&mut self, _: &Rename) {}
    }

    fn controller(id: &str, peers: &[&str], dir: &TempDir) -> Controller<SinkTransport> {
        let log = Log::open(dir.path().join(format!("journal-{id}"))).unwrap();
        Controller::new(
            id.to_owned(),
            peers.iter().map(|p| (*p).to_owned()).collect(),
            log,
            SinkTransport::default(),
            TimerLength::new(42, 150, 300, 50),
        )
    }

    fn add(key: &str) -> Request {
        Add {
            from: "foo".to_owned(),
            key: key.to_owned(),
            version: "v1".to_owned(),
        }
        .into()
    }

    #[test]
    fn timer_lengths_are_deterministic_and_bounded() {
        let mut a = TimerLength::new(7, 150, 300, 50);
        let mut b = TimerLength::new(7, 150, 300, 50);

        for _ in 0..64 {
            let kind = TimeoutKind::Election;
            let ours = a.duration(kind);
            assert_eq!(ours, b.duration(kind));
            assert!((275..=325).contains(&(ours.as_millis() as u64)));

            let lead = a.duration(TimeoutKind::Leader);
            b.duration(TimeoutKind::Leader);
            assert!((125..=175).contains(&(lead.as_millis() as u64)));
        }
    }

    #[test]
    fn unknown_module_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut sut = controller("foo", &["bar"], &dir);

        let err = sut
            .dispatch(
                &"bar".to_owned(),
                Envelope {
                    module: "frobnicate".to_owned(),
                    content: serde_json::json!({}),
                },
                &mut NullListener,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownModule(module) if module == "frobnicate"));
    }

    #[test]
    fn follower_forwards_valid_requests_to_the_leader() {
        let dir = TempDir::new().unwrap();
        let mut sut = controller("foo", &["bar", "baz"], &dir);

        // No leader known yet: dropped.
        sut.submit(add("root"), &mut NullListener).unwrap();
        assert!(sut.transport().sent.is_empty());

        // Learn of a leader via a heartbeat.
        sut.dispatch(
            &"bar".to_owned(),
            Envelope::new(
                MODULE_STATE,
                &StateMessage::<Request>::AppendEntries(crate::rpc::AppendEntriesRequest {
                    term: 1,
                    leader_id: "bar".to_owned(),
                    prev_log_term: 0,
                    prev_log_index: 0,
                    entries: vec![],
                    leader_commit: 0,
                }),
            ),
            &mut NullListener,
        )
        .unwrap();
        sut.transport_mut().sent.clear();

        sut.submit(add("root"), &mut NullListener).unwrap();
        let (target, envelope) = &sut.transport().sent[0];
        assert_eq!(target, "bar");
        assert_eq!(envelope.module, MODULE_CLIENT);
        assert_eq!(envelope.content["type"], "add");
    }

    #[test]
    fn single_node_leader_commits_locally() {
        let dir = TempDir::new().unwrap();
        let mut sut = controller("foo", &[], &dir);
        sut.on_timeout(&mut NullListener).unwrap();
        assert!(sut.state().role().is_leader());

        sut.submit(add("root"), &mut NullListener).unwrap();
        assert!(sut.client().exists("root"));
        assert_eq!(sut.state().log().commit_index(), 1);

        // Resubmission is already done and leaves no second entry.
        sut.submit(add("root"), &mut NullListener).unwrap();
        assert_eq!(sut.state().log().last_index(), 1);
    }
}
