//! The volatile Raft state machine: roles, elections, replication and
//! commit advancement.
//!
//! [`RaftState`] owns the journal and speaks to the rest of the system
//! through [`StateHandlers`], a bundle of channels the controller drains:
//! outbound protocol messages, timeout requests and committed actions.
//! Everything runs on the one event loop, so the handlers are the only
//! coupling surface and no locking is needed.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;

use crate::error::LogError;
use crate::log::{Log, Record};
use crate::message::StateMessage;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, EntryPayload, VoteRequest, VoteResponse,
};
use crate::{AppData, LogIndex, MessageSummary, NodeId, Term};

/// The maximum number of entries carried by one AppendEntries RPC.
pub const DEFAULT_TRANSFER_LIMIT: usize = 50;

/// The role a node is currently playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Replicating entries from the leader; times out into candidacy.
    Follower,
    /// Campaigning to become the cluster leader.
    Candidate,
    /// The cluster leader.
    Leader,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// Which timer the state machine wants armed next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The short heartbeat period of a leader.
    Leader,
    /// The longer, randomised period that triggers a new election.
    Election,
}

/// The channel bundle through which the state machine reaches the rest of
/// the system.
pub struct StateHandlers<D: AppData> {
    /// Outbound protocol messages, addressed per peer.
    pub rpc: mpsc::UnboundedSender<(NodeId, StateMessage<D>)>,
    /// Requests to re-arm the single outstanding timer.
    pub timeout: mpsc::UnboundedSender<TimeoutKind>,
    /// Committed actions, in strict index order.
    pub commit: mpsc::UnboundedSender<D>,
}

/// Per-peer replication bookkeeping, kept only while leading.
#[derive(Clone, Copy, Debug)]
struct PeerIndex {
    /// The next entry to send to this peer.
    next: LogIndex,
    /// The highest entry known replicated on this peer; `None` until the
    /// peer has confirmed any prefix at all.
    matched: Option<LogIndex>,
}

/// The Raft state machine for one node.
pub struct RaftState<D: AppData> {
    id: NodeId,
    peers: Vec<NodeId>,
    transfer_limit: usize,

    log: Log<D>,

    role: Role,
    leader: Option<NodeId>,

    /// Volatile on candidates: nodes that granted us their vote this term.
    votes: BTreeSet<NodeId>,

    /// Volatile on leaders.
    peer_index: BTreeMap<NodeId, PeerIndex>,

    /// The last entry handed to the commit channel.
    last_applied: LogIndex,

    handlers: StateHandlers<D>,
}

impl<D: AppData> RaftState<D> {
    /// Build the state machine around a recovered journal.
    ///
    /// `peers` is the rest of the cluster, not including this node.
    pub fn new(id: NodeId, peers: Vec<NodeId>, log: Log<D>, handlers: StateHandlers<D>) -> Self {
        RaftState {
            id,
            peers,
            transfer_limit: DEFAULT_TRANSFER_LIMIT,
            log,
            role: Role::Follower,
            leader: None,
            votes: BTreeSet::new(),
            peer_index: BTreeMap::new(),
            last_applied: 0,
            handlers,
        }
    }

    /// Override the per-RPC entry batch limit.
    pub fn with_transfer_limit(mut self, limit: usize) -> Self {
        self.transfer_limit = limit.max(1);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The current leader, if one is known for this term.
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn term(&self) -> Term {
        self.log.term()
    }

    pub fn log(&self) -> &Log<D> {
        &self.log
    }

    /// Replay every committed action through `apply`, then mark them
    /// applied. Called once at startup to rebuild in-memory state from the
    /// journal; nothing is sent to the commit channel.
    pub fn replay_committed(&mut self, mut apply: impl FnMut(&D)) {
        let upto = self.log.commit_index().min(self.log.last_index());
        for index in 1..=upto {
            if let Ok(entry) = self.log.entry(index) {
                apply(&entry.action);
            }
        }
        self.last_applied = upto;
    }

    /// Handler called when the armed timer fires.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub fn timeout(&mut self) -> Result<(), LogError> {
        match self.role {
            Role::Follower | Role::Candidate => {
                tracing::info!("broadcasting candidacy for new election term");
                let term = self.log.term() + 1;
                self.log_append(Record::Term { term })?;
                self.transition_candidate()?;
                self.request_timeout(TimeoutKind::Election);
            }
            Role::Leader => {
                self.heartbeat_all()?;
                self.request_timeout(TimeoutKind::Leader);
            }
        }
        Ok(())
    }

    /// Append a new entry to our own log as leader and start replicating
    /// it. Callers must have checked `role().is_leader()`.
    #[tracing::instrument(level = "debug", skip(self, action), fields(id = %self.id))]
    pub fn append(&mut self, action: D) -> Result<(), LogError> {
        let last = self.log.last_index();
        let spawn_term = if last == 0 { 0 } else { self.log.entry(last)?.term };
        self.log.append(Record::Entry {
            term: self.log.term(),
            index: last + 1,
            spawn_term,
            action,
        })?;

        if self.peers.is_empty() {
            // Single-node cluster: a majority of one.
            self.check_commit()?;
        } else {
            self.heartbeat_all()?;
        }
        Ok(())
    }

    /// AppendEntries RPC handler.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id = %self.id, rpc = %rpc.summary()))]
    pub fn handle_append_entries(
        &mut self,
        rpc: AppendEntriesRequest<D>,
    ) -> Result<AppendEntriesResponse<D>, LogError> {
        if rpc.term < self.log.term() {
            tracing::info!(from = %rpc.leader_id, "received stale append_entries request");
            let term = self.log.term();
            return Ok(respond(term, false, rpc));
        }

        // Our term <= theirs: whatever we were, we are a follower now.
        if self.role.is_candidate() {
            tracing::info!(term = rpc.term, leader = %rpc.leader_id, "stepping down as candidate");
            self.role = Role::Follower;
        }
        if self.role.is_leader() {
            if rpc.term == self.log.term() {
                tracing::error!(term = rpc.term, other = %rpc.leader_id, "two leaders for term");
            }
            self.role = Role::Follower;
            self.leader = None;
        }

        self.request_timeout(TimeoutKind::Election);

        if rpc.term > self.log.term() {
            self.log_append(Record::Term { term: rpc.term })?;
        }
        if self.leader.is_none() {
            self.leader = Some(rpc.leader_id.clone());
        }

        if !self.log.matches(rpc.prev_log_term, rpc.prev_log_index) {
            let term = self.log.term();
            return Ok(respond(term, false, rpc));
        }

        // We've found the last consistent point in our log, so get adding.
        // Each entry's spawn term is its predecessor's term in the stream.
        let entries = rpc.entries.clone();
        let mut prev_term = rpc.prev_log_term;
        for (offset, payload) in entries.iter().enumerate() {
            let index = rpc.prev_log_index + 1 + offset as LogIndex;

            // Entries we already hold are skipped, not rewritten.
            if index <= self.log.last_index() && self.log.entry(index)?.term == payload.term {
                prev_term = payload.term;
                continue;
            }

            let record = Record::Entry {
                term: payload.term,
                index,
                spawn_term: prev_term,
                action: payload.action.clone(),
            };
            if let Err(err) = self.log_append(record) {
                tracing::error!(error = %err, "unexpected failure on log append");
                let term = self.log.term();
                return Ok(respond(term, false, rpc));
            }
            prev_term = payload.term;
        }
        if !rpc.entries.is_empty() {
            tracing::info!(count = rpc.entries.len(), from = %rpc.leader_id, "added log entries");
        }

        let target = rpc.leader_commit.min(self.log.last_index());
        if target > self.log.commit_index() {
            self.log.set_commit_index(target)?;
            self.commit_available();
        }

        let term = self.log.term();
        Ok(respond(term, true, rpc))
    }

    /// The response handler for AppendEntries, leader side.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id = %self.id, from = %from))]
    pub fn handle_append_entries_response(
        &mut self,
        from: &NodeId,
        rpc: AppendEntriesResponse<D>,
    ) -> Result<(), LogError> {
        if rpc.term == self.log.term() {
            if !self.role.is_leader() {
                tracing::info!("ignoring append_entries response because we're not leading");
                return Ok(());
            }
            if rpc.success {
                let matched = rpc.request.prev_log_index + rpc.request.entries.len() as LogIndex;
                tracing::info!(
                    count = rpc.request.entries.len(),
                    matched,
                    "entries accepted by peer"
                );
                if let Some(peer) = self.peer_index.get_mut(from) {
                    peer.matched = Some(matched);
                    peer.next = matched + 1;
                }
                self.check_commit()?;

                // If there are remaining entries, pass them on.
                let more = self
                    .peer_index
                    .get(from)
                    .is_some_and(|peer| peer.next <= self.log.last_index());
                if more {
                    self.heartbeat_to(&from.clone())?;
                }
            } else {
                if let Some(peer) = self.peer_index.get_mut(from) {
                    if peer.next > 1 {
                        peer.next -= 1;
                    }
                    peer.matched = None;
                }
                self.heartbeat_to(&from.clone())?;
            }
        } else if rpc.term > self.log.term() {
            // A new term has started; revert to follower.
            self.log_append(Record::Term { term: rpc.term })?;
        }
        // An older term is stale; ignore it.
        Ok(())
    }

    /// RequestVote RPC handler.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id = %self.id, rpc = %rpc.summary()))]
    pub fn handle_request_vote(&mut self, rpc: VoteRequest) -> Result<VoteResponse, LogError> {
        if rpc.term < self.log.term() {
            tracing::info!(from = %rpc.candidate_id, "received stale request_vote");
            return Ok(VoteResponse {
                term: self.log.term(),
                vote_granted: false,
                request: rpc,
            });
        }

        if rpc.term > self.log.term() {
            tracing::info!(term = rpc.term, "received vote request from new term");
            self.log_append(Record::Term { term: rpc.term })?;
        }

        let repeat_or_fresh = match self.log.last_vote() {
            None => true,
            Some(node) => *node == rpc.candidate_id,
        };

        // Is the candidate's log at least as up to date as ours?
        let grant = repeat_or_fresh && {
            let (last_term, last_index) = self.last_log_info()?;
            last_index == 0
                || rpc.last_log_term > last_term
                || (rpc.last_log_term == last_term && rpc.last_log_index >= last_index)
        };

        if grant {
            // Persist the vote before replying.
            self.log_append(Record::Vote {
                term: self.log.term(),
                node: rpc.candidate_id.clone(),
            })?;
            self.request_timeout(TimeoutKind::Election);
        }

        Ok(VoteResponse {
            term: self.log.term(),
            vote_granted: grant,
            request: rpc,
        })
    }

    /// The response handler for RequestVote, candidate side.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(id = %self.id, from = %from))]
    pub fn handle_request_vote_response(
        &mut self,
        from: &NodeId,
        rpc: VoteResponse,
    ) -> Result<(), LogError> {
        if rpc.term == self.log.term() {
            if self.role.is_candidate() {
                if rpc.vote_granted {
                    tracing::info!(term = self.log.term(), "received a vote");
                    self.votes.insert(from.clone());
                }
                if self.votes.len() as u64 >= self.majority() {
                    tracing::info!("received a majority of votes, becoming leader");
                    self.transition_leader()?;
                }
            }
        } else if rpc.term > self.log.term() {
            self.log_append(Record::Term { term: rpc.term })?;
        }
        // An older term is stale; ignore it.
        Ok(())
    }

    /// Heartbeat every peer: up-to-date and unprobed peers get empty
    /// append requests, the rest get their next batch of entries.
    fn heartbeat_all(&mut self) -> Result<(), LogError> {
        for node in self.peers.clone() {
            self.heartbeat_to(&node)?;
        }
        Ok(())
    }

    fn heartbeat_to(&mut self, node: &NodeId) -> Result<(), LogError> {
        let Some(peer) = self.peer_index.get(node).copied() else {
            return Ok(());
        };
        let last = self.log.last_index();

        let (prev_log_term, prev_log_index) = if peer.next <= 1 {
            (0, 0)
        } else {
            let entry = self.log.entry(peer.next - 1)?;
            (entry.term, entry.index)
        };

        let entries = if peer.next == last + 1 || peer.matched.is_none() {
            // Fully up to date, or still finding the match point.
            tracing::info!(%node, "empty heartbeat");
            Vec::new()
        } else {
            let upto = last.min(peer.next + self.transfer_limit as LogIndex - 1);
            let mut batch = Vec::with_capacity((upto + 1 - peer.next) as usize);
            for index in peer.next..=upto {
                let entry = self.log.entry(index)?;
                batch.push(EntryPayload {
                    term: entry.term,
                    action: entry.action.clone(),
                });
            }
            batch
        };

        let rpc = AppendEntriesRequest {
            term: self.log.term(),
            leader_id: self.id.clone(),
            prev_log_term,
            prev_log_index,
            entries,
            leader_commit: self.log.commit_index(),
        };
        self.send(node, StateMessage::AppendEntries(rpc));
        Ok(())
    }

    /// Advance the commit frontier to the largest index replicated on a
    /// majority whose entry is from the current term, then apply.
    fn check_commit(&mut self) -> Result<(), LogError> {
        let majority = self.majority();
        let mut target = self.log.commit_index();

        for trial in self.log.commit_index() + 1..=self.log.last_index() {
            // Only entries of the current term commit by counting; earlier
            // ones ride along under the marker of a later index.
            if self.log.entry(trial)?.term != self.log.term() {
                continue;
            }
            let have = 1 + self
                .peer_index
                .values()
                .filter(|peer| peer.matched.is_some_and(|m| m >= trial))
                .count() as u64;
            if have >= majority {
                target = trial;
            } else {
                break;
            }
        }

        if target > self.log.commit_index() {
            self.log.set_commit_index(target)?;
            self.commit_available();
        }
        Ok(())
    }

    /// Hand every newly committed action to the commit channel, in order.
    fn commit_available(&mut self) {
        while self.last_applied < self.log.commit_index()
            && self.last_applied < self.log.last_index()
        {
            let index = self.last_applied + 1;
            let Ok(entry) = self.log.entry(index) else {
                break;
            };
            let action = entry.action.clone();
            if self.handlers.commit.send(action).is_err() {
                tracing::warn!("commit channel closed");
            }
            self.last_applied = index;
        }
    }

    fn transition_candidate(&mut self) -> Result<(), LogError> {
        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();

        // Vote for yourself, and make a durable note of that.
        self.votes.insert(self.id.clone());
        let term = self.log.term();
        self.log_append(Record::Vote {
            term,
            node: self.id.clone(),
        })?;

        let (last_log_term, last_log_index) = self.last_log_info()?;
        for node in self.peers.clone() {
            self.send(
                &node,
                StateMessage::RequestVote(VoteRequest {
                    term,
                    candidate_id: self.id.clone(),
                    last_log_term,
                    last_log_index,
                }),
            );
        }

        if self.votes.len() as u64 >= self.majority() {
            self.transition_leader()?;
        }
        Ok(())
    }

    fn transition_leader(&mut self) -> Result<(), LogError> {
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());

        let next = self.log.last_index() + 1;
        self.peer_index = self
            .peers
            .iter()
            .map(|node| (node.clone(), PeerIndex { next, matched: None }))
            .collect();

        self.heartbeat_all()?;
        self.request_timeout(TimeoutKind::Leader);
        Ok(())
    }

    /// Write a record, reverting to follower if it advanced the term.
    fn log_append(&mut self, record: Record<D>) -> Result<(), LogError> {
        let outcome = self.log.append(record)?;
        if let Some(term) = outcome.term_advanced {
            tracing::info!(term, "updating to new term");
            self.role = Role::Follower;
            self.leader = None;
            self.votes.clear();
            self.request_timeout(TimeoutKind::Election);
        }
        Ok(())
    }

    fn last_log_info(&self) -> Result<(Term, LogIndex), LogError> {
        let last = self.log.last_index();
        if last == 0 {
            Ok((0, 0))
        } else {
            Ok((self.log.entry(last)?.term, last))
        }
    }

    /// The number of nodes required for a majority, counting ourselves.
    fn majority(&self) -> u64 {
        (self.peers.len() as u64 + 1) / 2 + 1
    }

    fn send(&self, target: &NodeId, msg: StateMessage<D>) {
        if self.handlers.rpc.send((target.clone(), msg)).is_err() {
            tracing::warn!("rpc channel closed");
        }
    }

    fn request_timeout(&self, kind: TimeoutKind) {
        let _ = self.handlers.timeout.send(kind);
    }
}

fn respond<D: AppData>(
    term: Term,
    success: bool,
    request: AppendEntriesRequest<D>,
) -> AppendEntriesResponse<D> {
    AppendEntriesResponse {
        term,
        success,
        request,
    }
}
