//! Raft RPC data types.
//!
//! Responses echo the request they answer, so the leader's response
//! handlers can recover which slice of the log a reply covers without
//! keeping per-request bookkeeping.

use serde::{Deserialize, Serialize};

use crate::{AppData, LogIndex, MessageSummary, NodeId, Term};

/// An RPC sent by the leader to replicate log entries, and as a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The term describing the entry immediately preceding the new ones.
    pub prev_log_term: Term,
    /// The index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// The new entries to store; empty for heartbeats.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<EntryPayload<D>>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

/// One replicated entry as carried on the wire: the term it was created
/// in plus its action. The receiver derives each entry's spawn term from
/// its predecessor in the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct EntryPayload<D: AppData> {
    pub term: Term,
    pub action: D,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log=({}, {}), leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an [`AppendEntriesRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct AppendEntriesResponse<D: AppData> {
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower's log matched `prev_log_*` and the entries were
    /// stored.
    pub success: bool,
    /// The request being answered.
    #[serde(bound = "D: AppData")]
    pub request: AppendEntriesRequest<D>,
}

impl<D: AppData> MessageSummary for AppendEntriesResponse<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, success={}, answering=[{}]",
            self.term,
            self.success,
            self.request.summary()
        )
    }
}

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, candidate={}, last_log=({}, {})",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: Term,
    /// True if the candidate received this node's vote.
    pub vote_granted: bool,
    /// The request being answered.
    pub request: VoteRequest,
}

impl MessageSummary for VoteResponse {
    fn summary(&self) -> String {
        format!("term={}, granted={}", self.term, self.vote_granted)
    }
}
