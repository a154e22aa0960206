//! The two-level wire envelope and the consensus module payloads.
//!
//! Every line on the wire is one `{"module": ..., "content": ...}` object.
//! The envelope names the module-level dispatcher the content belongs to;
//! the content carries its own `type` tag.

use serde::{Deserialize, Serialize};

use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::{AppData, MessageSummary};

/// Module name for Raft protocol traffic.
pub const MODULE_STATE: &str = "raftstate";
/// Module name for forwarded key-value requests.
pub const MODULE_CLIENT: &str = "raftclient";

/// A single wire message: module routing plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub module: String,
    pub content: serde_json::Value,
}

impl Envelope {
    /// Wrap a serializable payload for the given module.
    ///
    /// Serialization of our own message types cannot fail; a failure here
    /// is a programming error, so it panics rather than propagating.
    pub fn new(module: &str, content: &impl Serialize) -> Envelope {
        Envelope {
            module: module.to_owned(),
            content: serde_json::to_value(content).expect("envelope content must serialize"),
        }
    }
}

/// Protocol messages handled by the Raft state machine module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", bound = "D: AppData")]
pub enum StateMessage<D: AppData> {
    AppendEntries(AppendEntriesRequest<D>),
    AppendEntriesResponse(AppendEntriesResponse<D>),
    RequestVote(VoteRequest),
    RequestVoteResponse(VoteResponse),
}

impl<D: AppData> MessageSummary for StateMessage<D> {
    fn summary(&self) -> String {
        match self {
            StateMessage::AppendEntries(rpc) => format!("append_entries: {}", rpc.summary()),
            StateMessage::AppendEntriesResponse(rpc) => {
                format!("append_entries_response: {}", rpc.summary())
            }
            StateMessage::RequestVote(rpc) => format!("request_vote: {}", rpc.summary()),
            StateMessage::RequestVoteResponse(rpc) => {
                format!("request_vote_response: {}", rpc.summary())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn state_messages_round_trip_through_envelopes() {
        let msg: StateMessage<String> = StateMessage::RequestVote(VoteRequest {
            term: 3,
            candidate_id: "foo".to_owned(),
            last_log_term: 2,
            last_log_index: 7,
        });

        let envelope = Envelope::new(MODULE_STATE, &msg);
        assert_eq!(envelope.module, MODULE_STATE);
        assert_eq!(envelope.content["type"], "request_vote");

        let back: StateMessage<String> = serde_json::from_value(envelope.content).unwrap();
        assert_eq!(back, msg);
    }
}
