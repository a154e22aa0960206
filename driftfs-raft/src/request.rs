//! The four replicated mutation kinds carried as Raft entry actions.
//!
//! Every request names the node it originates `from` and the key it
//! touches; versions are opaque strings minted by the writer. On the wire
//! and in the journal these serialize as flat JSON objects with a
//! lowercase `type` tag.

use serde::{Deserialize, Serialize};

use crate::{MessageSummary, NodeId};

/// Create `key` at `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Add {
    pub from: NodeId,
    pub key: String,
    pub version: String,
}

/// Replace `old_version` of `key` with `new_version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub from: NodeId,
    pub key: String,
    pub old_version: String,
    pub new_version: String,
}

/// Remove `key` at `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delete {
    pub from: NodeId,
    pub key: String,
    pub version: String,
}

/// Move `key` to `new_key`, preserving `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    pub from: NodeId,
    pub key: String,
    pub new_key: String,
    pub version: String,
}

/// Any of the four mutation kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Add(Add),
    Update(Update),
    Delete(Delete),
    Rename(Rename),
}

impl Request {
    /// The node this request originates from.
    pub fn from(&self) -> &NodeId {
        match self {
            Request::Add(r) => &r.from,
            Request::Update(r) => &r.from,
            Request::Delete(r) => &r.from,
            Request::Rename(r) => &r.from,
        }
    }

    /// The key this request mutates (the source key for renames).
    pub fn key(&self) -> &str {
        match self {
            Request::Add(r) => &r.key,
            Request::Update(r) => &r.key,
            Request::Delete(r) => &r.key,
            Request::Rename(r) => &r.key,
        }
    }
}

impl From<Add> for Request {
    fn from(value: Add) -> Self {
        Request::Add(value)
    }
}

impl From<Update> for Request {
    fn from(value: Update) -> Self {
        Request::Update(value)
    }
}

impl From<Delete> for Request {
    fn from(value: Delete) -> Self {
        Request::Delete(value)
    }
}

impl From<Rename> for Request {
    fn from(value: Rename) -> Self {
        Request::Rename(value)
    }
}

impl MessageSummary for Request {
    fn summary(&self) -> String {
        match self {
            Request::Add(r) => format!("add {}@{} from {}", r.key, r.version, r.from),
            Request::Update(r) => format!(
                "update {}: {} -> {} from {}",
                r.key, r.old_version, r.new_version, r.from
            ),
            Request::Delete(r) => format!("delete {}@{} from {}", r.key, r.version, r.from),
            Request::Rename(r) => format!(
                "rename {} -> {} @{} from {}",
                r.key, r.new_key, r.version, r.from
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn requests_serialize_with_type_tags() {
        let add: Request = Add {
            from: "baz".to_owned(),
            key: "root".to_owned(),
            version: "0".to_owned(),
        }
        .into();

        let json = serde_json::to_value(&add).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "add",
                "from": "baz",
                "key": "root",
                "version": "0",
            })
        );

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, add);
    }

    #[test]
    fn unknown_type_tag_fails_to_parse() {
        let err = serde_json::from_value::<Request>(serde_json::json!({
            "type": "explode",
            "from": "baz",
            "key": "root",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("explode"));
    }
}
