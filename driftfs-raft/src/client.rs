//! Client interface to the replicated key-value layer.
//!
//! [`KvClient`] provides the per-key version map built from committed Raft
//! entries, and the validity rules that serialise concurrent requests. The
//! values behind these versions live elsewhere in the system (the change
//! store); only the version bookkeeping is replicated.
//!
//! On the leader, requests that pass the validity check are handed to Raft
//! and tracked in a pending map until their commit lands, so later requests
//! validate against what the map is about to become. Followers validate
//! against their committed map and forward to the leader.

use std::collections::HashMap;

use crate::request::{Add, Delete, Rename, Request, Update};
use crate::{ConsensusListener, MessageSummary, NodeId};

/// What the validity check concluded about a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// No conflict; the request may be appended to the log.
    Valid,
    /// The request's effect is already (or about to be) in place.
    Done,
    /// The request conflicts with the current state and is dropped.
    Invalid,
}

/// A key's version and the node that produced it.
pub type VersionInfo = (String, NodeId);

/// The tracked effect of an in-flight request: the version the key will
/// hold once the request commits, or `None` if the key is being removed.
type PendingEntry = Option<VersionInfo>;

/// The replicated key-value client for one node.
#[derive(Debug, Default)]
pub struct KvClient {
    /// Committed state: key to (version, originating node).
    versions: HashMap<String, VersionInfo>,
    /// Leader-side map of effects in flight to Raft, keyed by key.
    pending: HashMap<String, PendingEntry>,
}

impl KvClient {
    pub fn new() -> KvClient {
        KvClient::default()
    }

    /// Check that a key exists in the committed map.
    pub fn exists(&self, key: &str) -> bool {
        self.versions.contains_key(key)
    }

    /// The committed version info for `key`.
    pub fn version(&self, key: &str) -> Option<&VersionInfo> {
        self.versions.get(key)
    }

    /// Iterate the committed map.
    pub fn versions(&self) -> impl Iterator<Item = (&String, &VersionInfo)> {
        self.versions.iter()
    }

    /// Run the validity rules for `request` against the committed map,
    /// consulting the pending map first wherever it has an opinion.
    pub fn check(&self, request: &Request) -> Validity {
        match request {
            Request::Add(rpc) => match self.effective(&rpc.key) {
                None => Validity::Valid,
                Some((version, _)) if *version == rpc.version => Validity::Done,
                Some(_) => Validity::Invalid,
            },
            Request::Update(rpc) => match self.effective(&rpc.key) {
                Some((version, _)) if *version == rpc.new_version => Validity::Done,
                Some((version, _)) if *version == rpc.old_version => Validity::Valid,
                _ => Validity::Invalid,
            },
            Request::Delete(rpc) => match self.effective(&rpc.key) {
                None => Validity::Done,
                Some((version, _)) if *version == rpc.version => Validity::Valid,
                Some(_) => Validity::Invalid,
            },
            Request::Rename(rpc) => {
                let from = self.effective(&rpc.key);
                let to = self.effective(&rpc.new_key);
                match (from, to) {
                    (None, Some((version, _))) if *version == rpc.version => Validity::Done,
                    (Some((version, _)), None) if *version == rpc.version => Validity::Valid,
                    _ => Validity::Invalid,
                }
            }
        }
    }

    /// Record the effect of a request the leader just handed to Raft, so
    /// later validity checks see it.
    pub fn note_pending(&mut self, request: &Request) {
        match request {
            Request::Add(rpc) => {
                self.pending
                    .insert(rpc.key.clone(), Some((rpc.version.clone(), rpc.from.clone())));
            }
            Request::Update(rpc) => {
                self.pending.insert(
                    rpc.key.clone(),
                    Some((rpc.new_version.clone(), rpc.from.clone())),
                );
            }
            Request::Delete(rpc) => {
                self.pending.insert(rpc.key.clone(), None);
            }
            Request::Rename(rpc) => {
                self.pending.insert(rpc.key.clone(), None);
                self.pending.insert(
                    rpc.new_key.clone(),
                    Some((rpc.version.clone(), rpc.from.clone())),
                );
            }
        }
    }

    /// Apply a committed entry to the version map and notify the listener.
    ///
    /// Commits arrive pre-serialised by the leader, so conflicts should be
    /// impossible; they are checked anyway and a conflicting commit is
    /// logged and skipped rather than applied.
    pub fn commit(&mut self, request: &Request, listener: &mut dyn ConsensusListener) {
        // Validity of the commit is judged against committed state only;
        // the pending map tracks our own unfinished proposals.
        match self.check_committed(request) {
            Validity::Invalid => {
                tracing::error!(request = %request.summary(), "conflicting commit; skipping");
                debug_assert!(false, "conflicting commit: {}", request.summary());
                self.clear_pending(request);
                return;
            }
            Validity::Done => {
                tracing::debug!(request = %request.summary(), "commit already in effect");
            }
            Validity::Valid => self.apply(request),
        }

        self.clear_pending(request);

        match request {
            Request::Add(rpc) => {
                tracing::info!(key = %rpc.key, version = %rpc.version, "committing add");
                listener.on_add(rpc);
            }
            Request::Update(rpc) => {
                tracing::info!(
                    key = %rpc.key,
                    old = %rpc.old_version,
                    new = %rpc.new_version,
                    "committing update"
                );
                listener.on_update(rpc);
            }
            Request::Delete(rpc) => {
                tracing::info!(key = %rpc.key, version = %rpc.version, "committing delete");
                listener.on_delete(rpc);
            }
            Request::Rename(rpc) => {
                tracing::info!(key = %rpc.key, new_key = %rpc.new_key, "committing rename");
                listener.on_rename(rpc);
            }
        }
    }

    /// Apply a committed entry during startup replay: no listener, no
    /// conflict noise. The journal was validated when the entries were
    /// first committed.
    pub fn replay(&mut self, request: &Request) {
        if self.check_committed(request) == Validity::Valid {
            self.apply(request);
        }
    }

    fn apply(&mut self, request: &Request) {
        match request {
            Request::Add(rpc) => {
                self.versions
                    .insert(rpc.key.clone(), (rpc.version.clone(), rpc.from.clone()));
            }
            Request::Update(rpc) => {
                self.versions
                    .insert(rpc.key.clone(), (rpc.new_version.clone(), rpc.from.clone()));
            }
            Request::Delete(rpc) => {
                self.versions.remove(&rpc.key);
            }
            Request::Rename(rpc) => {
                if let Some((version, _)) = self.versions.remove(&rpc.key) {
                    self.versions
                        .insert(rpc.new_key.clone(), (version, rpc.from.clone()));
                }
            }
        }
    }

    /// The validity rules evaluated against committed state alone.
    fn check_committed(&self, request: &Request) -> Validity {
        let committed = |key: &str| self.versions.get(key);
        match request {
            Request::Add(rpc) => match committed(&rpc.key) {
                None => Validity::Valid,
                Some((version, _)) if *version == rpc.version => Validity::Done,
                Some(_) => Validity::Invalid,
            },
            Request::Update(rpc) => match committed(&rpc.key) {
                Some((version, _)) if *version == rpc.new_version => Validity::Done,
                Some((version, _)) if *version == rpc.old_version => Validity::Valid,
                _ => Validity::Invalid,
            },
            Request::Delete(rpc) => match committed(&rpc.key) {
                None => Validity::Done,
                Some((version, _)) if *version == rpc.version => Validity::Valid,
                Some(_) => Validity::Invalid,
            },
            Request::Rename(rpc) => match (committed(&rpc.key), committed(&rpc.new_key)) {
                (None, Some((version, _))) if *version == rpc.version => Validity::Done,
                (Some((version, _)), None) if *version == rpc.version => Validity::Valid,
                _ => Validity::Invalid,
            },
        }
    }

    /// The version a key will hold once in-flight requests commit, falling
    /// back to committed state when nothing is pending for it.
    fn effective(&self, key: &str) -> Option<&VersionInfo> {
        match self.pending.get(key) {
            Some(Some(info)) => Some(info),
            Some(None) => None,
            None => self.versions.get(key),
        }
    }

    /// Drop pending entries whose effect this commit delivers.
    fn clear_pending(&mut self, request: &Request) {
        match request {
            Request::Add(rpc) => {
                self.remove_pending_if(&rpc.key, Some((&rpc.version, &rpc.from)));
            }
            Request::Update(rpc) => {
                self.remove_pending_if(&rpc.key, Some((&rpc.new_version, &rpc.from)));
            }
            Request::Delete(rpc) => {
                self.remove_pending_if(&rpc.key, None);
            }
            Request::Rename(rpc) => {
                self.remove_pending_if(&rpc.key, None);
                self.remove_pending_if(&rpc.new_key, Some((&rpc.version, &rpc.from)));
            }
        }
    }

    fn remove_pending_if(&mut self, key: &str, expect: Option<(&String, &NodeId)>) {
        let matches = match (self.pending.get(key), expect) {
            (Some(None), None) => true,
            (Some(Some((version, from))), Some((v, f))) => version == v && from == f,
            _ => false,
        };
        if matches {
            self.pending.remove(key);
        }
    }
}
