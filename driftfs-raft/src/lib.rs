//! Consensus core for driftfs, a small replicated filesystem.
//!
//! This crate carries the three replicated-state subsystems: the durable
//! write-ahead journal ([`log::Log`]), the Raft state machine
//! ([`state::RaftState`]) and the key-value client built on top of committed
//! entries ([`client::KvClient`]), plus the [`controller::Controller`] that
//! wires them to a message transport.
//!
//! The crate is transport-agnostic: everything leaving a node goes through
//! the narrow [`Transport`] capability as a two-level `{module, content}`
//! envelope, and everything a committed entry implies for the host
//! application arrives through [`ConsensusListener`].

pub mod client;
pub mod controller;
pub mod error;
pub mod log;
pub mod message;
pub mod request;
pub mod rpc;
pub mod state;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::Envelope;
use crate::request::{Add, Delete, Rename, Update};

/// The identity of a cluster node, as configured in the node table.
pub type NodeId = String;

/// A Raft election term. Starts at 0; the first elected term is 1.
pub type Term = u64;

/// A journal index. Entries number from 1; 0 means "no entry".
pub type LogIndex = u64;

/// A trait defining application specific data carried by replicated entries.
pub trait AppData: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + 'static {}

impl<T> AppData for T where T: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + 'static {}

/// The outbound half of the message transport.
///
/// The connection pool behind this trait is an external collaborator; sends
/// are fire-and-forget enqueues. A failed send is the pool's problem: it
/// logs, presumes the peer disconnected and reconnects on its own schedule.
pub trait Transport {
    /// Send an envelope to a single peer.
    fn send(&mut self, target: &NodeId, envelope: Envelope);

    /// Send an envelope to every peer.
    fn broadcast(&mut self, envelope: Envelope);
}

/// Commit notifications fired by the KV client, one hook per request kind.
///
/// The filesystem reconciliation layer is the one real implementor; tests
/// use recording stubs.
pub trait ConsensusListener {
    fn on_add(&mut self, add: &Add);
    fn on_update(&mut self, update: &Update);
    fn on_delete(&mut self, delete: &Delete);
    fn on_rename(&mut self, rename: &Rename);
}

/// A trait for types which can be summarized for logging without dumping
/// their whole payload.
pub trait MessageSummary {
    /// A short human readable summary, used in trace output.
    fn summary(&self) -> String;
}
