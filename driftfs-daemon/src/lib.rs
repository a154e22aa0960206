//! The driftfs daemon: a replicated filesystem node.
//!
//! Metadata operations replicate through the consensus core in
//! [`driftfs_raft`]; file contents are immutable, content-versioned blobs
//! held in the [`store`] and fetched lazily between peers by [`transfer`].
//! The [`fs`] module reconciles local POSIX activity with committed remote
//! changes, and [`daemon`] ties everything to one event loop.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod net;
pub mod store;
pub mod transfer;
