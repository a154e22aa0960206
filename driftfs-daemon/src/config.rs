//! Daemon configuration: command-line options plus the JSON node table.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use serde::Deserialize;

use driftfs_raft::NodeId;

/// One node of the cluster as configured.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

/// Command-line options for `driftfsd`.
#[derive(Debug, Parser)]
#[command(name = "driftfsd", version, about = "Replicated filesystem daemon")]
pub struct Options {
    /// The ID of this node.
    #[arg(long)]
    pub id: NodeId,

    /// JSON node table: an array of `{"id", "host", "port"}` descriptors.
    /// Prefix with `@` to read the table from a file.
    #[arg(long)]
    pub nodes: String,

    /// Working directory; holds the journal, the blob store and scratches.
    #[arg(long, default_value = ".driftfs")]
    pub working_directory: PathBuf,

    /// Mount point for the kernel filesystem binding.
    #[arg(long)]
    pub mount: Option<PathBuf>,

    /// Log filter, e.g. `info` or `driftfs_raft=debug`.
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Average leader heartbeat period in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub leader_timeout_ms: u64,

    /// Average election timeout in milliseconds.
    #[arg(long, default_value_t = 300)]
    pub election_timeout_ms: u64,

    /// Fuzz applied around both timer averages, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub timeout_fuzz_ms: u64,

    /// Reconciliation tick period in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub tick_ms: u64,
}

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub id: NodeId,
    pub peers: Vec<NodeDescriptor>,
    pub listen_port: u16,
    pub working_dir: PathBuf,
    pub mount: Option<PathBuf>,
    pub leader_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub timeout_fuzz_ms: u64,
    pub tick_ms: u64,
    /// Seed for the timer distributions and recovery-name generator.
    pub seed: u64,
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl Config {
    pub fn from_options(options: &Options) -> anyhow::Result<Config> {
        let raw = match options.nodes.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading node table from {path}"))?,
            None => options.nodes.clone(),
        };
        let descriptors: Vec<NodeDescriptor> =
            serde_json::from_str(&raw).context("parsing node table")?;

        let listen_port = descriptors
            .iter()
            .find(|node| node.id == options.id)
            .map(|node| node.port)
            .ok_or_else(|| anyhow!("node id `{}` not present in node table", options.id))?;
        let peers = descriptors
            .into_iter()
            .filter(|node| node.id != options.id)
            .collect();

        // Files surfaced through the kernel binding take the daemon's
        // identity; modes are ours too and not replicated.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        Ok(Config {
            id: options.id.clone(),
            peers,
            listen_port,
            working_dir: options.working_directory.clone(),
            mount: options.mount.clone(),
            leader_timeout_ms: options.leader_timeout_ms,
            election_timeout_ms: options.election_timeout_ms,
            timeout_fuzz_ms: options.timeout_fuzz_ms,
            tick_ms: options.tick_ms,
            seed: seed_from_id(&options.id),
            uid,
            gid,
            file_mode: 0o644,
            dir_mode: 0o755,
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.working_dir.join("raftlog")
    }

    pub fn store_root(&self) -> PathBuf {
        self.working_dir.join("store")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.working_dir.join("scratch")
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|node| node.id.clone()).collect()
    }
}

/// Nodes draw their timer fuzz from distinct streams keyed by identity.
fn seed_from_id(id: &str) -> u64 {
    id.bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
}
