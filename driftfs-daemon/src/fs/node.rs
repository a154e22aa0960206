//! Node bookkeeping for the directory cache.

use std::fmt;

use crate::store::Scratch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
}

/// The reconciliation state of a cached node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Same as the synced version.
    Clean,
    /// The committed version of this file hasn't arrived yet.
    Pending,
    /// Requires syncing, but isn't open.
    Dirty,
    /// Actively being written through a scratch.
    ActiveWrite,
    /// Actively being read (read-only access).
    ActiveRead,
    /// Created locally; its add has not committed yet.
    Novel,
    /// Deleted locally; the delete has not committed yet.
    Dead,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Clean => "clean",
            NodeState::Pending => "pending",
            NodeState::Dirty => "dirty",
            NodeState::ActiveWrite => "active_write",
            NodeState::ActiveRead => "active_read",
            NodeState::Novel => "novel",
            NodeState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// One node's entry in the directory cache.
///
/// In the dcache `name` is the bare filename and the full path is implied
/// by the containing directory; sync-cache copies carry the full path.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub state: NodeState,

    /// Inode number; unique, only meaningful on directories.
    pub inode: u64,

    /// Number of open file handles.
    pub fds: u64,

    /// Rename signpost. On a `dead` node this is the rename target; on a
    /// `novel` node it is the rename source.
    pub rename_info: Option<String>,

    /// Scratch backing, while actively written.
    pub scratch: Option<Scratch>,

    /// The version a pending node is still serving, or the version a
    /// dirty node's update replaces.
    pub previous_version: Option<String>,

    pub name: String,

    /// The current version. Empty for directories and never-released
    /// novel files.
    pub version: String,
}

impl NodeInfo {
    /// Make a directory node.
    pub fn directory(name: impl Into<String>, inode: u64) -> NodeInfo {
        NodeInfo {
            kind: NodeKind::Dir,
            state: NodeState::Clean,
            inode,
            fds: 0,
            rename_info: None,
            scratch: None,
            previous_version: None,
            name: name.into(),
            version: String::new(),
        }
    }

    /// Make a file node for a version that may or may not have arrived.
    pub fn file(name: impl Into<String>, version: impl Into<String>, arrived: bool) -> NodeInfo {
        NodeInfo {
            kind: NodeKind::File,
            state: if arrived {
                NodeState::Clean
            } else {
                NodeState::Pending
            },
            inode: 0,
            fds: 0,
            rename_info: None,
            scratch: None,
            previous_version: None,
            name: name.into(),
            version: version.into(),
        }
    }

    /// The version whose bytes this node currently serves, if any. An
    /// active write has no stable version until release.
    pub fn active_version(&self) -> Option<&str> {
        match self.state {
            NodeState::Clean | NodeState::Dirty | NodeState::ActiveRead | NodeState::Novel => {
                Some(&self.version)
            }
            NodeState::Pending => self.previous_version.as_deref(),
            NodeState::ActiveWrite | NodeState::Dead => None,
        }
    }
}

/// Attributes served to the kernel binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: u64,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One row of a readdir listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}
