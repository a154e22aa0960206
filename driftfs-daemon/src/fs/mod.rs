//! Filesystem reconciliation: the directory cache, the sync queue and the
//! conflict policy that merges local POSIX activity with committed remote
//! changes.
//!
//! All replicated state lives behind the KV layer as `(key, version)`
//! pairs; this module materialises it as a directory tree and keeps a FIFO
//! queue of outstanding local mutations per path. A periodic tick submits
//! queue heads to consensus and promotes `pending` entries whose blobs
//! have arrived. Remote commits that collide with local state win; the
//! losing local side is preserved under a recovered name instead of being
//! discarded.

pub mod bridge;
pub mod node;
pub mod paths;

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use driftfs_raft::request::{Add, Delete, Rename, Request, Update};
use driftfs_raft::{ConsensusListener, NodeId};

use crate::store::ChangeStore;

use self::node::{Attr, DirEntry, NodeInfo, NodeKind, NodeState};
use self::paths::{decode_path, encode_path};

/// Where the translation table points an open path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Redirect {
    Dcache,
    Rcache,
}

/// How a file is being opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// A read-redirect entry: the `(key, version)` an open handle keeps seeing
/// after the path has moved on, plus the handles holding it.
#[derive(Clone, Debug)]
struct ReadHold {
    key: String,
    version: String,
    fds: u64,
}

/// Positive errno; the POSIX bridge negates on the way out.
pub type Errno = i32;
pub type FsResult<T> = Result<T, Errno>;

/// Identity and ownership settings for the reconciliation layer.
#[derive(Clone, Debug)]
pub struct FsConfig {
    pub id: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub seed: u64,
}

/// The reconciliation state for one node.
pub struct FsState {
    id: NodeId,
    uid: u32,
    gid: u32,
    file_mode: u32,
    dir_mode: u32,

    next_inode: u64,
    rng: StdRng,

    /// Directory cache: directory path to its entries, including a "."
    /// self entry so empty directories are representable.
    dcache: BTreeMap<String, Vec<NodeInfo>>,

    /// Read cache: paths whose open handles outlived a committed change.
    rcache: BTreeMap<String, ReadHold>,

    /// Translation table for open paths.
    fusetl: BTreeMap<String, Redirect>,

    /// Outstanding local mutations per full path, in submission order.
    /// Only the head of each queue is submitted to consensus.
    sync_cache: BTreeMap<String, VecDeque<NodeInfo>>,

    /// Where tick-time submissions go (drained into the controller).
    sync_tx: UnboundedSender<Request>,
}

fn split(path: &str) -> (String, String) {
    if path == "/" {
        return ("/".to_owned(), ".".to_owned());
    }
    match path.rfind('/') {
        Some(0) => ("/".to_owned(), path[1..].to_owned()),
        Some(i) => (path[..i].to_owned(), path[i + 1..].to_owned()),
        None => ("/".to_owned(), path.to_owned()),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec!["/".to_owned()];
    if path == "/" {
        return out;
    }
    let mut progress = String::new();
    for piece in path.split('/').filter(|piece| !piece.is_empty()) {
        progress.push('/');
        progress.push_str(piece);
        out.push(progress.clone());
    }
    out
}

impl FsState {
    pub fn new(config: FsConfig, sync_tx: UnboundedSender<Request>) -> FsState {
        let mut state = FsState {
            id: config.id,
            uid: config.uid,
            gid: config.gid,
            file_mode: config.file_mode,
            dir_mode: config.dir_mode,
            next_inode: 0,
            rng: StdRng::seed_from_u64(config.seed),
            dcache: BTreeMap::new(),
            rcache: BTreeMap::new(),
            fusetl: BTreeMap::new(),
            sync_cache: BTreeMap::new(),
            sync_tx,
        };
        state.make_directories("/");
        state
    }

    /// Seed the tree from the replicated version map at startup.
    pub fn populate(&mut self, key: &str, version: &str, store: &ChangeStore) {
        let path = match decode_path(key) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(key, error = %err, "undecodable key in version map");
                return;
            }
        };
        let (parent, name) = split(&path);
        self.make_directories(&parent);
        let mut entry = NodeInfo::file(name, version, store.exists(key, version));
        if entry.state == NodeState::Pending {
            entry.previous_version = Some(String::new());
        }
        self.insert_child(&parent, entry);
    }

    // ------------------------------------------------------------------
    // POSIX operation surface
    // ------------------------------------------------------------------

    pub fn getattr(&self, store: &ChangeStore, path: &str) -> FsResult<Attr> {
        if let Some(Redirect::Rcache) = self.fusetl.get(path) {
            if let Some(hold) = self.rcache.get(path) {
                return Ok(Attr {
                    kind: NodeKind::File,
                    size: store.len(&hold.key, &hold.version).unwrap_or(0),
                    inode: 0,
                    mode: self.file_mode,
                    uid: self.uid,
                    gid: self.gid,
                });
            }
        }
        let ni = self.live(path).ok_or(libc::ENOENT)?;
        Ok(match ni.kind {
            NodeKind::Dir => Attr {
                kind: NodeKind::Dir,
                size: 0,
                inode: ni.inode,
                mode: self.dir_mode,
                uid: self.uid,
                gid: self.gid,
            },
            NodeKind::File => Attr {
                kind: NodeKind::File,
                size: self.file_size(store, path, ni),
                inode: ni.inode,
                mode: self.file_mode,
                uid: self.uid,
                gid: self.gid,
            },
        })
    }

    pub fn mkdir(&mut self, path: &str) -> FsResult<()> {
        if path == "/" || self.live(path).is_some() {
            return Err(libc::EEXIST);
        }
        let (parent, name) = split(path);
        match self.live(&parent) {
            Some(ni) if ni.kind == NodeKind::Dir => {}
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.insert_child(&parent, NodeInfo::directory(name, inode));
        self.dcache
            .insert(path.to_owned(), vec![NodeInfo::directory(".", inode)]);
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        if path == "/" {
            return Err(libc::EBUSY);
        }
        let ni = self.live(path).ok_or(libc::ENOENT)?;
        if ni.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR);
        }
        let occupied = self
            .dcache
            .get(path)
            .is_some_and(|list| list.iter().any(|entry| entry.name != "." && entry.state != NodeState::Dead));
        if occupied {
            return Err(libc::ENOTEMPTY);
        }
        self.dcache.remove(path);
        self.take_entry(path);
        Ok(())
    }

    pub fn create(&mut self, store: &mut ChangeStore, path: &str) -> FsResult<()> {
        if self.live(path).is_some() {
            return Err(libc::EEXIST);
        }
        let (parent, name) = split(path);
        match self.live(&parent) {
            Some(ni) if ni.kind == NodeKind::Dir => {}
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        }
        let scratch = store.scratch(&encode_path(path)).map_err(|_| libc::EIO)?;
        let mut entry = NodeInfo::file(name, "", true);
        entry.state = NodeState::ActiveWrite;
        entry.scratch = Some(scratch);
        entry.fds = 1;
        self.insert_child(&parent, entry);
        self.fusetl.insert(path.to_owned(), Redirect::Dcache);
        Ok(())
    }

    pub fn open(&mut self, store: &mut ChangeStore, path: &str, mode: OpenMode) -> FsResult<()> {
        if let Some(Redirect::Rcache) = self.fusetl.get(path) {
            if mode == OpenMode::Write {
                return Err(libc::EACCES);
            }
            if let Some(hold) = self.rcache.get_mut(path) {
                hold.fds += 1;
                return Ok(());
            }
        }

        let key = encode_path(path);
        let ni = self.live_mut(path).ok_or(libc::ENOENT)?;
        if ni.kind == NodeKind::Dir {
            return Err(libc::EISDIR);
        }

        match mode {
            OpenMode::Read => {
                ni.fds += 1;
                if ni.state == NodeState::Clean {
                    ni.state = NodeState::ActiveRead;
                }
            }
            OpenMode::Write => match ni.state {
                NodeState::Dead => return Err(libc::ENOENT),
                NodeState::ActiveWrite => ni.fds += 1,
                NodeState::Pending => {
                    // The committed version hasn't arrived; writes would
                    // fork from bytes we don't have yet.
                    return Err(libc::EAGAIN);
                }
                NodeState::Clean
                | NodeState::Dirty
                | NodeState::ActiveRead
                | NodeState::Novel => {
                    let base = ni.version.clone();
                    let scratch = if !base.is_empty() && store.exists(&key, &base) {
                        store.scratch_from(&key, &base).map_err(|_| libc::EIO)?
                    } else {
                        store.scratch(&key).map_err(|_| libc::EIO)?
                    };
                    ni.scratch = Some(scratch);
                    // What the eventual update replaces; None means the
                    // release becomes a first add.
                    ni.previous_version = if base.is_empty() { None } else { Some(base) };
                    ni.state = NodeState::ActiveWrite;
                    ni.fds += 1;
                }
            },
        }
        self.fusetl.insert(path.to_owned(), Redirect::Dcache);
        Ok(())
    }

    pub fn read(
        &self,
        store: &ChangeStore,
        path: &str,
        offset: u64,
        size: usize,
    ) -> FsResult<Vec<u8>> {
        if let Some(Redirect::Rcache) = self.fusetl.get(path) {
            if let Some(hold) = self.rcache.get(path) {
                return store
                    .read(&hold.key, &hold.version, offset, size)
                    .map_err(|_| libc::EIO);
            }
        }
        let ni = self.live(path).ok_or(libc::ENOENT)?;
        if ni.kind == NodeKind::Dir {
            return Err(libc::EISDIR);
        }
        if let Some(scratch) = &ni.scratch {
            return store.read_scratch(scratch, offset, size).map_err(|_| libc::EIO);
        }

        let key = encode_path(path);
        let version = match ni.state {
            NodeState::Pending => match ni.previous_version.as_deref() {
                Some(version) if !version.is_empty() && store.exists(&key, version) => {
                    version.to_owned()
                }
                _ => return Err(libc::EAGAIN),
            },
            _ => ni.version.clone(),
        };
        if version.is_empty() {
            return Ok(Vec::new());
        }
        store.read(&key, &version, offset, size).map_err(|_| libc::EIO)
    }

    pub fn write(
        &mut self,
        store: &mut ChangeStore,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        if let Some(Redirect::Rcache) = self.fusetl.get(path) {
            return Err(libc::EBADF);
        }
        let ni = self.live(path).ok_or(libc::ENOENT)?;
        if ni.state != NodeState::ActiveWrite {
            return Err(libc::EBADF);
        }
        let scratch = ni.scratch.clone().ok_or(libc::EIO)?;
        store
            .write_scratch(&scratch, offset, data)
            .map_err(|_| libc::EIO)
    }

    pub fn truncate(&mut self, store: &mut ChangeStore, path: &str, size: u64) -> FsResult<()> {
        {
            let ni = self.live(path).ok_or(libc::ENOENT)?;
            if ni.kind == NodeKind::Dir {
                return Err(libc::EISDIR);
            }
            if ni.state == NodeState::ActiveWrite {
                let scratch = ni.scratch.clone().ok_or(libc::EIO)?;
                return store.truncate_scratch(&scratch, size).map_err(|_| libc::EIO);
            }
        }
        // A self-contained write: seed a scratch, cut it, commit it.
        self.open(store, path, OpenMode::Write)?;
        {
            let ni = self.live(path).ok_or(libc::EIO)?;
            let scratch = ni.scratch.clone().ok_or(libc::EIO)?;
            store.truncate_scratch(&scratch, size).map_err(|_| libc::EIO)?;
        }
        self.release(store, path)
    }

    pub fn release(&mut self, store: &mut ChangeStore, path: &str) -> FsResult<()> {
        if let Some(Redirect::Rcache) = self.fusetl.get(path) {
            if let Some(hold) = self.rcache.get_mut(path) {
                hold.fds = hold.fds.saturating_sub(1);
                if hold.fds == 0 {
                    self.rcache.remove(path);
                    self.fusetl.remove(path);
                }
                return Ok(());
            }
        }
        if self.live(path).is_none() {
            self.fusetl.remove(path);
            return Ok(());
        }
        let state = {
            let ni = self.live_mut(path).ok_or(libc::EIO)?;
            ni.fds = ni.fds.saturating_sub(1);
            if ni.fds > 0 {
                return Ok(());
            }
            ni.state
        };
        match state {
            NodeState::ActiveWrite => self.finish_write(store, path),
            NodeState::ActiveRead => {
                if let Some(ni) = self.live_mut(path) {
                    ni.state = NodeState::Clean;
                }
                self.fusetl.remove(path);
                Ok(())
            }
            _ => {
                self.fusetl.remove(path);
                Ok(())
            }
        }
    }

    pub fn unlink(&mut self, store: &mut ChangeStore, path: &str) -> FsResult<()> {
        let (kind, version) = {
            let ni = self.live(path).ok_or(libc::ENOENT)?;
            (ni.kind, ni.version.clone())
        };
        if kind == NodeKind::Dir {
            return Err(libc::EISDIR);
        }

        if version.is_empty() {
            // Never replicated; a purely local removal.
            if let Some(ni) = self.take_entry(path) {
                if let Some(scratch) = ni.scratch {
                    store.discard_scratch(scratch);
                }
            }
            self.sync_cache.remove(path);
            self.fusetl.remove(path);
            return Ok(());
        }

        self.hold_open(path);
        let ni = self.live_mut(path).ok_or(libc::EIO)?;
        ni.state = NodeState::Dead;
        ni.rename_info = None;
        if let Some(scratch) = ni.scratch.take() {
            store.discard_scratch(scratch);
        }
        let mut snap = ni.clone();
        snap.name = path.to_owned();
        self.sync_cache
            .entry(path.to_owned())
            .or_default()
            .push_back(snap);
        Ok(())
    }

    pub fn rename(&mut self, store: &mut ChangeStore, from: &str, to: &str) -> FsResult<()> {
        if from == to {
            return Ok(());
        }
        let src = self.live(from).cloned().ok_or(libc::ENOENT)?;
        if src.kind == NodeKind::Dir {
            return self.rename_dir(store, from, to);
        }
        if self.live(to).is_some() {
            self.unlink(store, to)?;
        }
        let (to_parent, to_name) = split(to);
        match self.live(&to_parent) {
            Some(ni) if ni.kind == NodeKind::Dir => {}
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        }

        if src.version.is_empty() {
            // Not replicated yet; a local move is enough.
            if let Some(mut ni) = self.take_entry(from) {
                ni.name = to_name;
                self.insert_child(&to_parent, ni);
            }
            self.fusetl.remove(from);
            return Ok(());
        }

        self.hold_open(from);

        // Two-entry signpost: a dead source pointing at the target and a
        // novel target pointing back. Completion needs the pair.
        let version = src.version.clone();
        {
            let ni = self.live_mut(from).ok_or(libc::EIO)?;
            ni.state = NodeState::Dead;
            ni.rename_info = Some(to.to_owned());
            if let Some(scratch) = ni.scratch.take() {
                store.discard_scratch(scratch);
            }
            let mut snap = ni.clone();
            snap.name = from.to_owned();
            self.sync_cache
                .entry(from.to_owned())
                .or_default()
                .push_back(snap);
        }
        {
            let mut target = NodeInfo::file(to_name, version.clone(), true);
            target.state = NodeState::Novel;
            target.rename_info = Some(from.to_owned());
            let mut snap = target.clone();
            snap.name = to.to_owned();
            self.insert_child(&to_parent, target);
            self.sync_cache
                .entry(to.to_owned())
                .or_default()
                .push_back(snap);
        }

        if store.exists(&encode_path(from), &version) {
            if let Err(err) = store.copy(&encode_path(from), &version, &encode_path(to)) {
                tracing::warn!(from, to, error = %err, "failed to stage renamed blob");
            }
        }
        Ok(())
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let ni = self.live(path).ok_or(libc::ENOENT)?;
        if ni.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR);
        }
        let list = self.dcache.get(path).ok_or(libc::ENOENT)?;
        let mut out = vec![DirEntry {
            name: "..".to_owned(),
            kind: NodeKind::Dir,
        }];
        for entry in list {
            if entry.state == NodeState::Dead {
                continue;
            }
            out.push(DirEntry {
                name: entry.name.clone(),
                kind: entry.kind,
            });
        }
        Ok(out)
    }

    pub fn flush(&self, _path: &str) -> FsResult<()> {
        // Scratch writes hit the file synchronously; nothing to do.
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Fires off all change requests and promotes arrived blobs. Call
    /// periodically.
    pub fn tick(&mut self, store: &ChangeStore) {
        for (path, queue) in &self.sync_cache {
            let Some(head) = queue.front() else { continue };
            let request = self.request_for(path, head);
            if let Some(request) = request {
                if self.sync_tx.send(request).is_err() {
                    tracing::warn!("sync channel closed");
                }
            }
        }

        for (path, version) in self.pending_paths() {
            if store.exists(&encode_path(&path), &version) {
                self.promote_arrived(&path, &version);
            }
        }
    }

    /// `(key, version)` pairs the store is still missing, for the transfer
    /// layer to chase.
    pub fn pending_blobs(&self) -> Vec<(String, String)> {
        self.pending_paths()
            .into_iter()
            .map(|(path, version)| (encode_path(&path), version))
            .collect()
    }

    /// Arrival notification from the transfer layer.
    pub fn notify_arrival(&mut self, key: &str, version: &str) {
        let Ok(path) = decode_path(key) else {
            tracing::warn!(key, "undecodable key in arrival notification");
            return;
        };
        self.promote_arrived(&path, version);
    }

    // ------------------------------------------------------------------
    // Commit notifications
    // ------------------------------------------------------------------

    pub fn commit_add(&mut self, rpc: &Add, store: &mut ChangeStore) {
        let Some(path) = self.decode_or_warn(&rpc.key) else { return };

        if rpc.from == self.id {
            let done = self.completed_head(&path, |ni| {
                if ni.version != rpc.version {
                    return false;
                }
                if ni.state != NodeState::Novel {
                    tracing::warn!(%path, state = %ni.state, "invalid state on completed add entry");
                }
                true
            });
            if done {
                self.pop_sync(&path);
                if let Some(ni) = self.live_mut(&path) {
                    if ni.version == rpc.version && ni.state == NodeState::Novel {
                        ni.state = NodeState::Clean;
                    }
                }
                return;
            }
            tracing::warn!(%path, "own add committed with no matching sync entry");
        }

        if self.conflicts(&path) {
            self.resolve_conflict(&path, store);
        }
        let (parent, name) = split(&path);
        // Missing parents are silently created for adds.
        self.make_directories(&parent);
        let mut entry = NodeInfo::file(name, rpc.version.clone(), store.exists(&rpc.key, &rpc.version));
        if entry.state == NodeState::Pending {
            entry.previous_version = Some(String::new());
        }
        self.insert_child(&parent, entry);
    }

    pub fn commit_update(&mut self, rpc: &Update, store: &mut ChangeStore) {
        let Some(path) = self.decode_or_warn(&rpc.key) else { return };

        if rpc.from == self.id {
            let done = self.completed_head(&path, |ni| {
                ni.version == rpc.new_version && ni.state == NodeState::Dirty
            });
            if done {
                self.pop_sync(&path);
                if let Some(ni) = self.live_mut(&path) {
                    if ni.version == rpc.new_version && ni.state == NodeState::Dirty {
                        ni.state = NodeState::Clean;
                        ni.previous_version = None;
                    }
                }
                return;
            }
            tracing::warn!(%path, "own update committed with no matching sync entry");
        }

        if self.conflicts(&path) {
            self.resolve_conflict(&path, store);
        }
        let arrived = store.exists(&rpc.key, &rpc.new_version);
        match self.live_mut(&path) {
            Some(ni) => {
                ni.version = rpc.new_version.clone();
                ni.previous_version = Some(rpc.old_version.clone());
                ni.state = if arrived {
                    NodeState::Clean
                } else {
                    NodeState::Pending
                };
            }
            None => {
                let (parent, name) = split(&path);
                if !self.dcache.contains_key(&parent) {
                    tracing::warn!(%path, "update for a path with no parent; dropping");
                    return;
                }
                let mut entry = NodeInfo::file(name, rpc.new_version.clone(), arrived);
                if entry.state == NodeState::Pending {
                    entry.previous_version = Some(rpc.old_version.clone());
                }
                self.insert_child(&parent, entry);
            }
        }
    }

    pub fn commit_delete(&mut self, rpc: &Delete, store: &mut ChangeStore) {
        let Some(path) = self.decode_or_warn(&rpc.key) else { return };

        if rpc.from == self.id {
            let done = self.completed_head(&path, |ni| {
                ni.version == rpc.version
                    && ni.state == NodeState::Dead
                    && ni.rename_info.is_none()
            });
            if done {
                self.pop_sync(&path);
                self.remove_entry_if(&path, |ni| ni.state == NodeState::Dead);
                let (parent, _) = split(&path);
                self.clean_directories(&parent);
                if store.exists(&rpc.key, &rpc.version) {
                    let _ = store.kill(&rpc.key, &rpc.version);
                }
                return;
            }
            tracing::warn!(%path, "own delete committed with no matching sync entry");
        }

        if self.conflicts(&path) {
            self.resolve_conflict(&path, store);
        }
        self.take_entry(&path);
        let (parent, _) = split(&path);
        self.clean_directories(&parent);
        if store.exists(&rpc.key, &rpc.version) {
            let _ = store.kill(&rpc.key, &rpc.version);
        }
    }

    pub fn commit_rename(&mut self, rpc: &Rename, store: &mut ChangeStore) {
        let Some(path) = self.decode_or_warn(&rpc.key) else { return };
        let Some(new_path) = self.decode_or_warn(&rpc.new_key) else { return };

        if rpc.from == self.id {
            let done = self.completed_head(&path, |ni| {
                ni.version == rpc.version
                    && ni.state == NodeState::Dead
                    && ni.rename_info.as_deref() == Some(new_path.as_str())
            });
            if done {
                // Clear the other half of the signpost.
                let mut found = false;
                if let Some(queue) = self.sync_cache.get_mut(&new_path) {
                    let before = queue.len();
                    queue.retain(|ni| {
                        !(ni.state == NodeState::Novel
                            && ni.rename_info.as_deref() == Some(path.as_str()))
                    });
                    found = queue.len() < before;
                    if queue.is_empty() {
                        self.sync_cache.remove(&new_path);
                    }
                }
                if !found {
                    tracing::warn!(%path, "dangling rename pointer");
                }
                self.pop_sync(&path);
                self.remove_entry_if(&path, |ni| ni.state == NodeState::Dead);
                if let Some(ni) = self.live_mut(&new_path) {
                    if ni.state == NodeState::Novel && ni.rename_info.is_some() {
                        ni.state = NodeState::Clean;
                        ni.rename_info = None;
                    }
                }
                let (parent, _) = split(&path);
                self.clean_directories(&parent);
                if store.exists(&rpc.key, &rpc.version) && store.exists(&rpc.new_key, &rpc.version)
                {
                    let _ = store.kill(&rpc.key, &rpc.version);
                }
                return;
            }
            tracing::warn!(%path, "own rename committed with no matching sync entry");
        }

        // Remote rename: the source goes away, the target appears.
        if self.conflicts(&path) {
            self.resolve_conflict(&path, store);
        }
        if self.conflicts(&new_path) {
            self.resolve_conflict(&new_path, store);
        }
        self.take_entry(&path);
        {
            let (parent, _) = split(&path);
            self.clean_directories(&parent);
        }
        if store.exists(&rpc.key, &rpc.version) && !store.exists(&rpc.new_key, &rpc.version) {
            if let Err(err) = store.rename(&rpc.key, &rpc.version, &rpc.new_key, &rpc.version) {
                tracing::warn!(%path, %new_path, error = %err, "failed to move renamed blob");
            }
        }
        let (parent, name) = split(&new_path);
        if !self.dcache.contains_key(&parent) {
            tracing::warn!(%new_path, "rename target parent missing; dropping");
            return;
        }
        let mut entry =
            NodeInfo::file(name, rpc.version.clone(), store.exists(&rpc.new_key, &rpc.version));
        if entry.state == NodeState::Pending {
            entry.previous_version = Some(String::new());
        }
        self.insert_child(&parent, entry);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn request_for(&self, path: &str, head: &NodeInfo) -> Option<Request> {
        match (head.state, head.rename_info.as_ref()) {
            (NodeState::Dead, Some(target)) => Some(
                Rename {
                    from: self.id.clone(),
                    key: encode_path(path),
                    new_key: encode_path(target),
                    version: head.version.clone(),
                }
                .into(),
            ),
            (NodeState::Dead, None) => Some(
                Delete {
                    from: self.id.clone(),
                    key: encode_path(path),
                    version: head.version.clone(),
                }
                .into(),
            ),
            // The target half of a signpost rides on the source's rename.
            (NodeState::Novel, Some(_)) => None,
            (NodeState::Novel, None) if !head.version.is_empty() => Some(
                Add {
                    from: self.id.clone(),
                    key: encode_path(path),
                    version: head.version.clone(),
                }
                .into(),
            ),
            (NodeState::Dirty, _) => Some(
                Update {
                    from: self.id.clone(),
                    key: encode_path(path),
                    old_version: head.previous_version.clone().unwrap_or_default(),
                    new_version: head.version.clone(),
                }
                .into(),
            ),
            _ => None,
        }
    }

    fn live(&self, path: &str) -> Option<&NodeInfo> {
        let (dir, name) = split(path);
        self.dcache
            .get(&dir)?
            .iter()
            .find(|ni| ni.name == name && ni.state != NodeState::Dead)
    }

    fn live_mut(&mut self, path: &str) -> Option<&mut NodeInfo> {
        let (dir, name) = split(path);
        self.dcache
            .get_mut(&dir)?
            .iter_mut()
            .find(|ni| ni.name == name && ni.state != NodeState::Dead)
    }

    fn take_entry(&mut self, path: &str) -> Option<NodeInfo> {
        if path == "/" {
            return None;
        }
        self.remove_entry_if(path, |_| true)
    }

    fn remove_entry_if(
        &mut self,
        path: &str,
        pred: impl Fn(&NodeInfo) -> bool,
    ) -> Option<NodeInfo> {
        let (dir, name) = split(path);
        let list = self.dcache.get_mut(&dir)?;
        let pos = list.iter().position(|ni| ni.name == name && pred(ni))?;
        Some(list.remove(pos))
    }

    fn insert_child(&mut self, parent: &str, entry: NodeInfo) {
        let list = self.dcache.entry(parent.to_owned()).or_default();
        list.retain(|ni| ni.name != entry.name);
        list.push(entry);
    }

    fn make_directories(&mut self, path: &str) {
        for dir in ancestors(path) {
            if self.dcache.contains_key(&dir) {
                continue;
            }
            let inode = self.next_inode;
            self.next_inode += 1;
            let (parent, name) = split(&dir);
            if dir != "/" {
                self.insert_child(&parent, NodeInfo::directory(name, inode));
            }
            self.dcache
                .insert(dir, vec![NodeInfo::directory(".", inode)]);
        }
    }

    /// Clean up tombstones and newly empty directories along a path.
    fn clean_directories(&mut self, start: &str) {
        let mut path = start.to_owned();
        while path != "/" {
            let (parent, name) = split(&path);
            match self.dcache.get_mut(&path) {
                Some(list) => {
                    list.retain(|ni| ni.state != NodeState::Dead);
                    if list.len() > 1 {
                        break;
                    }
                    self.dcache.remove(&path);
                    if let Some(plist) = self.dcache.get_mut(&parent) {
                        plist.retain(|ni| ni.name != name);
                    }
                }
                None => {}
            }
            path = parent;
        }
    }

    fn file_size(&self, store: &ChangeStore, path: &str, ni: &NodeInfo) -> u64 {
        if let Some(scratch) = &ni.scratch {
            return store.scratch_len(scratch).unwrap_or(0);
        }
        match ni.active_version() {
            Some(version) if !version.is_empty() => {
                store.len(&encode_path(path), version).unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Preserve an open path's current bytes through the rcache.
    fn hold_open(&mut self, path: &str) {
        let hold = match self.live(path) {
            Some(ni) if ni.fds > 0 => match ni.active_version() {
                Some(version) if !version.is_empty() => Some(ReadHold {
                    key: encode_path(path),
                    version: version.to_owned(),
                    fds: ni.fds,
                }),
                _ => None,
            },
            _ => None,
        };
        if let Some(hold) = hold {
            self.rcache.insert(path.to_owned(), hold);
            self.fusetl.insert(path.to_owned(), Redirect::Rcache);
        }
    }

    fn conflicts(&self, path: &str) -> bool {
        self.sync_cache.contains_key(path)
            || self
                .live(path)
                .is_some_and(|ni| ni.fds > 0 || ni.scratch.is_some())
    }

    /// A committed remote change collides with local state: the remote
    /// wins, open handles keep their bytes, and any local version is
    /// preserved under a recovered name and re-queued as a novel add.
    fn resolve_conflict(&mut self, path: &str, store: &mut ChangeStore) {
        self.hold_open(path);
        let queue = self.sync_cache.remove(path);
        let local = self.take_entry(path);
        self.fusetl
            .retain(|held, redirect| held != path || *redirect == Redirect::Rcache);

        if queue.is_none() {
            return;
        }
        if let Some(local) = local {
            if local.version.is_empty() {
                if let Some(scratch) = local.scratch {
                    store.discard_scratch(scratch);
                }
            } else {
                let recovered = self.recover_path(path);
                let key = encode_path(path);
                if store.exists(&key, &local.version) {
                    if let Err(err) = store.copy(&key, &local.version, &encode_path(&recovered)) {
                        tracing::warn!(%path, error = %err, "failed to re-home conflicting blob");
                    }
                }
                let (parent, name) = split(&recovered);
                let mut entry = NodeInfo::file(name, local.version.clone(), true);
                entry.state = NodeState::Novel;
                let mut snap = entry.clone();
                snap.name = recovered.clone();
                self.insert_child(&parent, entry);
                self.sync_cache
                    .insert(recovered.clone(), VecDeque::from([snap]));
                tracing::info!(original = %path, recovered = %recovered,
                    "preserved conflicting local change");
            }
        }

        // Drop any rename signposts the abandoned queue carried.
        if let Some(queue) = queue {
            for ni in queue {
                if ni.state != NodeState::Dead {
                    continue;
                }
                let Some(target) = ni.rename_info else { continue };
                if let Some(target_queue) = self.sync_cache.get_mut(&target) {
                    target_queue.retain(|other| {
                        !(other.state == NodeState::Novel
                            && other.rename_info.as_deref() == Some(path))
                    });
                    if target_queue.is_empty() {
                        self.sync_cache.remove(&target);
                    }
                }
                tracing::warn!(source = %path, target = %target,
                    "dropped rename signpost after conflict");
            }
        }
    }

    /// A fresh path of the form `<path>.XXXX-XXXX` for conflict recovery.
    fn recover_path(&mut self, path: &str) -> String {
        loop {
            let a: u16 = self.rng.random();
            let b: u16 = self.rng.random();
            let candidate = format!("{path}.{a:04x}-{b:04x}");
            if self.live(&candidate).is_none()
                && !self.dcache.contains_key(&candidate)
                && !self.sync_cache.contains_key(&candidate)
            {
                return candidate;
            }
        }
    }

    fn finish_write(&mut self, store: &mut ChangeStore, path: &str) -> FsResult<()> {
        let (scratch, previous) = {
            let ni = self.live_mut(path).ok_or(libc::ENOENT)?;
            (ni.scratch.take().ok_or(libc::EIO)?, ni.previous_version.clone())
        };
        let version = Uuid::new_v4().to_string();
        store.commit_scratch(scratch, &version).map_err(|_| libc::EIO)?;

        let ni = self.live_mut(path).ok_or(libc::EIO)?;
        ni.version = version;
        match previous {
            None => {
                ni.state = NodeState::Novel;
                ni.previous_version = None;
            }
            Some(old) => {
                ni.state = NodeState::Dirty;
                ni.previous_version = Some(old);
            }
        }
        let mut snap = ni.clone();
        snap.name = path.to_owned();
        self.sync_cache
            .entry(path.to_owned())
            .or_default()
            .push_back(snap);
        self.fusetl.remove(path);
        Ok(())
    }

    fn rename_dir(&mut self, store: &mut ChangeStore, from: &str, to: &str) -> FsResult<()> {
        if self.live(to).is_some() {
            return Err(libc::EEXIST);
        }
        if to.starts_with(&format!("{from}/")) {
            return Err(libc::EINVAL);
        }
        self.mkdir(to)?;

        let prefix = format!("{from}/");
        let dirs: Vec<String> = self
            .dcache
            .keys()
            .filter(|key| *key == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in &dirs {
            let new_dir = format!("{to}{}", &dir[from.len()..]);
            self.make_directories(&new_dir);
            let files: Vec<String> = self
                .dcache
                .get(dir)
                .map(|list| {
                    list.iter()
                        .filter(|ni| {
                            ni.name != "."
                                && ni.kind == NodeKind::File
                                && ni.state != NodeState::Dead
                        })
                        .map(|ni| ni.name.clone())
                        .collect()
                })
                .unwrap_or_default();
            for name in files {
                // Replicated children get the full signpost treatment.
                self.rename(store, &join(dir, &name), &join(&new_dir, &name))?;
            }
        }
        // What's left of the old tree is tombstones awaiting their rename
        // commits; clean_directories reaps it as they land.
        Ok(())
    }

    fn pending_paths(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (dir, list) in &self.dcache {
            for ni in list {
                if ni.name == "." || ni.kind != NodeKind::File || ni.state != NodeState::Pending {
                    continue;
                }
                out.push((join(dir, &ni.name), ni.version.clone()));
            }
        }
        out
    }

    fn promote_arrived(&mut self, path: &str, version: &str) {
        if let Some(ni) = self.live_mut(path) {
            if ni.state == NodeState::Pending && ni.version == version {
                ni.state = if ni.fds > 0 {
                    NodeState::ActiveRead
                } else {
                    NodeState::Clean
                };
                ni.previous_version = None;
                tracing::info!(%path, version, "pending blob arrived");
            }
        }
    }

    fn completed_head(&self, path: &str, check: impl Fn(&NodeInfo) -> bool) -> bool {
        self.sync_cache
            .get(path)
            .and_then(|queue| queue.front())
            .is_some_and(check)
    }

    fn pop_sync(&mut self, path: &str) {
        if let Some(queue) = self.sync_cache.get_mut(path) {
            queue.pop_front();
            if queue.is_empty() {
                self.sync_cache.remove(path);
            }
        }
    }

    fn decode_or_warn(&self, key: &str) -> Option<String> {
        match decode_path(key) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(key, error = %err, "undecodable key in commit");
                None
            }
        }
    }

    #[cfg(test)]
    fn sync_queue_len(&self, path: &str) -> usize {
        self.sync_cache.get(path).map_or(0, VecDeque::len)
    }
}

/// Adapter giving the KV client's commit notifications access to both the
/// reconciliation state and the blob store.
pub struct FsListener<'a> {
    pub fs: &'a mut FsState,
    pub store: &'a mut ChangeStore,
}

impl ConsensusListener for FsListener<'_> {
    fn on_add(&mut self, add: &Add) {
        self.fs.commit_add(add, self.store);
    }

    fn on_update(&mut self, update: &Update) {
        self.fs.commit_update(update, self.store);
    }

    fn on_delete(&mut self, delete: &Delete) {
        self.fs.commit_delete(delete, self.store);
    }

    fn on_rename(&mut self, rename: &Rename) {
        self.fs.commit_rename(rename, self.store);
    }
}
