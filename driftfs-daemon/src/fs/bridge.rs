//! Marshalling of POSIX calls onto the event loop.
//!
//! The kernel filesystem binding invokes its callbacks from foreign
//! threads; every call is packaged as an [`FsOp`] message, posted to the
//! event loop, and the calling thread blocks on a one-shot reply channel.
//! The reconciliation layer itself only ever runs on the loop.

use tokio::sync::{mpsc, oneshot};

use crate::fs::node::{Attr, DirEntry};
use crate::fs::{FsResult, FsState, OpenMode};
use crate::store::ChangeStore;

type Reply<T> = oneshot::Sender<FsResult<T>>;

/// One marshalled POSIX operation.
pub enum FsOp {
    Getattr { path: String, reply: Reply<Attr> },
    Mkdir { path: String, reply: Reply<()> },
    Rmdir { path: String, reply: Reply<()> },
    Unlink { path: String, reply: Reply<()> },
    Create { path: String, reply: Reply<()> },
    Rename { from: String, to: String, reply: Reply<()> },
    Truncate { path: String, size: u64, reply: Reply<()> },
    Open { path: String, mode: OpenMode, reply: Reply<()> },
    Read { path: String, offset: u64, size: usize, reply: Reply<Vec<u8>> },
    Write { path: String, offset: u64, data: Vec<u8>, reply: Reply<usize> },
    Release { path: String, reply: Reply<()> },
    Readdir { path: String, reply: Reply<Vec<DirEntry>> },
    Flush { path: String, reply: Reply<()> },
}

/// Execute one marshalled operation against the reconciliation layer and
/// answer its reply channel. Runs on the event loop.
pub fn apply(op: FsOp, fs: &mut FsState, store: &mut ChangeStore) {
    match op {
        FsOp::Getattr { path, reply } => {
            let _ = reply.send(fs.getattr(store, &path));
        }
        FsOp::Mkdir { path, reply } => {
            let _ = reply.send(fs.mkdir(&path));
        }
        FsOp::Rmdir { path, reply } => {
            let _ = reply.send(fs.rmdir(&path));
        }
        FsOp::Unlink { path, reply } => {
            let _ = reply.send(fs.unlink(store, &path));
        }
        FsOp::Create { path, reply } => {
            let _ = reply.send(fs.create(store, &path));
        }
        FsOp::Rename { from, to, reply } => {
            let _ = reply.send(fs.rename(store, &from, &to));
        }
        FsOp::Truncate { path, size, reply } => {
            let _ = reply.send(fs.truncate(store, &path, size));
        }
        FsOp::Open { path, mode, reply } => {
            let _ = reply.send(fs.open(store, &path, mode));
        }
        FsOp::Read { path, offset, size, reply } => {
            let _ = reply.send(fs.read(store, &path, offset, size));
        }
        FsOp::Write { path, offset, data, reply } => {
            let _ = reply.send(fs.write(store, &path, offset, &data));
        }
        FsOp::Release { path, reply } => {
            let _ = reply.send(fs.release(store, &path));
        }
        FsOp::Readdir { path, reply } => {
            let _ = reply.send(fs.readdir(&path));
        }
        FsOp::Flush { path, reply } => {
            let _ = reply.send(fs.flush(&path));
        }
    }
}

/// Cloneable handle given to the kernel binding. Every method blocks the
/// calling thread until the loop answers, so these must never be called
/// from inside the event loop itself.
#[derive(Clone)]
pub struct FsHandle {
    tx: mpsc::UnboundedSender<FsOp>,
}

impl FsHandle {
    pub fn new() -> (FsHandle, mpsc::UnboundedReceiver<FsOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FsHandle { tx }, rx)
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> FsOp) -> FsResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| libc::EIO)?;
        rx.blocking_recv().map_err(|_| libc::EIO)?
    }

    pub fn getattr(&self, path: &str) -> FsResult<Attr> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Getattr { path, reply })
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Mkdir { path, reply })
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Rmdir { path, reply })
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Unlink { path, reply })
    }

    pub fn create(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Create { path, reply })
    }

    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let (from, to) = (from.to_owned(), to.to_owned());
        self.call(|reply| FsOp::Rename { from, to, reply })
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Truncate { path, size, reply })
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Open { path, mode, reply })
    }

    pub fn read(&self, path: &str, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Read { path, offset, size, reply })
    }

    pub fn write(&self, path: &str, offset: u64, data: Vec<u8>) -> FsResult<usize> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Write { path, offset, data, reply })
    }

    pub fn release(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Release { path, reply })
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Readdir { path, reply })
    }

    pub fn flush(&self, path: &str) -> FsResult<()> {
        let path = path.to_owned();
        self.call(|reply| FsOp::Flush { path, reply })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::fs::FsConfig;

    #[test]
    fn bridged_calls_block_until_the_loop_answers() {
        let dir = TempDir::new().unwrap();
        let mut store =
            ChangeStore::open(dir.path().join("store"), dir.path().join("scratch")).unwrap();
        let (sync_tx, _sync_rx) = mpsc::unbounded_channel();
        let mut fs = FsState::new(
            FsConfig {
                id: "foo".to_owned(),
                uid: 0,
                gid: 0,
                file_mode: 0o644,
                dir_mode: 0o755,
                seed: 1,
            },
            sync_tx,
        );

        let (handle, mut rx) = FsHandle::new();
        let caller = std::thread::spawn(move || {
            handle.mkdir("/a")?;
            handle.getattr("/a")
        });

        // Play the event loop by hand: serve ops until the caller is done.
        for _ in 0..2 {
            let op = rx.blocking_recv().expect("caller hung up early");
            apply(op, &mut fs, &mut store);
        }

        let attr = caller.join().unwrap().expect("bridged calls failed");
        assert_eq!(attr.kind, crate::fs::node::NodeKind::Dir);
        assert_eq!(attr.mode, 0o755);
    }
}
