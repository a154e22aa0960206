//! The content-versioned blob store.
//!
//! Blobs live at `root/<urlencoded key>/<version>`, one regular file per
//! version, never rewritten once committed. In-progress writes go through
//! scratch files kept under a sibling directory so the startup scan of the
//! blob root can never mistake half-written data for a version.
//!
//! Authoritative state is the `{key -> versions}` map recovered by scanning
//! the root at startup; every operation validates against it before
//! touching the filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Errors raised by the blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key, version combo ({key}, {version}) does not exist")]
    Missing { key: String, version: String },

    #[error("key, version combo ({key}, {version}) already exists")]
    Exists { key: String, version: String },

    #[error("store root {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A writable scratch file backing an in-progress write for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scratch {
    pub key: String,
    pub path: PathBuf,
}

/// The on-disk blob store for one node.
pub struct ChangeStore {
    root: PathBuf,
    scratch_root: PathBuf,
    versions: BTreeMap<String, BTreeSet<String>>,
    next_scratch: u64,
}

impl ChangeStore {
    /// Open the store, creating `root` and `scratch_root` if absent and
    /// recovering the version map by directory scan. Entries that are not
    /// plain subdirectories or plain files are warned about and skipped.
    pub fn open(root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Result<ChangeStore, StoreError> {
        let root = root.into();
        let scratch_root = scratch_root.into();

        let mut versions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        if root.exists() {
            if !root.is_dir() {
                return Err(StoreError::NotADirectory(root));
            }
            tracing::info!(root = %root.display(), "recovering blob store");
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    tracing::warn!(
                        entry = %entry.path().display(),
                        "non-directory entry in store root; skipping"
                    );
                    continue;
                }
                let key = entry.file_name().to_string_lossy().into_owned();
                let mut found = BTreeSet::new();
                for version_entry in fs::read_dir(entry.path())? {
                    let version_entry = version_entry?;
                    if !version_entry.file_type()?.is_file() {
                        tracing::warn!(
                            entry = %version_entry.path().display(),
                            "version is not a regular file; skipping"
                        );
                        continue;
                    }
                    found.insert(version_entry.file_name().to_string_lossy().into_owned());
                }
                versions.insert(key, found);
            }
        } else {
            tracing::info!(root = %root.display(), "blob store being created");
            fs::create_dir_all(&root)?;
        }

        // Scratches do not survive a restart; their writers are gone.
        if scratch_root.exists() {
            fs::remove_dir_all(&scratch_root)?;
        }
        fs::create_dir_all(&scratch_root)?;

        Ok(ChangeStore {
            root,
            scratch_root,
            versions,
            next_scratch: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Does any version of `key` exist?
    pub fn exists_key(&self, key: &str) -> bool {
        self.versions.get(key).is_some_and(|set| !set.is_empty())
    }

    /// Does this exact `(key, version)` exist?
    pub fn exists(&self, key: &str, version: &str) -> bool {
        self.versions
            .get(key)
            .is_some_and(|set| set.contains(version))
    }

    /// The path of a stored blob, failing if it is missing.
    pub fn path(&self, key: &str, version: &str) -> Result<PathBuf, StoreError> {
        if !self.exists(key, version) {
            return Err(self.missing(key, version));
        }
        Ok(self.root.join(key).join(version))
    }

    /// Register a new `(key, version)` and return the path for the caller
    /// to write; the blob does not exist until written.
    pub fn add(&mut self, key: &str, version: &str) -> Result<PathBuf, StoreError> {
        if self.exists(key, version) {
            return Err(StoreError::Exists {
                key: key.to_owned(),
                version: version.to_owned(),
            });
        }
        let dir = self.root.join(key);
        if !dir.exists() {
            fs::create_dir(&dir)?;
        }
        self.versions
            .entry(key.to_owned())
            .or_default()
            .insert(version.to_owned());
        Ok(dir.join(version))
    }

    /// Copy `(key, version)` to `(new_key, version)`. Repeats are silently
    /// ignored; a missing source fails.
    pub fn copy(&mut self, key: &str, version: &str, new_key: &str) -> Result<(), StoreError> {
        if !self.exists(key, version) {
            return Err(self.missing(key, version));
        }
        if self.exists(new_key, version) {
            return Ok(());
        }
        let dir = self.root.join(new_key);
        if !dir.exists() {
            fs::create_dir(&dir)?;
        }
        fs::copy(self.root.join(key).join(version), dir.join(version))?;
        self.versions
            .entry(new_key.to_owned())
            .or_default()
            .insert(version.to_owned());
        Ok(())
    }

    /// Move `(key, version)` to `(new_key, new_version)`, removing the
    /// source key directory when it empties.
    pub fn rename(
        &mut self,
        key: &str,
        version: &str,
        new_key: &str,
        new_version: &str,
    ) -> Result<(), StoreError> {
        if !self.exists(key, version) {
            return Err(self.missing(key, version));
        }
        if self.exists(new_key, new_version) {
            return Err(StoreError::Exists {
                key: new_key.to_owned(),
                version: new_version.to_owned(),
            });
        }
        let dir = self.root.join(new_key);
        if !dir.exists() {
            fs::create_dir(&dir)?;
        }
        fs::rename(
            self.root.join(key).join(version),
            dir.join(new_version),
        )?;
        self.versions
            .entry(new_key.to_owned())
            .or_default()
            .insert(new_version.to_owned());
        self.forget(key, version)?;
        Ok(())
    }

    /// Delete `(key, version)`, removing the key directory when it empties.
    pub fn kill(&mut self, key: &str, version: &str) -> Result<(), StoreError> {
        if !self.exists(key, version) {
            return Err(self.missing(key, version));
        }
        fs::remove_file(self.root.join(key).join(version))?;
        self.forget(key, version)?;
        Ok(())
    }

    /// The stored size of a blob in bytes.
    pub fn len(&self, key: &str, version: &str) -> Result<u64, StoreError> {
        Ok(fs::metadata(self.path(key, version)?)?.len())
    }

    /// Read up to `size` bytes of a blob starting at `offset`.
    pub fn read(
        &self,
        key: &str,
        version: &str,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let mut file = fs::File::open(self.path(key, version)?)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; size.min((len - offset) as usize)];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Create a fresh, empty scratch file for `key`.
    pub fn scratch(&mut self, key: &str) -> Result<Scratch, StoreError> {
        let token = self.next_scratch;
        self.next_scratch += 1;
        let path = self.scratch_root.join(format!("{key}.{token}"));
        fs::File::create(&path)?;
        Ok(Scratch {
            key: key.to_owned(),
            path,
        })
    }

    /// Create a scratch for `key` seeded with the bytes of an existing
    /// version.
    pub fn scratch_from(&mut self, key: &str, version: &str) -> Result<Scratch, StoreError> {
        let source = self.path(key, version)?;
        let scratch = self.scratch(key)?;
        fs::copy(source, &scratch.path)?;
        Ok(scratch)
    }

    /// Write `data` into a scratch at `offset`, growing it as needed.
    pub fn write_scratch(
        &mut self,
        scratch: &Scratch,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, StoreError> {
        let mut file = fs::OpenOptions::new().write(true).open(&scratch.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    /// Append `data` to the end of a scratch.
    pub fn append_scratch(&mut self, scratch: &Scratch, data: &[u8]) -> Result<(), StoreError> {
        let mut file = fs::OpenOptions::new().append(true).open(&scratch.path)?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn read_scratch(
        &self,
        scratch: &Scratch,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let mut file = fs::File::open(&scratch.path)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; size.min((len - offset) as usize)];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn truncate_scratch(&mut self, scratch: &Scratch, size: u64) -> Result<(), StoreError> {
        let file = fs::OpenOptions::new().write(true).open(&scratch.path)?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn scratch_len(&self, scratch: &Scratch) -> Result<u64, StoreError> {
        Ok(fs::metadata(&scratch.path)?.len())
    }

    /// Promote a scratch to the permanent blob for `(key, version)`. The
    /// rename is atomic, so a crash leaves either the scratch or the blob,
    /// never a torn version.
    pub fn commit_scratch(&mut self, scratch: Scratch, version: &str) -> Result<(), StoreError> {
        if self.exists(&scratch.key, version) {
            return Err(StoreError::Exists {
                key: scratch.key,
                version: version.to_owned(),
            });
        }
        let dir = self.root.join(&scratch.key);
        if !dir.exists() {
            fs::create_dir(&dir)?;
        }
        fs::rename(&scratch.path, dir.join(version))?;
        self.versions
            .entry(scratch.key)
            .or_default()
            .insert(version.to_owned());
        Ok(())
    }

    /// Drop a scratch without committing it.
    pub fn discard_scratch(&mut self, scratch: Scratch) {
        if let Err(err) = fs::remove_file(&scratch.path) {
            tracing::warn!(path = %scratch.path.display(), error = %err, "failed to remove scratch");
        }
    }

    /// Iterate every known `(key, version)` pair.
    pub fn versions(&self) -> impl Iterator<Item = (&String, &String)> {
        self.versions
            .iter()
            .flat_map(|(key, set)| set.iter().map(move |version| (key, version)))
    }

    fn forget(&mut self, key: &str, version: &str) -> Result<(), StoreError> {
        let emptied = if let Some(set) = self.versions.get_mut(key) {
            set.remove(version);
            set.is_empty()
        } else {
            false
        };
        if emptied {
            self.versions.remove(key);
            fs::remove_dir_all(self.root.join(key))?;
        }
        Ok(())
    }

    fn missing(&self, key: &str, version: &str) -> StoreError {
        StoreError::Missing {
            key: key.to_owned(),
            version: version.to_owned(),
        }
    }
}
