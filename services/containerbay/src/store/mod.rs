//! Directory-backed cache of extracted images.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<key>/            fully extracted image, served as-is
//! <root>/<key>.partial/    staging area of an in-flight fetch
//!     rootfs/              renamed to <root>/<key> on success
//!     blobs/               downloaded layers
//! ```
//!
//! An entry only appears under its final name through a single rename, so
//! [`CacheStore::exists`] never observes a half-written image. Every mutation
//! of a key happens under that key's lock, and the reclamation sweep skips
//! keys that are locked.

mod locks;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::is_sha256_hex;

pub use locks::{KeyGuard, LockTable};

const STAGING_SUFFIX: &str = ".partial";

/// Errors from cache store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid cache key '{0}'")]
    InvalidKey(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Hex content digest naming one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from `sha256:<hex>` or bare `<hex>`.
    pub fn from_digest(digest: &str) -> Result<Self, StoreError> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        if is_sha256_hex(hex) {
            Ok(Self(hex.to_string()))
        } else {
            Err(StoreError::InvalidKey(digest.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `sha256:<hex>` digest this key was derived from.
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Staging area for one key, created under that key's lock.
#[derive(Debug)]
pub struct Staging {
    key: CacheKey,
    dir: PathBuf,
}

impl Staging {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Directory the extracted filesystem goes into.
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    /// Scratch directory for downloads.
    pub fn blobs(&self) -> PathBuf {
        self.dir.join("blobs")
    }
}

/// Disk cache of extracted images with per-key locking.
pub struct CacheStore {
    root: PathBuf,
    locks: LockTable,
}

impl CacheStore {
    /// Create a store rooted at `root`. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: LockTable::new(),
        }
    }

    /// Create the cache root if it is missing.
    pub fn ensure_exists(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a fully written entry for `key` is on disk.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.path(key).is_dir()
    }

    /// Entry directory for `key`.
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Path of `segments` inside the entry for `key`.
    pub fn path_with<I, S>(&self, key: &CacheKey, segments: I) -> PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        segments
            .into_iter()
            .fold(self.path(key), |path, segment| path.join(segment))
    }

    /// Acquire exclusive access to `key`, waiting if needed.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        self.locks.lock(key.as_str()).await
    }

    /// Acquire exclusive access to `key` if it is free right now.
    pub fn try_lock(&self, key: &CacheKey) -> Option<KeyGuard> {
        self.locks.try_lock(key.as_str())
    }

    /// Whether `key` is held or awaited.
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        self.locks.is_locked(key.as_str())
    }

    /// Remove every entry under the root, locked or not.
    pub fn clean_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;

        for name in self.entry_names()? {
            if remove_entry(&self.root.join(&name)) {
                debug!(entry = %name, "Entry pruned");
                removed += 1;
            }
        }

        info!(removed = removed, root = %self.root.display(), "Cache store emptied");
        Ok(removed)
    }

    /// Remove every entry nobody holds a lock on.
    ///
    /// Each entry is locked for the duration of its removal, so a fetch cannot
    /// start on a key that is being deleted.
    pub fn clean(&self) -> Result<usize, StoreError> {
        let mut removed = 0;

        for name in self.entry_names()? {
            let key = name.strip_suffix(STAGING_SUFFIX).unwrap_or(&name);

            let Some(_guard) = self.locks.try_lock(key) else {
                debug!(entry = %name, "Entry locked, skipping");
                continue;
            };

            if remove_entry(&self.root.join(&name)) {
                debug!(entry = %name, "Entry pruned");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed = removed, "Cache sweep complete");
        }
        Ok(removed)
    }

    /// Prepare a fresh staging area for the key held by `guard`.
    pub fn stage(&self, key: &CacheKey, guard: &KeyGuard) -> Result<Staging, StoreError> {
        debug_assert_eq!(guard.key(), key.as_str());

        let dir = self.root.join(format!("{key}{STAGING_SUFFIX}"));
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }

        let staging = Staging {
            key: key.clone(),
            dir,
        };
        for path in [staging.rootfs(), staging.blobs()] {
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }

        Ok(staging)
    }

    /// Make a staged entry visible under its final name.
    pub fn publish(&self, staging: Staging) -> Result<(), StoreError> {
        let target = self.path(&staging.key);

        if target.exists() {
            warn!(digest = %staging.key, "Entry already present, discarding staged copy");
        } else {
            let rootfs = staging.rootfs();
            fs::rename(&rootfs, &target).map_err(|e| StoreError::io(&target, e))?;
        }

        self.discard(staging);
        Ok(())
    }

    /// Throw a staging area away.
    pub fn discard(&self, staging: Staging) {
        if let Err(e) = fs::remove_dir_all(&staging.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    path = %staging.dir.display(),
                    error = %e,
                    "Failed to remove staging area"
                );
            }
        }
    }

    fn entry_names(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

impl fmt::Display for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

fn remove_entry(path: &Path) -> bool {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to prune entry");
            false
        }
    }
}
