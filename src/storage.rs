//! # Content-Addressed Staging Store
//!
//! Holds one extracted filesystem per distinct [`ContentHash`] under the
//! managed root.
//!
//! ## Storage Model
//!
//! Staged images live in a two-level directory structure:
//!
//! ```text
//! <root>/.images/
//! ├── ab/
//! │   ├── cd1234...  (extracted filesystem)
//! │   └── 9f8e7d...
//! └── cd/
//!     └── ef5678...
//! ```
//!
//! The first two hex characters form a "shard" directory to bound directory
//! sizes on the distributed filesystem.
//!
//! ## Deduplication
//!
//! The directory itself is the "already staged" marker; there is no
//! separate completion flag. Directories are only created inside a
//! transaction, and a failed extraction discards its directory before the
//! transaction is committed, so readers never see partial content.
//!
//! ## Garbage Collection
//!
//! [`StagingStore::gc`] removes staged directories whose hash is not in the
//! caller's referenced set, then prunes emptied shard directories.
//!
//! **Warning**: GC assumes it is the only writer. The transaction held by
//! the caller provides that exclusion on the distributed filesystem.

use crate::constants::IMAGES_DIR;
use crate::digest::ContentHash;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Returns the staging directory of `hash` under `root`.
pub fn image_path(root: &Path, hash: &ContentHash) -> PathBuf {
    let (shard, rest) = hash.shard();
    root.join(IMAGES_DIR).join(shard).join(rest)
}

/// Content-addressed directory allocator for staged filesystems.
#[derive(Debug, Clone)]
pub struct StagingStore {
    /// Managed root the `.images` tree lives under.
    root: PathBuf,
}

impl StagingStore {
    /// Creates a store rooted at the managed root.
    ///
    /// Nothing is created on disk; the root may be read-only until a
    /// transaction opens.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the managed root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding all staged images.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Gets the staging directory for a hash without touching the disk.
    pub fn image_path(&self, hash: &ContentHash) -> PathBuf {
        image_path(&self.root, hash)
    }

    /// Checks if content with this hash is already staged.
    pub fn is_staged(&self, hash: &ContentHash) -> bool {
        self.image_path(hash).is_dir()
    }

    /// Maps a staging directory back to its content hash.
    pub fn hash_of(&self, path: &Path) -> Option<ContentHash> {
        let relative = path.strip_prefix(self.images_dir()).ok()?;
        let mut parts = relative.iter().map(|p| p.to_str());
        let (Some(Some(shard)), Some(Some(rest)), None) = (parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        ContentHash::from_hex(&format!("{}{}", shard, rest)).ok()
    }

    /// Returns the staging directory for `hash`, creating it if needed.
    ///
    /// The boolean is `true` when the content was already staged, in which
    /// case nothing is mutated and no transaction is opened. Otherwise the
    /// transaction is begun, existence is checked again, and the directory
    /// tree is created.
    pub fn ensure_allocated(
        &self,
        tx: &mut Transaction<'_>,
        hash: &ContentHash,
    ) -> Result<(PathBuf, bool)> {
        let path = self.image_path(hash);

        if path.is_dir() {
            debug!("Image {} already staged", hash);
            return Ok((path, true));
        }

        tx.begin()?;

        if path.is_dir() {
            debug!("Image {} staged concurrently", hash);
            return Ok((path, true));
        }

        // create_dir_all treats an existing directory as success, which
        // covers a racing writer creating the same tree.
        fs::create_dir_all(&path).map_err(|e| Error::StagingFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        info!("Allocated staging directory {}", path.display());
        Ok((path, false))
    }

    /// Removes a staged directory, e.g. after a failed extraction.
    pub fn discard(&self, tx: &mut Transaction<'_>, hash: &ContentHash) -> Result<()> {
        let path = self.image_path(hash);
        if !path.exists() {
            return Ok(());
        }

        tx.begin()?;
        fs::remove_dir_all(&path).map_err(|e| Error::StagingFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!("Discarded {}", path.display());
        Ok(())
    }

    /// Lists all staged content hashes.
    ///
    /// Entries that do not form a valid hash are ignored.
    pub fn list_staged(&self) -> Result<Vec<ContentHash>> {
        let images_dir = self.images_dir();
        let mut hashes = Vec::new();

        if !images_dir.is_dir() {
            return Ok(hashes);
        }

        for shard in fs::read_dir(&images_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }

            for image in fs::read_dir(shard.path())? {
                let image = image?;
                if !image.file_type()?.is_dir() {
                    continue;
                }
                match self.hash_of(&image.path()) {
                    Some(hash) => hashes.push(hash),
                    None => warn!("Ignoring unexpected entry {}", image.path().display()),
                }
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// Garbage collects staged images not in `referenced`.
    pub fn gc(
        &self,
        tx: &mut Transaction<'_>,
        referenced: &HashSet<ContentHash>,
    ) -> Result<GcStats> {
        let mut stats = GcStats::default();

        for hash in self.list_staged()? {
            if referenced.contains(&hash) {
                stats.kept_count += 1;
                continue;
            }

            tx.begin()?;
            let path = self.image_path(&hash);
            fs::remove_dir_all(&path).map_err(|e| Error::StagingFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            debug!("GC: removed {}", path.display());
            stats.removed_count += 1;
        }

        if stats.removed_count > 0 {
            self.prune_empty_shards();
        }

        info!(
            "GC: removed {} staged images, kept {}",
            stats.removed_count, stats.kept_count
        );
        Ok(stats)
    }

    fn prune_empty_shards(&self) {
        let Ok(shards) = fs::read_dir(self.images_dir()) else {
            return;
        };
        for shard in shards.flatten() {
            // remove_dir only succeeds on empty directories
            let _ = fs::remove_dir(shard.path());
        }
    }
}

/// Statistics from a garbage collection run.
///
/// Returned by [`StagingStore::gc`] to report cleanup results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of staged images removed.
    pub removed_count: u64,
    /// Number of staged images still referenced.
    pub kept_count: u64,
}
