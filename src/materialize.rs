//! Filesystem materialization.
//!
//! Extracts the tar stream exported from an ephemeral container into a
//! staging directory, then makes the result usable from a read-only,
//! world-readable distributed filesystem:
//!
//! 1. **Extraction**: every entry is unpacked in order. Paths with `..` or
//!    a leading `/` abort the whole extraction. Device nodes and FIFOs are
//!    skipped since they cannot be created unprivileged and are provided by
//!    the runtime's `/dev` mount anyway. Directories whose recorded mode
//!    would lock us out get their final mode applied after the tree is
//!    written.
//! 2. **Permission normalization**: regular files with no read bit gain
//!    owner-read; directories with no execute bit gain owner-execute and
//!    with no write bit gain owner-write.
//! 3. **Reserved mount points**: [`RESERVED_MOUNT_DIRS`] are created empty
//!    when missing.
//!
//! Any error means the staging directory must be discarded and never
//! reached by a tag alias.

use crate::constants::RESERVED_MOUNT_DIRS;
use crate::error::{Error, Result};
use std::fs::{self, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Owner read/write/execute bits.
const OWNER_RWX: u32 = 0o700;

/// Counters from one materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    /// Entries written to disk.
    pub entries: u64,
    /// Device and FIFO entries skipped.
    pub skipped: u64,
    /// Sum of entry payload sizes.
    pub bytes: u64,
    /// Files and directories whose mode was widened.
    pub normalized: u64,
}

/// Extracts `export` into `dir` and prepares it for publication.
pub fn materialize(dir: &Path, export: impl Read) -> Result<MaterializeStats> {
    let mut stats = extract(dir, export)?;
    stats.normalized = normalize_permissions(dir)?;
    ensure_reserved_dirs(dir)?;

    info!(
        "Materialized {} ({} entries, {} bytes, {} skipped, {} modes fixed)",
        dir.display(),
        stats.entries,
        stats.bytes,
        stats.skipped,
        stats.normalized
    );
    Ok(stats)
}

fn extract(dir: &Path, export: impl Read) -> Result<MaterializeStats> {
    let failed = |e: io::Error| Error::ExtractionFailed {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };

    let mut archive = Archive::new(export);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut stats = MaterializeStats::default();
    let mut deferred_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries().map_err(failed)? {
        let mut entry = entry.map_err(failed)?;
        let path = entry.path().map_err(failed)?.into_owned();

        // SECURITY: Check for path traversal
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().to_string(),
            });
        }

        let kind = entry.header().entry_type();
        if kind.is_character_special() || kind.is_block_special() || kind.is_fifo() {
            debug!("Skipping special file {}", path.display());
            stats.skipped += 1;
            continue;
        }

        let mode = entry.header().mode().map_err(failed)?;
        stats.bytes += entry.size();

        if !entry.unpack_in(dir).map_err(failed)? {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().to_string(),
            });
        }
        stats.entries += 1;

        if kind.is_dir() && mode & OWNER_RWX != OWNER_RWX {
            let target = dir.join(&path);
            fs::set_permissions(&target, Permissions::from_mode(mode | OWNER_RWX))
                .map_err(failed)?;
            deferred_modes.push((target, mode & 0o7777));
        }
    }

    // Innermost first, so parents stay writable until their children are done.
    for (path, mode) in deferred_modes.into_iter().rev() {
        fs::set_permissions(&path, Permissions::from_mode(mode)).map_err(failed)?;
    }

    Ok(stats)
}

/// Widens modes so every file is readable and every directory traversable.
///
/// Symlinks are not followed. Returns the number of entries changed;
/// running it again on the same tree changes nothing.
pub fn normalize_permissions(dir: &Path) -> Result<u64> {
    let mut changed = 0u64;

    // Directories are yielded before their contents, so a directory is
    // made traversable before the walk descends into it.
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::ExtractionFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| Error::ExtractionFailed {
            path: entry.path().to_path_buf(),
            reason: e.to_string(),
        })?;
        let mode = metadata.permissions().mode();

        let wanted = if file_type.is_dir() {
            normalized_dir_mode(mode)
        } else if file_type.is_file() {
            normalized_file_mode(mode)
        } else {
            mode
        };

        if wanted != mode {
            fs::set_permissions(entry.path(), Permissions::from_mode(wanted))?;
            changed += 1;
        }
    }

    Ok(changed)
}

/// Mode a regular file is normalized to.
pub fn normalized_file_mode(mode: u32) -> u32 {
    if mode & 0o444 == 0 { mode | 0o400 } else { mode }
}

/// Mode a directory is normalized to.
pub fn normalized_dir_mode(mode: u32) -> u32 {
    let mut mode = mode;
    if mode & 0o111 == 0 {
        mode |= 0o100;
    }
    if mode & 0o222 == 0 {
        mode |= 0o200;
    }
    mode
}

/// Creates the reserved mount-point directories that are missing.
///
/// Existing entries of any type are left untouched.
pub fn ensure_reserved_dirs(dir: &Path) -> Result<()> {
    for name in RESERVED_MOUNT_DIRS {
        let path = dir.join(name);
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }

        match fs::create_dir(&path) {
            Ok(()) => debug!("Created mount point {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Error::ExtractionFailed {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(())
}
