//! # Mirror Constants
//!
//! Defaults, on-disk layout names and bounds shared by every stage of the
//! mirror. These constants are the single source of truth for the layout of
//! the managed root:
//!
//! ```text
//! <root>/
//! ├── .images/
//! │   └── ab/
//! │       └── cdef0123...          (staged filesystem, immutable)
//! └── <namespace>/
//!     └── <repository>:<tag>  ->   <root>/.images/ab/cdef0123...
//! ```
//!
//! ## Cross-References
//!
//! - [`crate::reference`]: default registry, namespace and tag
//! - [`crate::storage`]: content-addressed layout
//! - [`crate::materialize`]: reserved mount points
//! - [`crate::transaction`]: managed prefix and lock artifact
//! - [`crate::mirror`]: retry bound

use std::time::Duration;

// =============================================================================
// Image References
// =============================================================================

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Namespace assumed for single-segment references (`openjdk:8`).
pub const DEFAULT_NAMESPACE: &str = "library";

/// Tag assumed when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Characters that turn a tag into a wildcard pattern.
pub const TAG_WILDCARD_CHARS: &[char] = &['*', '?', '['];

// =============================================================================
// Storage Layout
// =============================================================================

/// Directory under the managed root holding content-addressed filesystems.
pub const IMAGES_DIR: &str = ".images";

/// Number of leading hash characters used as the fan-out directory.
pub const SHARD_PREFIX_LEN: usize = 2;

/// Directories every staged filesystem must carry as mount targets.
///
/// Service data, nested distributed filesystem, device nodes, process
/// information and kernel interfaces, in that order.
pub const RESERVED_MOUNT_DIRS: &[&str] = &["srv", "cvmfs", "dev", "proc", "sys"];

// =============================================================================
// Transactional Filesystem
// =============================================================================

/// Mount prefix of the transactional filesystem.
///
/// Roots outside this prefix are plain directories and never open a
/// transaction.
pub const MANAGED_PREFIX: &str = "/cvmfs";

/// Spool directory holding per-repository transaction state.
pub const SPOOL_DIR: &str = "/var/spool/cvmfs";

/// File name of the lock artifact left by an open transaction.
pub const TRANSACTION_LOCK_FILE: &str = "in_transaction.lock";

/// Control-plane command for the transactional filesystem.
pub const CVMFS_SERVER_BIN: &str = "cvmfs_server";

// =============================================================================
// Batch Behavior
// =============================================================================

/// Attempts made per image before it is recorded as failed.
pub const MAX_PUBLISH_ATTEMPTS: u32 = 3;

/// Upper bound on a single registry round trip.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Prefix of ephemeral container names created for export.
pub const EXPORT_CONTAINER_PREFIX: &str = "magikmirror";

/// Default container engine program.
pub const DEFAULT_ENGINE_BIN: &str = "docker";
