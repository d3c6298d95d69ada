//! Error types for the mirror.

use std::path::PathBuf;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while staging and publishing images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Manifest could not be fetched or understood.
    #[error("failed to fetch manifest for '{reference}': {reason}")]
    ManifestFetchFailed { reference: String, reason: String },

    /// Tag listing failed for a repository.
    #[error("failed to list tags for '{repository}': {reason}")]
    TagListFailed { repository: String, reason: String },

    /// Wildcard tag pattern is not a valid glob.
    #[error("invalid tag pattern '{pattern}': {reason}")]
    InvalidTagPattern { pattern: String, reason: String },

    // =========================================================================
    // Container Engine Errors
    // =========================================================================
    /// Image pull through the container engine failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Container create/export/remove failed.
    #[error("container engine '{operation}' failed: {reason}")]
    EngineFailed { operation: String, reason: String },

    // =========================================================================
    // Extraction Errors
    // =========================================================================
    /// Export stream could not be extracted.
    #[error("failed to extract into {path}: {reason}")]
    ExtractionFailed { path: PathBuf, reason: String },

    /// Path traversal attempt detected in the export stream.
    #[error("path traversal detected in export stream: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Staging Errors
    // =========================================================================
    /// Staging directory could not be created or removed.
    #[error("staging failed at {path}: {reason}")]
    StagingFailed { path: PathBuf, reason: String },

    /// Content hash is not a valid hex digest.
    #[error("invalid content hash '{0}'")]
    InvalidContentHash(String),

    // =========================================================================
    // Tag Alias Errors
    // =========================================================================
    /// Something other than a symlink occupies the alias path.
    #[error("tag alias path {path} exists and is not a symlink")]
    TagConflict { path: PathBuf },

    /// Symlink could not be created, read or removed.
    #[error("failed to update tag alias {path}: {reason}")]
    TagUpdateFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Underlying begin operation failed.
    #[error("failed to open transaction on '{repository}': {reason}")]
    TransactionBeginFailed { repository: String, reason: String },

    /// Underlying commit operation failed.
    #[error("failed to publish transaction on '{repository}': {reason}")]
    TransactionCommitFailed { repository: String, reason: String },

    /// Underlying abort operation failed.
    #[error("failed to abort transaction on '{repository}': {reason}")]
    TransactionAbortFailed { repository: String, reason: String },

    /// A second transaction handle was requested while one is open.
    #[error("a transaction on '{0}' is already held by this process")]
    TransactionInProgress(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration is missing or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },
}

impl Error {
    /// Process exit status reported for this failure.
    ///
    /// | Code | Category |
    /// |------|----------|
    /// | 1 | I/O, serialization, staging |
    /// | 2 | registry (manifest, tag listing, timeouts) |
    /// | 3 | container engine |
    /// | 4 | extraction |
    /// | 5 | transaction |
    /// | 6 | tag alias |
    /// | 7 | configuration |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ManifestFetchFailed { .. }
            | Self::TagListFailed { .. }
            | Self::InvalidTagPattern { .. }
            | Self::Timeout { .. } => 2,
            Self::ImagePullFailed { .. } | Self::EngineFailed { .. } => 3,
            Self::ExtractionFailed { .. } | Self::PathTraversal { .. } => 4,
            Self::TransactionBeginFailed { .. }
            | Self::TransactionCommitFailed { .. }
            | Self::TransactionAbortFailed { .. }
            | Self::TransactionInProgress(_) => 5,
            Self::TagConflict { .. } | Self::TagUpdateFailed { .. } => 6,
            Self::InvalidConfig(_) => 7,
            Self::StagingFailed { .. }
            | Self::InvalidContentHash(_)
            | Self::Io(_)
            | Self::Serialization(_) => 1,
        }
    }
}
