//! Mirror configuration.
//!
//! Loaded from a JSON file, with every field optional:
//!
//! ```json
//! {
//!   "repository": "images.example.org",
//!   "root": "/cvmfs/images.example.org",
//!   "engine": "podman",
//!   "max_attempts": 5
//! }
//! ```
//!
//! Paths that depend on the repository name (`root`, `lock_path`) are
//! derived from it when left out.

use crate::constants::{
    DEFAULT_ENGINE_BIN, DEFAULT_REGISTRY, MANAGED_PREFIX, MAX_PUBLISH_ATTEMPTS, SPOOL_DIR,
    TRANSACTION_LOCK_FILE,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default repository name.
pub const DEFAULT_REPOSITORY: &str = "images.example.org";

/// Settings for one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Name of the transactional repository.
    pub repository: String,
    /// Mount prefix of the transactional filesystem.
    pub managed_prefix: PathBuf,
    /// Managed root holding `.images/` and the tag aliases.
    pub root: PathBuf,
    /// Lock artifact left by an open transaction.
    pub lock_path: PathBuf,
    /// Registry assumed for references without one.
    pub default_registry: String,
    /// Docker-compatible container engine program.
    pub engine: String,
    /// Directory for temporary export streams.
    pub scratch_dir: PathBuf,
    /// Publish attempts per image.
    pub max_attempts: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    repository: Option<String>,
    managed_prefix: Option<PathBuf>,
    root: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    default_registry: Option<String>,
    engine: Option<String>,
    scratch_dir: Option<PathBuf>,
    max_attempts: Option<u32>,
}

impl MirrorConfig {
    /// Default configuration for a named repository.
    pub fn for_repository(repository: impl Into<String>) -> Self {
        let repository = repository.into();
        Self {
            root: Path::new(MANAGED_PREFIX).join(&repository),
            lock_path: Self::default_lock_path(&repository),
            managed_prefix: PathBuf::from(MANAGED_PREFIX),
            default_registry: DEFAULT_REGISTRY.to_string(),
            engine: DEFAULT_ENGINE_BIN.to_string(),
            scratch_dir: Self::default_scratch_dir(),
            max_attempts: MAX_PUBLISH_ATTEMPTS,
            repository,
        }
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parses a JSON configuration, filling in defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        let partial: PartialConfig =
            serde_json::from_str(content).map_err(|e| Error::Serialization(e.to_string()))?;

        let repository = partial
            .repository
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string());
        let mut config = Self::for_repository(repository);

        if let Some(prefix) = partial.managed_prefix {
            config.managed_prefix = prefix;
        }
        config.root = partial
            .root
            .unwrap_or_else(|| config.managed_prefix.join(&config.repository));
        if let Some(lock_path) = partial.lock_path {
            config.lock_path = lock_path;
        }
        if let Some(registry) = partial.default_registry {
            config.default_registry = registry;
        }
        if let Some(engine) = partial.engine {
            config.engine = engine;
        }
        if let Some(scratch_dir) = partial.scratch_dir {
            config.scratch_dir = scratch_dir;
        }
        if let Some(max_attempts) = partial.max_attempts {
            config.max_attempts = max_attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the mirror cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            return Err(Error::InvalidConfig("repository name is empty".to_string()));
        }
        if !self.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "root {} is not an absolute path",
                self.root.display()
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.trim().is_empty() {
            return Err(Error::InvalidConfig("engine program is empty".to_string()));
        }
        Ok(())
    }

    fn default_lock_path(repository: &str) -> PathBuf {
        Path::new(SPOOL_DIR)
            .join(repository)
            .join(TRANSACTION_LOCK_FILE)
    }

    fn default_scratch_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache) => cache.join("magikmirror"),
            None => std::env::temp_dir().join("magikmirror"),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::for_repository(DEFAULT_REPOSITORY)
    }
}
