//! Tag alias management.
//!
//! A tag alias is a symlink `<root>/<namespace>/<repository>:<tag>` pointing
//! at a staged directory under `<root>/.images/`. Aliases are the only
//! mutable names in the mirror; the content they point at never changes.
//!
//! Repointing an alias unlinks the old symlink and creates a new one. The
//! two calls are not atomic on their own; the enclosing transaction keeps
//! the intermediate state invisible until commit.

use crate::constants::IMAGES_DIR;
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use crate::transaction::Transaction;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// What [`TagAliasManager::publish`] did to an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasUpdate {
    /// Alias already pointed at the directory; nothing was touched.
    UpToDate,
    /// Alias did not exist and was created.
    Created,
    /// Alias pointed elsewhere and was repointed.
    Replaced {
        /// Previous symlink target.
        previous: PathBuf,
    },
}

/// An existing tag alias found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAlias {
    /// Alias path.
    pub path: PathBuf,
    /// Symlink target.
    pub target: PathBuf,
}

/// Creates, repoints and enumerates tag aliases under a managed root.
#[derive(Debug, Clone)]
pub struct TagAliasManager {
    root: PathBuf,
}

impl TagAliasManager {
    /// Creates a manager for the managed root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the managed root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the alias for `namespace/repository:tag`.
    pub fn alias_path(&self, namespace: &str, repository: &str, tag: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(format!("{}:{}", repository, tag))
    }

    /// Path of the alias for a resolved reference.
    pub fn alias_path_for(&self, reference: &ImageReference) -> PathBuf {
        self.root.join(reference.alias_relative_path())
    }

    /// Points `namespace/repository:tag` at `directory`.
    pub fn publish(
        &self,
        tx: &mut Transaction<'_>,
        directory: &Path,
        namespace: &str,
        repository: &str,
        tag: &str,
    ) -> Result<AliasUpdate> {
        let final_path = self.alias_path(namespace, repository, tag);
        let update_failed = |e: io::Error| Error::TagUpdateFailed {
            path: final_path.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = final_path.parent()
            && !parent.is_dir()
        {
            tx.begin()?;
            fs::create_dir_all(parent).map_err(update_failed)?;
        }

        let mut update = AliasUpdate::Created;

        match fs::symlink_metadata(&final_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(&final_path).map_err(update_failed)?;
                if current == directory {
                    info!("{} is already up to date", final_path.display());
                    return Ok(AliasUpdate::UpToDate);
                }

                tx.begin()?;
                fs::remove_file(&final_path).map_err(update_failed)?;
                debug!("Removed stale alias {} -> {}", final_path.display(), current.display());
                update = AliasUpdate::Replaced { previous: current };
            }
            Ok(_) => {
                return Err(Error::TagConflict {
                    path: final_path.clone(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(update_failed(e)),
        }

        tx.begin()?;
        symlink(directory, &final_path).map_err(update_failed)?;
        info!("Linked {} -> {}", final_path.display(), directory.display());

        Ok(update)
    }

    /// Publishes the alias of a resolved reference.
    pub fn publish_reference(
        &self,
        tx: &mut Transaction<'_>,
        directory: &Path,
        reference: &ImageReference,
    ) -> Result<AliasUpdate> {
        self.publish(
            tx,
            directory,
            &reference.namespace,
            &reference.repository,
            &reference.tag,
        )
    }

    /// Returns the target of an alias, if the alias exists.
    pub fn resolve(&self, reference: &ImageReference) -> Option<PathBuf> {
        fs::read_link(self.alias_path_for(reference)).ok()
    }

    /// Enumerates every alias under the root.
    ///
    /// The `.images` tree is not descended into.
    pub fn list_aliases(&self) -> Result<Vec<TagAlias>> {
        let mut aliases = Vec::new();

        if !self.root.is_dir() {
            return Ok(aliases);
        }

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != IMAGES_DIR);

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
            if !entry.path_is_symlink() {
                continue;
            }
            let target = fs::read_link(entry.path())?;
            aliases.push(TagAlias {
                path: entry.into_path(),
                target,
            });
        }

        Ok(aliases)
    }
}
