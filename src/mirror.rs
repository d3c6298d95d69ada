//! # Batch Orchestration
//!
//! [`Mirror`] drives the whole pipeline for a list of reference lines:
//!
//! ```text
//! line ─► resolve ─► [expand wildcard tag] ─► for each image (≤ N attempts):
//!           fetch manifest ─► content hash ─► staged? ──yes──┐
//!                                               │ no         │
//!                                   allocate + pull/export   │
//!                                   + materialize            │
//!                                               └─────► tag alias
//! after all images: summary ─► GC sweep ─► engine prune ─► one commit
//! ```
//!
//! ## Batch Policy
//!
//! Batches are best-effort: a failing image is retried up to
//! [`MirrorConfig::max_attempts`] times, then recorded as failed, and the
//! batch moves on. The batch never stops early. Its exit code is the code of
//! the last failure observed (see [`Error::exit_code`]), or 0.
//!
//! ## Transactions
//!
//! One [`Transaction`] handle spans the batch and is committed once at the
//! end. An image whose staging fails has its half-written directory
//! discarded inside the transaction. Only when that cleanup itself fails is
//! the transaction force-aborted, which also rolls back the batch's
//! earlier work (it is redone on the next run).

use crate::config::MirrorConfig;
use crate::digest::ContentHash;
use crate::engine::{ContainerEngine, EngineCli};
use crate::error::{Error, Result};
use crate::materialize::{MaterializeStats, materialize};
use crate::reference::ImageReference;
use crate::registry::{ManifestSource, RegistryClient, expand_tags};
use crate::storage::{GcStats, StagingStore};
use crate::tags::{AliasUpdate, TagAliasManager};
use crate::transaction::{CvmfsServer, Transaction, TransactionCoordinator, TransactionalStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of publishing one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Content hash of the image.
    pub hash: ContentHash,
    /// Staging directory the alias points at.
    pub directory: PathBuf,
    /// Extraction counters, `None` when the content was already staged.
    pub staged: Option<MaterializeStats>,
    /// What happened to the tag alias.
    pub alias: AliasUpdate,
}

/// An image that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedImage {
    /// Full image reference.
    pub reference: String,
    /// Exit code of the last attempt's error.
    pub code: i32,
    /// Last attempt's error message.
    pub reason: String,
}

/// Tally of one batch run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Concrete images attempted, after wildcard expansion.
    pub requested: Vec<String>,
    /// Images whose alias is in place.
    pub succeeded: Vec<String>,
    /// Images that failed every attempt.
    pub failed: Vec<FailedImage>,
    /// Input lines dropped because their tags could not be expanded.
    pub skipped: Vec<String>,
    /// Sweep statistics, `None` if the sweep failed.
    pub gc: Option<GcStats>,
    /// Batch start time.
    pub started_at: DateTime<Utc>,
    /// Batch end time.
    pub finished_at: DateTime<Utc>,
    /// Last nonzero code observed, or 0.
    pub exit_code: i32,
}

impl BatchReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            requested: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            gc: None,
            started_at: now,
            finished_at: now,
            exit_code: 0,
        }
    }

    fn record_failure(&mut self, reference: String, err: &Error) {
        self.exit_code = err.exit_code();
        self.failed.push(FailedImage {
            reference,
            code: err.exit_code(),
            reason: err.to_string(),
        });
    }

    /// Returns true if every requested image was published and committed.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Prints the summary and the failed images to standard output.
    pub fn print_summary(&self) {
        println!(
            "Published {} of {} images ({} failed, {} entries skipped)",
            self.succeeded.len(),
            self.requested.len(),
            self.failed.len(),
            self.skipped.len()
        );
        if !self.failed.is_empty() {
            println!("Failed images:");
            for failed in &self.failed {
                println!("  {}", failed.reference);
            }
        }
    }
}

/// Content-addressed image mirror on a managed root.
pub struct Mirror {
    config: MirrorConfig,
    registry: Arc<dyn ManifestSource>,
    engine: Arc<dyn ContainerEngine>,
    coordinator: TransactionCoordinator,
    staging: StagingStore,
    tags: TagAliasManager,
}

impl Mirror {
    /// Creates a mirror from its collaborators.
    pub fn new(
        config: MirrorConfig,
        registry: Arc<dyn ManifestSource>,
        engine: Arc<dyn ContainerEngine>,
        store: Box<dyn TransactionalStore>,
    ) -> Self {
        let coordinator = TransactionCoordinator::from_config(&config, store);
        let staging = StagingStore::new(&config.root);
        let tags = TagAliasManager::new(&config.root);
        Self {
            config,
            registry,
            engine,
            coordinator,
            staging,
            tags,
        }
    }

    /// Creates a mirror talking to real registries, the configured engine
    /// CLI and `cvmfs_server`.
    pub fn with_defaults(config: MirrorConfig) -> Self {
        let engine = EngineCli::with_program(config.engine.clone());
        Self::new(
            config,
            Arc::new(RegistryClient::new()),
            Arc::new(engine),
            Box::new(CvmfsServer::new()),
        )
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Returns the staging store.
    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    /// Returns the tag alias manager.
    pub fn tags(&self) -> &TagAliasManager {
        &self.tags
    }

    /// Returns the transaction coordinator.
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Resolves one input line into concrete images.
    ///
    /// Wildcard tags are matched against the registry's tag list, keeping
    /// its order.
    pub async fn expand(&self, entry: &str) -> Result<Vec<ImageReference>> {
        let reference = ImageReference::resolve_with_registry(entry, &self.config.default_registry);
        if !reference.has_wildcard_tag() {
            return Ok(vec![reference]);
        }

        let listed = self.registry.list_tags(&reference).await?;
        let matched = expand_tags(&reference.tag, &listed)?;
        info!(
            "{} matched {} of {} tags",
            entry,
            matched.len(),
            listed.len()
        );
        Ok(matched.into_iter().map(|tag| reference.with_tag(tag)).collect())
    }

    /// Makes `reference`'s tag alias point at its staged content.
    ///
    /// Content already staged under the same hash is reused without
    /// touching the container engine.
    pub async fn publish(
        &self,
        tx: &mut Transaction<'_>,
        reference: &ImageReference,
    ) -> Result<PublishResult> {
        let manifest = self.registry.fetch_manifest(reference).await?;
        let hash = manifest.content_hash();
        debug!("{} has content hash {}", reference, hash);

        let (directory, already_staged) = self.staging.ensure_allocated(tx, &hash)?;

        let staged = if already_staged {
            None
        } else {
            match self.stage(reference, &directory).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    error!("Staging {} failed: {}", reference, e);
                    self.discard_partial(tx, &hash);
                    return Err(e);
                }
            }
        };

        let alias = self.tags.publish_reference(tx, &directory, reference)?;

        Ok(PublishResult {
            hash,
            directory,
            staged,
            alias,
        })
    }

    /// Publishes with up to `max_attempts` tries, returning the last error.
    pub async fn publish_with_retry(
        &self,
        tx: &mut Transaction<'_>,
        reference: &ImageReference,
    ) -> Result<PublishResult> {
        let attempts = self.config.max_attempts;
        let mut attempt = 1;

        loop {
            match self.publish(tx, reference).await {
                Ok(result) => {
                    info!("Published {} ({:?})", reference, result.alias);
                    return Ok(result);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Attempt {}/{} for {} failed: {}",
                        attempt, attempts, reference, e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        reference, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Publishes every entry, then sweeps, prunes and commits once.
    pub async fn run_batch<I, S>(&self, entries: I) -> Result<BatchReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tx = self.coordinator.open(self.staging.root())?;
        let mut report = BatchReport::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            let references = match self.expand_with_retry(entry).await {
                Ok(references) => references,
                Err(e) => {
                    warn!("Skipping {}: {}", entry, e);
                    report.skipped.push(entry.to_string());
                    continue;
                }
            };

            for reference in references {
                let name = reference.to_string();
                report.requested.push(name.clone());

                match self.publish_with_retry(&mut tx, &reference).await {
                    Ok(_) => report.succeeded.push(name),
                    Err(e) => report.record_failure(name, &e),
                }
            }
        }

        report.print_summary();

        match self.sweep(&mut tx) {
            Ok(stats) => report.gc = Some(stats),
            Err(e) => error!("Garbage collection failed: {}", e),
        }
        if let Err(e) = self.engine.prune().await {
            warn!("Engine prune failed: {}", e);
        }

        if let Err(e) = tx.commit() {
            report.exit_code = e.exit_code();
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Runs a batch of one entry.
    pub async fn run_single(&self, entry: &str) -> Result<BatchReport> {
        self.run_batch([entry]).await
    }

    /// Removes staged content no tag alias points at.
    ///
    /// Every alias under the root counts, which always includes the aliases
    /// of the images just processed.
    pub fn sweep(&self, tx: &mut Transaction<'_>) -> Result<GcStats> {
        let referenced: HashSet<ContentHash> = self
            .tags
            .list_aliases()?
            .iter()
            .filter_map(|alias| self.staging.hash_of(&alias.target))
            .collect();

        self.staging.gc(tx, &referenced)
    }

    /// Sweeps, prunes the engine and commits, without publishing anything.
    pub async fn collect_garbage(&self) -> Result<GcStats> {
        let mut tx = self.coordinator.open(self.staging.root())?;
        let stats = self.sweep(&mut tx)?;
        if let Err(e) = self.engine.prune().await {
            warn!("Engine prune failed: {}", e);
        }
        tx.commit()?;
        Ok(stats)
    }

    async fn expand_with_retry(&self, entry: &str) -> Result<Vec<ImageReference>> {
        let attempts = self.config.max_attempts;
        let mut attempt = 1;

        loop {
            match self.expand(entry).await {
                Ok(references) => return Ok(references),
                Err(e @ Error::InvalidTagPattern { .. }) => return Err(e),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Tag listing {}/{} for {} failed: {}",
                        attempt, attempts, entry, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pulls, exports and extracts `reference` into `directory`.
    ///
    /// The ephemeral container and the pulled image are removed afterwards
    /// whatever the outcome.
    async fn stage(&self, reference: &ImageReference, directory: &Path) -> Result<MaterializeStats> {
        let image = reference.pull_reference();
        info!("Staging {} into {}", image, directory.display());

        self.engine.pull(&image).await?;

        let container = match self.engine.create(&image).await {
            Ok(container) => container,
            Err(e) => {
                self.remove_image(&image).await;
                return Err(e);
            }
        };

        let result = self.export_into(&container, directory).await;

        if let Err(e) = self.engine.remove_container(&container).await {
            warn!("Could not remove container {}: {}", container, e);
        }
        self.remove_image(&image).await;

        result
    }

    async fn export_into(&self, container: &str, directory: &Path) -> Result<MaterializeStats> {
        fs::create_dir_all(&self.config.scratch_dir)?;
        let mut stream = tempfile::tempfile_in(&self.config.scratch_dir)?;

        self.engine.export(container, stream.try_clone()?).await?;
        stream.seek(SeekFrom::Start(0))?;

        materialize(directory, BufReader::new(stream))
    }

    async fn remove_image(&self, image: &str) {
        if let Err(e) = self.engine.remove_image(image).await {
            warn!("Could not remove image {}: {}", image, e);
        }
    }

    fn discard_partial(&self, tx: &mut Transaction<'_>, hash: &ContentHash) {
        if let Err(e) = self.staging.discard(tx, hash) {
            error!("Could not discard partial image {}: {}", hash, e);
            if let Err(e) = tx.abort() {
                error!("Forced abort failed: {}", e);
            }
        }
    }
}
