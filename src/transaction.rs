//! # Transaction Coordination
//!
//! Every mutation of the managed root happens inside a publish transaction
//! of the underlying distributed filesystem. Changes made while the
//! transaction is open become visible to readers together, at commit.
//!
//! ## Lifecycle
//!
//! ```text
//!            open(root)                begin()                 commit()
//!   (none) ───────────► Transaction ──────────► Transaction ───────────► (none)
//!                        idle                     active
//!                          ▲                        │
//!                          └──────── abort() ───────┘
//!                                     drop()  ──► force abort
//! ```
//!
//! [`TransactionCoordinator::open`] hands out at most one [`Transaction`]
//! per coordinator at a time. The handle is threaded through every mutating
//! call. `begin` is lazy and idempotent, so a run that finds everything up
//! to date never opens a transaction at all. A handle dropped while active
//! force-aborts; the only way to publish is an explicit [`Transaction::commit`].
//!
//! ## Crash Recovery
//!
//! A lock artifact left behind by a run that died mid-transaction is
//! detected on `begin` and force-aborted before a new transaction starts.
//!
//! ## Backends
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`CvmfsServer`] | `cvmfs_server transaction / abort -f / publish` |
//! | [`MemoryStore`] | in-process fake recording calls |

use crate::config::MirrorConfig;
use crate::constants::{CVMFS_SERVER_BIN, DEFAULT_NAMESPACE};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

// =============================================================================
// Store Capability
// =============================================================================

/// Begin/abort/commit control plane of a transactional filesystem.
pub trait TransactionalStore: Send + Sync {
    /// Opens a transaction on the named repository.
    fn begin(&self, repository: &str) -> Result<()>;

    /// Discards the open transaction. `force` skips interactive confirmation.
    fn abort(&self, repository: &str, force: bool) -> Result<()>;

    /// Publishes the open transaction.
    fn commit(&self, repository: &str) -> Result<()>;
}

/// [`TransactionalStore`] driving the `cvmfs_server` command.
#[derive(Debug, Clone)]
pub struct CvmfsServer {
    program: PathBuf,
}

impl CvmfsServer {
    /// Uses `cvmfs_server` from `PATH`.
    pub fn new() -> Self {
        Self::with_program(CVMFS_SERVER_BIN)
    }

    /// Uses a specific control-plane binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> std::result::Result<(), String> {
        debug!("Running {} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| format!("failed to spawn {}: {}", self.program.display(), e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} ({})", stderr.trim(), output.status))
        }
    }
}

impl Default for CvmfsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionalStore for CvmfsServer {
    fn begin(&self, repository: &str) -> Result<()> {
        self.run(&["transaction", repository])
            .map_err(|reason| Error::TransactionBeginFailed {
                repository: repository.to_string(),
                reason,
            })
    }

    fn abort(&self, repository: &str, force: bool) -> Result<()> {
        let args: &[&str] = if force {
            &["abort", "-f", repository]
        } else {
            &["abort", repository]
        };
        self.run(args).map_err(|reason| Error::TransactionAbortFailed {
            repository: repository.to_string(),
            reason,
        })
    }

    fn commit(&self, repository: &str) -> Result<()> {
        self.run(&["publish", repository])
            .map_err(|reason| Error::TransactionCommitFailed {
                repository: repository.to_string(),
                reason,
            })
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// A call received by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Begin(String),
    Abort { repository: String, force: bool },
    Commit(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    calls: Vec<StoreCall>,
    open: bool,
    lock_file: Option<PathBuf>,
    fail_begin: bool,
    fail_commit: bool,
}

/// In-process [`TransactionalStore`].
///
/// Clones share state, so a test can keep one clone for inspection after
/// handing another to a coordinator. Like the real filesystem it rejects a
/// second `begin` while a transaction is open, and a failed commit leaves
/// the transaction (and its lock artifact) in place.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an idle store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maintains a lock artifact at `path` while a transaction is open.
    pub fn with_lock_file(self, path: impl Into<PathBuf>) -> Self {
        self.lock().lock_file = Some(path.into());
        self
    }

    /// Makes every subsequent `begin` fail.
    pub fn fail_begin(&self, fail: bool) {
        self.lock().fail_begin = fail;
    }

    /// Makes every subsequent `commit` fail.
    pub fn fail_commit(&self, fail: bool) {
        self.lock().fail_commit = fail;
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Number of `begin` calls received.
    pub fn begin_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::Begin(_)))
    }

    /// Number of `commit` calls received.
    pub fn commit_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::Commit(_)))
    }

    /// Number of `abort` calls received.
    pub fn abort_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::Abort { .. }))
    }

    /// Returns true while a transaction is open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge every other assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TransactionalStore for MemoryStore {
    fn begin(&self, repository: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Begin(repository.to_string()));

        if state.fail_begin || state.open {
            return Err(Error::TransactionBeginFailed {
                repository: repository.to_string(),
                reason: "repository is not accepting a transaction".to_string(),
            });
        }

        if let Some(lock) = &state.lock_file {
            fs::write(lock, repository)?;
        }
        state.open = true;
        Ok(())
    }

    fn abort(&self, repository: &str, force: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Abort {
            repository: repository.to_string(),
            force,
        });

        if let Some(lock) = &state.lock_file
            && lock.exists()
        {
            fs::remove_file(lock)?;
        }
        state.open = false;
        Ok(())
    }

    fn commit(&self, repository: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Commit(repository.to_string()));

        if state.fail_commit || !state.open {
            return Err(Error::TransactionCommitFailed {
                repository: repository.to_string(),
                reason: "no publishable transaction".to_string(),
            });
        }

        if let Some(lock) = &state.lock_file
            && lock.exists()
        {
            fs::remove_file(lock)?;
        }
        state.open = false;
        Ok(())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Single-flight owner of the transactional store for one repository.
pub struct TransactionCoordinator {
    store: Box<dyn TransactionalStore>,
    repository: String,
    managed_prefix: PathBuf,
    lock_path: PathBuf,
    held: AtomicBool,
}

impl TransactionCoordinator {
    /// Creates a coordinator.
    ///
    /// Roots below `managed_prefix` are transactional; `lock_path` is the
    /// artifact an open transaction leaves on disk.
    pub fn new(
        store: Box<dyn TransactionalStore>,
        repository: impl Into<String>,
        managed_prefix: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            repository: repository.into(),
            managed_prefix: managed_prefix.into(),
            lock_path: lock_path.into(),
            held: AtomicBool::new(false),
        }
    }

    /// Creates a coordinator from the mirror configuration.
    pub fn from_config(config: &MirrorConfig, store: Box<dyn TransactionalStore>) -> Self {
        Self::new(
            store,
            config.repository.clone(),
            config.managed_prefix.clone(),
            config.lock_path.clone(),
        )
    }

    /// Repository name passed to the store.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Returns true if mutations under `root` need a transaction.
    pub fn manages(&self, root: &Path) -> bool {
        root.starts_with(&self.managed_prefix)
    }

    /// Hands out the transaction handle for `root`.
    ///
    /// Fails with [`Error::TransactionInProgress`] while another handle from
    /// this coordinator is alive.
    pub fn open(&self, root: &Path) -> Result<Transaction<'_>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::TransactionInProgress(self.repository.clone()));
        }

        Ok(Transaction {
            coordinator: self,
            root: root.to_path_buf(),
            active: false,
        })
    }

    fn recover_stale_lock(&self) {
        if !self.lock_path.exists() {
            return;
        }

        warn!(
            "Found stale transaction lock {}, aborting leftover transaction on {}",
            self.lock_path.display(),
            self.repository
        );
        if let Err(e) = self.store.abort(&self.repository, true) {
            warn!("Forced abort of stale transaction failed: {}", e);
        }
    }
}

/// Handle to the (possibly not yet begun) transaction on a managed root.
pub struct Transaction<'a> {
    coordinator: &'a TransactionCoordinator,
    root: PathBuf,
    active: bool,
}

impl Transaction<'_> {
    /// Root this transaction covers.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true while a commit is owed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ensures a transaction is open before a mutation.
    ///
    /// No-op when already active or when the root lies outside the managed
    /// prefix. On failure the handle stays idle.
    pub fn begin(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }

        let coordinator = self.coordinator;
        if !coordinator.manages(&self.root) {
            debug!(
                "{} is outside {}, no transaction needed",
                self.root.display(),
                coordinator.managed_prefix.display()
            );
            return Ok(());
        }

        coordinator.recover_stale_lock();

        if let Err(e) = coordinator.store.begin(&coordinator.repository) {
            error!("Could not open transaction: {}", e);
            return Err(e);
        }
        self.active = true;
        info!("Opened transaction on {}", coordinator.repository);

        let skeleton = self.root.join(DEFAULT_NAMESPACE);
        if let Err(e) = fs::create_dir_all(&skeleton) {
            warn!("Could not create {}: {}", skeleton.display(), e);
        }

        Ok(())
    }

    /// Publishes everything done in this transaction.
    ///
    /// No-op when idle. The handle is released regardless of the outcome.
    pub fn commit(mut self) -> Result<()> {
        if !self.active {
            debug!("Nothing to publish on {}", self.coordinator.repository);
            return Ok(());
        }

        self.active = false;
        let coordinator = self.coordinator;
        match coordinator.store.commit(&coordinator.repository) {
            Ok(()) => {
                info!("Published transaction on {}", coordinator.repository);
                Ok(())
            }
            Err(e) => {
                error!("Publishing transaction failed: {}", e);
                Err(e)
            }
        }
    }

    /// Force-aborts the open transaction, leaving the handle idle and reusable.
    pub fn abort(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        self.active = false;
        let coordinator = self.coordinator;
        warn!("Aborting transaction on {}", coordinator.repository);
        coordinator.store.abort(&coordinator.repository, true)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.active {
            warn!(
                "Transaction on {} released without commit, aborting",
                self.coordinator.repository
            );
            if let Err(e) = self.abort() {
                error!("Abort on release failed: {}", e);
            }
        }
        self.coordinator.held.store(false, Ordering::Release);
    }
}
