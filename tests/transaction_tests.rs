//! Tests for transaction coordination.
//!
//! Validates lazy begin, single-flight handles, explicit commit and
//! recovery from a stale lock artifact.

use magikmirror::{Error, MemoryStore, StoreCall, TransactionCoordinator};
use std::fs;
use tempfile::TempDir;

const REPO: &str = "test.repo";

fn setup() -> (TempDir, MemoryStore, TransactionCoordinator) {
    let temp = TempDir::new().unwrap();
    let prefix = temp.path().join("cvmfs");
    let lock = temp.path().join("in_transaction.lock");
    fs::create_dir_all(prefix.join(REPO)).unwrap();

    let store = MemoryStore::new().with_lock_file(&lock);
    let coordinator = TransactionCoordinator::new(Box::new(store.clone()), REPO, &prefix, &lock);
    (temp, store, coordinator)
}

// =============================================================================
// Begin Tests
// =============================================================================

#[test]
fn test_open_does_not_begin() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);

    let tx = coordinator.open(&root).unwrap();
    assert!(!tx.is_active());
    tx.commit().unwrap();

    assert!(store.calls().is_empty(), "idle handle should not touch the store");
}

#[test]
fn test_outside_managed_prefix_is_noop() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("elsewhere");

    assert!(!coordinator.manages(&root));
    let mut tx = coordinator.open(&root).unwrap();
    tx.begin().unwrap();

    assert!(!tx.is_active());
    assert_eq!(store.begin_count(), 0);
}

#[test]
fn test_begin_creates_library_skeleton() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);

    let mut tx = coordinator.open(&root).unwrap();
    tx.begin().unwrap();

    assert!(tx.is_active());
    assert!(root.join("library").is_dir());
    assert!(store.is_open());
    tx.commit().unwrap();
}

#[test]
fn test_stale_lock_is_force_aborted_before_begin() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);
    fs::write(temp.path().join("in_transaction.lock"), REPO).unwrap();

    let mut tx = coordinator.open(&root).unwrap();
    tx.begin().unwrap();

    assert_eq!(
        store.calls(),
        vec![
            StoreCall::Abort {
                repository: REPO.to_string(),
                force: true
            },
            StoreCall::Begin(REPO.to_string()),
        ]
    );
    tx.commit().unwrap();
    assert!(!temp.path().join("in_transaction.lock").exists());
}

#[test]
fn test_begin_failure_leaves_handle_idle() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);
    store.fail_begin(true);

    let mut tx = coordinator.open(&root).unwrap();
    let err = tx.begin().unwrap_err();

    assert!(matches!(err, Error::TransactionBeginFailed { .. }));
    assert_eq!(err.exit_code(), 5);
    assert!(!tx.is_active());
    drop(tx);
    assert_eq!(store.abort_count(), 0, "nothing to abort after failed begin");
}

// =============================================================================
// Commit and Abort Tests
// =============================================================================

#[test]
fn test_commit_failure_releases_handle() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);
    store.fail_commit(true);

    let mut tx = coordinator.open(&root).unwrap();
    tx.begin().unwrap();
    assert!(matches!(
        tx.commit(),
        Err(Error::TransactionCommitFailed { .. })
    ));

    assert_eq!(store.abort_count(), 0, "failed commit is not aborted");
    assert!(coordinator.open(&root).is_ok(), "handle should be released");
}

#[test]
fn test_abort_leaves_handle_reusable() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);

    let mut tx = coordinator.open(&root).unwrap();
    tx.begin().unwrap();
    tx.abort().unwrap();
    assert!(!tx.is_active());

    tx.begin().unwrap();
    tx.commit().unwrap();

    assert_eq!(store.begin_count(), 2);
    assert_eq!(store.abort_count(), 1);
    assert_eq!(store.commit_count(), 1);
}

#[test]
fn test_abort_when_idle_is_noop() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);

    let mut tx = coordinator.open(&root).unwrap();
    tx.abort().unwrap();

    assert!(store.calls().is_empty());
}

// =============================================================================
// Single-Flight Tests
// =============================================================================

#[test]
fn test_only_one_handle_at_a_time() {
    let (temp, _store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);

    let tx = coordinator.open(&root).unwrap();
    let second = coordinator.open(&root);
    assert!(matches!(second, Err(Error::TransactionInProgress(_))));

    tx.commit().unwrap();
    assert!(coordinator.open(&root).is_ok());
}

#[test]
fn test_dropped_active_handle_removes_lock() {
    let (temp, store, coordinator) = setup();
    let root = temp.path().join("cvmfs").join(REPO);
    let lock = temp.path().join("in_transaction.lock");

    {
        let mut tx = coordinator.open(&root).unwrap();
        tx.begin().unwrap();
        assert!(lock.exists());
    }

    assert!(!lock.exists());
    assert_eq!(
        store.calls().last(),
        Some(&StoreCall::Abort {
            repository: REPO.to_string(),
            force: true
        })
    );
}
