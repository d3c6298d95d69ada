//! # magikmirror
//!
//! **Content-Addressed Container Image Mirror on a Transactional Filesystem**
//!
//! This crate keeps a deduplicated, unpacked copy of container image
//! filesystems on a read-only distributed filesystem (CernVM-FS style) and
//! publishes human-readable tag paths that point at them. Every change to the
//! managed root happens inside one publish transaction, so readers see a
//! batch either completely or not at all.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          magikmirror                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Mirror (batch)                         │    │
//! │  │   expand wildcards → publish ×N attempts → GC → commit      │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │        │                 │                  │                       │
//! │  ┌─────┴──────┐   ┌──────┴───────┐   ┌──────┴────────┐              │
//! │  │ Reference  │   │ StagingStore │   │TagAliasManager│              │
//! │  │ + Content  │   │ .images/ab/… │   │ ns/repo:tag → │              │
//! │  │   Hash     │   │ Materializer │   │   .images/…   │              │
//! │  └────────────┘   └──────┬───────┘   └──────┬────────┘              │
//! │                          └──────────┬───────┘                       │
//! │                     ┌───────────────┴──────────────┐                │
//! │                     │   TransactionCoordinator     │                │
//! │                     │  begin │ abort -f │ publish  │                │
//! │                     └──────────────────────────────┘                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Collaborators                                │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌────────────────────┐    │
//! │  │ ManifestSource │  │ ContainerEngine │  │ TransactionalStore │    │
//! │  │ RegistryClient │  │   EngineCli     │  │ CvmfsServer        │    │
//! │  │                │  │ (docker/podman) │  │ MemoryStore (fake) │    │
//! │  └────────────────┘  └─────────────────┘  └────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **At most one copy per content**: images are keyed by a SHA-256 over
//!   their ordered layer digests ([`digest::ContentHash`]); tags and
//!   namespaces do not participate.
//! - **Atomic visibility**: allocation, extraction, alias updates and
//!   garbage collection all run inside one [`transaction::Transaction`],
//!   committed once per batch.
//! - **Idempotent re-runs**: staged content is detected by directory
//!   presence, and an alias already pointing at the right directory is left
//!   alone.
//! - **Self-healing**: a lock artifact from a crashed run is force-aborted
//!   before the next transaction begins.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikmirror::{Mirror, MirrorConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> magikmirror::Result<()> {
//!     let mirror = Mirror::with_defaults(MirrorConfig::for_repository("images.example.org"));
//!     let report = mirror.run_batch(["openjdk:8", "org/app:v1.*"]).await?;
//!     std::process::exit(report.exit_code);
//! }
//! ```

pub mod config;
pub mod constants;
pub mod digest;
pub mod engine;
pub mod error;
pub mod materialize;
pub mod mirror;
pub mod reference;
pub mod registry;
pub mod storage;
pub mod tags;
pub mod transaction;

// Re-exports
pub use config::MirrorConfig;
pub use constants::*;
pub use digest::{ContentHash, LayerDescriptor, Manifest, content_hash};
pub use engine::{ContainerEngine, EngineCli};
pub use error::{Error, Result};
pub use materialize::{MaterializeStats, materialize};
pub use mirror::{BatchReport, FailedImage, Mirror, PublishResult};
pub use reference::ImageReference;
pub use registry::{ManifestSource, RegistryClient, expand_tags};
pub use storage::{GcStats, StagingStore};
pub use tags::{AliasUpdate, TagAlias, TagAliasManager};
pub use transaction::{
    CvmfsServer, MemoryStore, StoreCall, Transaction, TransactionCoordinator, TransactionalStore,
};
