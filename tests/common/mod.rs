//! Shared fakes and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use magikmirror::{
    ContainerEngine, Error, ImageReference, Manifest, ManifestSource, MemoryStore, Mirror,
    MirrorConfig, Result,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

// =============================================================================
// Tar Streams
// =============================================================================

/// One entry of a synthesized export stream.
pub enum TarEntry<'a> {
    Dir(&'a str, u32),
    File(&'a str, u32, &'a [u8]),
    Symlink(&'a str, &'a str),
    Special(&'a str, EntryType),
}

/// Builds an uncompressed tar stream like `docker export` produces.
pub fn tar_stream(entries: &[TarEntry<'_>]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());

    for entry in entries {
        let mut header = Header::new_gnu();
        match entry {
            TarEntry::Dir(path, mode) => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                builder.append_data(&mut header, path, &[][..]).unwrap();
            }
            TarEntry::File(path, mode, data) => {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, *data).unwrap();
            }
            TarEntry::Symlink(path, target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target).unwrap();
            }
            TarEntry::Special(path, kind) => {
                header.set_entry_type(*kind);
                header.set_mode(0o666);
                header.set_size(0);
                builder.append_data(&mut header, path, &[][..]).unwrap();
            }
        }
    }

    builder.into_inner().unwrap()
}

/// A tar stream with a single entry whose name escapes the target.
pub fn traversal_stream() -> Vec<u8> {
    let mut header = Header::new_old();
    let name = b"../escaped";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(4);
    header.set_cksum();

    let mut builder = Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..]).unwrap();
    builder.into_inner().unwrap()
}

/// A small but complete image filesystem.
pub fn sample_rootfs(marker: &str) -> Vec<u8> {
    tar_stream(&[
        TarEntry::Dir("etc", 0o755),
        TarEntry::File("etc/marker", 0o644, marker.as_bytes()),
        TarEntry::Dir("bin", 0o755),
        TarEntry::File("bin/tool", 0o755, b"#!/bin/sh\n"),
    ])
}

// =============================================================================
// Registry Fake
// =============================================================================

/// In-memory [`ManifestSource`].
#[derive(Default)]
pub struct FakeRegistry {
    manifests: Mutex<HashMap<String, Vec<String>>>,
    tags: Mutex<HashMap<String, Vec<String>>>,
    pending_failures: Mutex<HashMap<String, u32>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `digests` as the layers of `reference`.
    pub fn set_image(&self, reference: &str, digests: &[&str]) {
        let key = ImageReference::resolve(reference).pull_reference();
        let digests = digests.iter().map(|d| d.to_string()).collect();
        self.manifests.lock().unwrap().insert(key, digests);
    }

    /// Serves `tags` for the repository of `reference`.
    pub fn set_tags(&self, reference: &str, tags: &[&str]) {
        let key = ImageReference::resolve(reference).repository_path();
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.tags.lock().unwrap().insert(key, tags);
    }

    /// Fails the next `times` manifest fetches of `reference`.
    pub fn fail_manifest(&self, reference: &str, times: u32) {
        let key = ImageReference::resolve(reference).pull_reference();
        self.pending_failures.lock().unwrap().insert(key, times);
    }

    /// Number of manifest fetches of `reference` so far.
    pub fn fetch_count(&self, reference: &str) -> usize {
        let key = ImageReference::resolve(reference).pull_reference();
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|f| **f == key)
            .count()
    }
}

#[async_trait]
impl ManifestSource for FakeRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest> {
        let key = reference.pull_reference();
        self.fetches.lock().unwrap().push(key.clone());

        if let Some(remaining) = self.pending_failures.lock().unwrap().get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::ManifestFetchFailed {
                reference: key,
                reason: "registry unavailable".to_string(),
            });
        }

        match self.manifests.lock().unwrap().get(&key) {
            Some(digests) => Ok(Manifest::from_digests(digests.clone())),
            None => Err(Error::ManifestFetchFailed {
                reference: key,
                reason: "manifest unknown".to_string(),
            }),
        }
    }

    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let key = reference.repository_path();
        self.tags
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::TagListFailed {
                repository: key,
                reason: "repository unknown".to_string(),
            })
    }
}

// =============================================================================
// Engine Fake
// =============================================================================

/// In-memory [`ContainerEngine`] serving canned export streams.
#[derive(Default)]
pub struct FakeEngine {
    exports: Mutex<HashMap<String, Vec<u8>>>,
    containers: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `stream` as the exported filesystem of `reference`.
    pub fn set_export(&self, reference: &str, stream: Vec<u8>) {
        let key = ImageReference::resolve(reference).pull_reference();
        self.exports.lock().unwrap().insert(key, stream);
    }

    /// Calls received so far, as `"<op> <arg>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of one operation.
    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, arg: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", op, arg));
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull(&self, image: &str) -> Result<()> {
        self.record("pull", image);
        Ok(())
    }

    async fn create(&self, image: &str) -> Result<String> {
        self.record("create", image);
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), image.to_string());
        Ok(id)
    }

    async fn export(&self, container: &str, mut sink: File) -> Result<()> {
        self.record("export", container);
        let image = self
            .containers
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .unwrap_or_default();

        let stream = self.exports.lock().unwrap().get(&image).cloned();
        match stream {
            Some(stream) => {
                sink.write_all(&stream)?;
                Ok(())
            }
            None => Err(Error::EngineFailed {
                operation: "export".to_string(),
                reason: format!("no filesystem for {}", image),
            }),
        }
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.record("rm", container);
        self.containers.lock().unwrap().remove(container);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.record("rmi", image);
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        self.record("prune", "");
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// A managed root inside a temporary "transactional filesystem".
pub struct Fixture {
    pub temp: TempDir,
    pub config: MirrorConfig,
    pub store: MemoryStore,
    pub registry: Arc<FakeRegistry>,
    pub engine: Arc<FakeEngine>,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let prefix = temp.path().join("cvmfs");
        let spool = temp.path().join("spool");

        let mut config = MirrorConfig::for_repository("test.repo");
        config.managed_prefix = prefix.clone();
        config.root = prefix.join("test.repo");
        config.lock_path = spool.join("in_transaction.lock");
        config.scratch_dir = temp.path().join("scratch");

        fs::create_dir_all(&config.root).unwrap();
        fs::create_dir_all(&spool).unwrap();

        let store = MemoryStore::new().with_lock_file(&config.lock_path);

        Self {
            temp,
            config,
            store,
            registry: Arc::new(FakeRegistry::new()),
            engine: Arc::new(FakeEngine::new()),
        }
    }

    /// Builds a mirror over the fixture's fakes.
    pub fn mirror(&self) -> Mirror {
        Mirror::new(
            self.config.clone(),
            self.registry.clone(),
            self.engine.clone(),
            Box::new(self.store.clone()),
        )
    }

    /// Registers an image with both the registry and the engine.
    pub fn add_image(&self, reference: &str, digests: &[&str], stream: Vec<u8>) {
        self.registry.set_image(reference, digests);
        self.engine.set_export(reference, stream);
    }

    pub fn root(&self) -> PathBuf {
        self.config.root.clone()
    }
}
