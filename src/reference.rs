//! Image reference resolution.
//!
//! Turns a reference line such as `openjdk:8` or
//! `containers.example.org/org/app/sub:stretch` into its registry, namespace,
//! repository and tag. Resolution never fails: malformed input is filled in
//! with defaults.
//!
//! ## Known Ambiguity
//!
//! A registry host with an embedded port (`host:5000/name:tag`) is not
//! recognised as a registry: with two segments the host becomes the
//! namespace, and a port in a three-or-more segment repository part can
//! produce more than one colon, in which case no tag is split off.

use crate::constants::{DEFAULT_NAMESPACE, DEFAULT_REGISTRY, DEFAULT_TAG, TAG_WILDCARD_CHARS};
use std::fmt;
use std::path::PathBuf;

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g. "docker.io").
    pub registry: String,
    /// Namespace (e.g. "library").
    pub namespace: String,
    /// Repository, possibly containing `/` (e.g. "app/sub").
    pub repository: String,
    /// Tag or tag pattern (e.g. "8", "v1.*").
    pub tag: String,
}

impl ImageReference {
    /// Resolves a reference string, filling in defaults.
    ///
    /// - `name` → default registry, `library/name:latest`
    /// - `ns/name:tag` → default registry, `ns/name:tag`
    /// - `host/ns/a/b:tag` → `host`, `ns`, `a/b`, `tag`
    pub fn resolve(text: &str) -> Self {
        Self::resolve_with_registry(text, DEFAULT_REGISTRY)
    }

    /// Resolves a reference string, using `default_registry` when the
    /// reference names no registry.
    pub fn resolve_with_registry(text: &str, default_registry: &str) -> Self {
        let text = text.trim();
        let segments: Vec<&str> = text.split('/').collect();

        let (registry, namespace, remainder) = match segments.as_slice() {
            [single] => (default_registry, DEFAULT_NAMESPACE, single.to_string()),
            [namespace, name] => (default_registry, *namespace, name.to_string()),
            [registry, namespace, rest @ ..] => (*registry, *namespace, rest.join("/")),
            // split() always yields at least one segment
            [] => (default_registry, DEFAULT_NAMESPACE, String::new()),
        };

        let (repository, tag) = match remainder.matches(':').count() {
            1 => {
                let (repository, tag) = remainder.split_once(':').unwrap_or((remainder.as_str(), ""));
                (repository.to_string(), tag.to_string())
            }
            _ => (remainder.clone(), DEFAULT_TAG.to_string()),
        };

        Self {
            registry: registry.to_string(),
            namespace: namespace.to_string(),
            repository,
            tag,
        }
    }

    /// Returns a copy of this reference pointing at another tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..self.clone()
        }
    }

    /// Returns true if the tag is a glob pattern rather than a concrete tag.
    pub fn has_wildcard_tag(&self) -> bool {
        self.tag.contains(TAG_WILDCARD_CHARS)
    }

    /// `namespace/repository`, the path a registry serves this image under.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    /// Full reference passed to the container engine.
    pub fn pull_reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository_path(), self.tag)
    }

    /// Path of the tag alias relative to the managed root.
    pub fn alias_relative_path(&self) -> PathBuf {
        PathBuf::from(&self.namespace).join(format!("{}:{}", self.repository, self.tag))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pull_reference())
    }
}
