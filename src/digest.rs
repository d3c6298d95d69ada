//! # Content Hashing
//!
//! Derives the deduplication key of an image from its manifest. The key is
//! a SHA-256 over the layer digests in registry order, with algorithm
//! prefixes stripped:
//!
//! ```text
//! sha256("e3b0..." ++ "9f86..." ++ ...)  →  ContentHash
//! ```
//!
//! Only the ordered layer digests participate. Registry, namespace and tag
//! do not, so the same content published under many tags is staged once.
//! Reordering layers yields a different hash.

use crate::constants::SHARD_PREFIX_LEN;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// Metadata about a single image layer as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Layer digest, usually `sha256:<hex>`.
    pub digest: String,
}

impl LayerDescriptor {
    /// Creates a descriptor from a digest string.
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
        }
    }

    /// Digest without its `algorithm:` prefix.
    pub fn bare_digest(&self) -> &str {
        self.digest
            .split_once(':')
            .map_or(self.digest.as_str(), |(_, hash)| hash)
    }
}

/// Ordered layer list of an image.
///
/// The order is the one returned by the registry and is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Layers, base first.
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    /// Builds a manifest from digest strings in order.
    pub fn from_digests<I, S>(digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            layers: digests.into_iter().map(LayerDescriptor::new).collect(),
        }
    }

    /// Computes the content hash of this manifest.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        for layer in &self.layers {
            hasher.update(layer.bare_digest().as_bytes());
        }
        ContentHash(hex::encode(hasher.finalize()))
    }
}

/// Hex digest identifying a unique filesystem content set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parses a hash, accepting only lowercase hex long enough to shard.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let valid = hex.len() > SHARD_PREFIX_LEN
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(Error::InvalidContentHash(hex.to_string()));
        }
        Ok(Self(hex.to_string()))
    }

    /// Returns the hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the hash into its fan-out directory and remainder.
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(SHARD_PREFIX_LEN)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the content hash of a manifest.
pub fn content_hash(manifest: &Manifest) -> ContentHash {
    manifest.content_hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_manifest_hashes_empty_input() {
        let hash = Manifest::default().content_hash();
        assert_eq!(
            hash.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_prefix_is_stripped() {
        let prefixed = Manifest::from_digests(["sha256:abc", "sha256:def"]);
        let bare = Manifest::from_digests(["abc", "def"]);
        assert_eq!(prefixed.content_hash(), bare.content_hash());
    }

    #[test]
    fn test_shard_split() {
        let hash = ContentHash::from_hex("abcdef").unwrap();
        assert_eq!(hash.shard(), ("ab", "cdef"));
    }

    #[test]
    fn test_from_hex_rejects_non_hex() {
        assert!(ContentHash::from_hex("../etc").is_err());
        assert!(ContentHash::from_hex("ab").is_err());
        assert!(ContentHash::from_hex("ABCDEF").is_err());
    }
}
