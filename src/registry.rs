//! # Registry Access
//!
//! The mirror needs two things from a registry: the ordered layer digests
//! of an image (to compute its [`ContentHash`]) and the tag list of a
//! repository (to expand wildcard tags). Both sit behind the
//! [`ManifestSource`] trait so the orchestrator can be driven by a fake.
//!
//! ## Manifest Resolution
//!
//! For multi-platform images (Image Index), [`RegistryClient`]:
//! 1. Picks the `linux` entry matching the host architecture
//! 2. Pulls that platform-specific manifest by digest
//! 3. Returns its layers in manifest order
//!
//! ## Wildcard Tags
//!
//! [`expand_tags`] filters a tag list with a glob pattern, keeping the
//! registry's order:
//!
//! ```text
//! ["v1.0", "v1.1", "v2.0"]  +  "v1.*"  →  ["v1.0", "v1.1"]
//! ```
//!
//! [`ContentHash`]: crate::digest::ContentHash

use crate::constants::IMAGE_PULL_TIMEOUT;
use crate::digest::Manifest;
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciManifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info};

/// Source of manifests and tag lists.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the ordered layer list of `reference`.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest>;

    /// Lists the tags of `reference`'s repository, in registry order.
    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>>;
}

/// Filters `tags` by a glob `pattern`, preserving order.
pub fn expand_tags(pattern: &str, tags: &[String]) -> Result<Vec<String>> {
    let pattern = glob::Pattern::new(pattern).map_err(|e| Error::InvalidTagPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    Ok(tags
        .iter()
        .filter(|tag| pattern.matches(tag))
        .cloned()
        .collect())
}

/// OCI distribution client.
///
/// Uses anonymous HTTPS access; every round trip is bounded by
/// [`IMAGE_PULL_TIMEOUT`].
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    /// Creates a new registry client with anonymous auth.
    pub fn new() -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }

    /// Creates a client with basic auth.
    pub fn with_auth(username: &str, password: &str) -> Self {
        Self {
            auth: RegistryAuth::Basic(username.to_string(), password.to_string()),
            ..Self::new()
        }
    }

    fn oci_reference(reference: &ImageReference) -> Reference {
        Reference::with_tag(
            reference.registry.clone(),
            reference.repository_path(),
            reference.tag.clone(),
        )
    }

    async fn pull_manifest(&self, reference: &Reference, image: &str) -> Result<OciManifest> {
        let (manifest, _digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            self.client.pull_manifest(reference, &self.auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", image),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ManifestFetchFailed {
            reference: image.to_string(),
            reason: e.to_string(),
        })?;
        Ok(manifest)
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestSource for RegistryClient {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<Manifest> {
        let image = reference.pull_reference();
        let oci_ref = Self::oci_reference(reference);
        debug!("Fetching manifest for {}", image);

        match self.pull_manifest(&oci_ref, &image).await? {
            OciManifest::Image(img) => Ok(Manifest::from_digests(
                img.layers.into_iter().map(|l| l.digest),
            )),

            OciManifest::ImageIndex(index) => {
                let target_arch = host_architecture();
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .is_some_and(|p| p.os == "linux" && p.architecture == target_arch)
                    })
                    .ok_or_else(|| {
                        let available: Vec<String> = index
                            .manifests
                            .iter()
                            .filter_map(|m| m.platform.as_ref())
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                            .collect();
                        Error::ManifestFetchFailed {
                            reference: image.clone(),
                            reason: format!(
                                "no manifest for linux/{}. Available: {}",
                                target_arch,
                                available.join(", ")
                            ),
                        }
                    })?;

                let platform_ref = Reference::with_digest(
                    oci_ref.registry().to_string(),
                    oci_ref.repository().to_string(),
                    entry.digest.clone(),
                );

                match self.pull_manifest(&platform_ref, &image).await? {
                    OciManifest::Image(img) => Ok(Manifest::from_digests(
                        img.layers.into_iter().map(|l| l.digest),
                    )),
                    OciManifest::ImageIndex(_) => Err(Error::ManifestFetchFailed {
                        reference: image,
                        reason: "nested image index not supported".to_string(),
                    }),
                }
            }
        }
    }

    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let oci_ref = Self::oci_reference(reference);
        let repository = reference.repository_path();

        let response = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            self.client
                .list_tags(&oci_ref, &self.auth, None, None)
                .await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("list tags for {}", repository),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::TagListFailed {
            repository: repository.clone(),
            reason: e.to_string(),
        })?;

        info!("{} has {} tags", repository, response.tags.len());
        Ok(response.tags)
    }
}

/// OCI architecture name of the host.
fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    }
}
