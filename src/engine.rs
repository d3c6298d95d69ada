//! Container engine access.
//!
//! The mirror never unpacks registry layers itself. It asks a container
//! engine to pull the image, create a throwaway container from it, and
//! export that container's flattened filesystem as a tar stream:
//!
//! ```text
//! pull(image) → create(image) → export(container, sink) → rm(container) → rmi(image)
//! ```
//!
//! [`EngineCli`] drives any docker-compatible CLI (`docker`, `podman`).

use crate::constants::{DEFAULT_ENGINE_BIN, EXPORT_CONTAINER_PREFIX};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs::File;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Pull/create/export/remove operations of a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pulls an image by full reference.
    async fn pull(&self, image: &str) -> Result<()>;

    /// Creates a stopped container from `image`, returning its id.
    async fn create(&self, image: &str) -> Result<String>;

    /// Writes the container's filesystem as a tar stream into `sink`.
    async fn export(&self, container: &str, sink: File) -> Result<()>;

    /// Removes a container.
    async fn remove_container(&self, container: &str) -> Result<()>;

    /// Removes an image from the local cache.
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Reclaims unused engine storage.
    async fn prune(&self) -> Result<()>;
}

/// [`ContainerEngine`] over a docker-compatible command line.
#[derive(Debug, Clone)]
pub struct EngineCli {
    program: String,
}

impl EngineCli {
    /// Uses `docker` from `PATH`.
    pub fn new() -> Self {
        Self::with_program(DEFAULT_ENGINE_BIN)
    }

    /// Uses another docker-compatible program.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Returns the program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, operation: &str, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::EngineFailed {
                operation: operation.to_string(),
                reason: format!("failed to spawn {}: {}", self.program, e),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::EngineFailed {
                operation: operation.to_string(),
                reason: format!(
                    "{} ({})",
                    String::from_utf8_lossy(&output.stderr).trim(),
                    output.status
                ),
            })
        }
    }
}

impl Default for EngineCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for EngineCli {
    async fn pull(&self, image: &str) -> Result<()> {
        self.run("pull", &["pull", "--quiet", image])
            .await
            .map(|_| ())
            .map_err(|e| Error::ImagePullFailed {
                reference: image.to_string(),
                reason: e.to_string(),
            })
    }

    async fn create(&self, image: &str) -> Result<String> {
        let name = format!("{}-{}", EXPORT_CONTAINER_PREFIX, uuid::Uuid::now_v7());
        self.run("create", &["create", "--name", &name, image, "/bin/true"])
            .await?;
        Ok(name)
    }

    async fn export(&self, container: &str, sink: File) -> Result<()> {
        debug!("Exporting {}", container);
        let status = Command::new(&self.program)
            .args(["export", container])
            .stdin(Stdio::null())
            .stdout(sink)
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| Error::EngineFailed {
                operation: "export".to_string(),
                reason: format!("failed to spawn {}: {}", self.program, e),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::EngineFailed {
                operation: "export".to_string(),
                reason: format!("{} export {} exited with {}", self.program, container, status),
            })
        }
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.run("rm", &["rm", "--force", container]).await.map(|_| ())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.run("rmi", &["rmi", image]).await.map(|_| ())
    }

    async fn prune(&self) -> Result<()> {
        self.run("prune", &["system", "prune", "--force"])
            .await
            .map(|_| ())
    }
}
