//! Local container daemon access.
//!
//! The assembler only needs four narrow operations: image history, rootfs
//! layer digests, save, and load. They are modeled as a trait so workflows
//! can run against a test double, with a default implementation driving the
//! `docker` binary. `DOCKER_HOST` and proxy variables pass through to the
//! child process untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crypto_cli_core::error::{CryptoCliError, Result};

use crate::digest::Digest;

/// One entry of an image's build history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Image id, or `<missing>` when the layer was not built locally.
    pub id: String,
    /// The command that created the layer.
    pub created_by: String,
}

impl HistoryEntry {
    /// Whether the layer is unavailable in the local daemon.
    pub fn is_missing(&self) -> bool {
        self.id == "<missing>"
    }
}

/// Narrow interface to the local container daemon.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Build history of an image, newest entry first.
    async fn image_history(&self, reference: &str) -> Result<Vec<HistoryEntry>>;

    /// RootFS layer digests (diff ids) of an image, bottom to top.
    async fn image_layers(&self, image: &str) -> Result<Vec<Digest>>;

    /// Export an image as a tar archive at `dest`.
    async fn image_save(&self, reference: &str, dest: &Path) -> Result<()>;

    /// Load an image tar archive into the daemon.
    async fn image_load(&self, tar: &Path) -> Result<()>;
}

/// Daemon client driving the `docker` command-line binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("docker"),
        }
    }

    /// Use an explicit binary path (e.g., a podman shim).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(binary = %self.binary.display(), ?args, "Invoking daemon CLI");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| CryptoCliError::io(&self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CryptoCliError::Daemon(format!(
                "'{} {}' failed: {}",
                self.binary.display(),
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaemonClient for DockerCli {
    async fn image_history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        let stdout = self
            .run(&[
                "history",
                "--no-trunc",
                "--format",
                "{{.ID}}\t{{.CreatedBy}}",
                reference,
            ])
            .await?;
        Ok(parse_history(&stdout))
    }

    async fn image_layers(&self, image: &str) -> Result<Vec<Digest>> {
        let stdout = self
            .run(&[
                "image",
                "inspect",
                "--format",
                "{{json .RootFS.Layers}}",
                image,
            ])
            .await?;
        let layers: Vec<String> = serde_json::from_str(stdout.trim())?;
        layers.iter().map(|l| Digest::parse(l)).collect()
    }

    async fn image_save(&self, reference: &str, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        self.run(&["save", "--output", &dest_str, reference]).await?;
        Ok(())
    }

    async fn image_load(&self, tar: &Path) -> Result<()> {
        let tar_str = tar.to_string_lossy();
        self.run(&["load", "--input", &tar_str]).await?;
        Ok(())
    }
}

/// Parse `docker history` tab-separated output into entries.
fn parse_history(stdout: &str) -> Vec<HistoryEntry> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (id, created_by) = line.split_once('\t').unwrap_or((line, ""));
            HistoryEntry {
                id: id.trim().to_string(),
                created_by: created_by.trim().to_string(),
            }
        })
        .collect()
}
