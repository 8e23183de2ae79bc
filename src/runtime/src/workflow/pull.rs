//! Pull workflow: fetch the manifest, download and restore blobs in
//! parallel, reassemble the daemon tar, and load it.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crypto_cli_core::config::Passphrase;
use crypto_cli_core::error::{CryptoCliError, ErrorSet, Result};
use crypto_cli_core::workspace::Workspace;

use super::TRANSFER_CONCURRENCY;
use crate::daemon::DaemonClient;
use crate::image;
use crate::manifest::Descriptor;
use crate::reference::ImageRef;
use crate::registry::{Credentials, RegistryClient};

/// Position of a restored blob within the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Config,
    Layer(usize),
}

/// Pull an encrypted image, decrypt it, and load it into the daemon.
///
/// Downloads complete in any order; each blob streams into decryption as it
/// finishes. The final tar assembly observes the manifest's layer order.
pub async fn pull_image(
    daemon: &dyn DaemonClient,
    reference: &ImageRef,
    passphrase: &Passphrase,
    credentials: Credentials,
    cancel: CancellationToken,
) -> Result<()> {
    let workspace = Workspace::create()?;
    let result = run(daemon, &workspace, reference, passphrase, credentials, cancel).await;
    workspace.cleanup_merging(result)
}

async fn run(
    daemon: &dyn DaemonClient,
    workspace: &Workspace,
    reference: &ImageRef,
    passphrase: &Passphrase,
    credentials: Credentials,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Arc::new(RegistryClient::for_pull(
        reference,
        credentials,
        cancel.clone(),
    ));

    let manifest = client.get_manifest(&reference.tag).await?;
    tracing::info!(
        reference = %reference,
        layers = manifest.layers.len(),
        "Fetched manifest"
    );

    let jobs: Vec<(Slot, Descriptor)> = std::iter::once((Slot::Config, manifest.config.clone()))
        .chain(
            manifest
                .layers
                .iter()
                .enumerate()
                .map(|(i, d)| (Slot::Layer(i), d.clone())),
        )
        .collect();

    let mut transfers = futures::stream::iter(jobs.into_iter().map(|(slot, descriptor)| {
        let client = Arc::clone(&client);
        let passphrase = passphrase.clone();
        let dir = workspace.subdir();
        async move {
            let dir = dir?;
            restore_one(&client, slot, descriptor, dir, passphrase).await
        }
    }))
    .buffer_unordered(TRANSFER_CONCURRENCY);

    let mut errors = ErrorSet::new();
    let mut config_path: Option<PathBuf> = None;
    let mut layer_paths: Vec<Option<PathBuf>> = vec![None; manifest.layers.len()];
    while let Some(result) = transfers.next().await {
        match result {
            Ok((Slot::Config, path)) => config_path = Some(path),
            Ok((Slot::Layer(index), path)) => layer_paths[index] = Some(path),
            Err(err) => {
                if errors.is_empty() || !matches!(err, CryptoCliError::Cancelled) {
                    errors.push(err);
                }
                cancel.cancel();
            }
        }
    }
    drop(transfers);
    if let Some(err) = errors.into_error() {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(CryptoCliError::Cancelled);
    }

    let config_path = config_path
        .ok_or_else(|| CryptoCliError::Other("config blob was not restored".to_string()))?;
    let layer_paths: Vec<PathBuf> = layer_paths
        .into_iter()
        .map(|p| p.ok_or_else(|| CryptoCliError::Other("layer blob was not restored".to_string())))
        .collect::<Result<_>>()?;

    // Reassemble in manifest order and hand the tar to the daemon.
    let tar_dir = workspace.subdir()?;
    let tar_path = {
        let manifest = manifest.clone();
        let reference = reference.clone();
        tokio::task::spawn_blocking(move || {
            image::write_load_tar(&manifest, &reference, &config_path, &layer_paths, &tar_dir)
        })
        .await
        .map_err(|e| CryptoCliError::Other(format!("Assembly task failed: {e}")))??
    };

    daemon.image_load(&tar_path).await?;
    tracing::info!(reference = %reference, "Loaded image into daemon");
    Ok(())
}

/// Download one blob and stream it through the inverse pipeline.
async fn restore_one(
    client: &RegistryClient,
    slot: Slot,
    descriptor: Descriptor,
    dir: PathBuf,
    passphrase: Passphrase,
) -> Result<(Slot, PathBuf)> {
    let download = dir.join("blob");
    client.get_blob(descriptor.digest(), &download).await?;

    // Decrypt/decompress on the blocking pool; crypto is CPU-bound.
    let restored = dir.join("restored");
    let output = restored.clone();
    tokio::task::spawn_blocking(move || {
        image::restore_blob(&descriptor, &download, &output, &passphrase)?;
        let _ = std::fs::remove_file(&download);
        Ok::<_, CryptoCliError>(())
    })
    .await
    .map_err(|e| CryptoCliError::Other(format!("Restore task failed: {e}")))??;

    Ok((slot, restored))
}
