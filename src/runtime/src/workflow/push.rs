//! Push workflow: assemble, upload in parallel, then PUT the manifest.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crypto_cli_core::config::{CryptoOpts, Passphrase};
use crypto_cli_core::error::{CryptoCliError, ErrorSet, Result};
use crypto_cli_core::workspace::Workspace;

use super::TRANSFER_CONCURRENCY;
use crate::daemon::DaemonClient;
use crate::digest::Digest;
use crate::image;
use crate::manifest::Descriptor;
use crate::reference::ImageRef;
use crate::registry::{Credentials, RegistryClient};

/// Encrypt an image and push it to its registry.
///
/// All blob uploads must succeed before the manifest PUT; the first upload
/// failure cancels outstanding uploads and the manifest is never written.
/// The workspace is cleaned on every exit, with cleanup errors merged into
/// the primary error.
pub async fn push_image(
    daemon: &dyn DaemonClient,
    reference: &ImageRef,
    passphrase: &Passphrase,
    opts: &CryptoOpts,
    credentials: Credentials,
    cancel: CancellationToken,
) -> Result<Digest> {
    let workspace = Workspace::create()?;
    let result = run(
        daemon,
        &workspace,
        reference,
        passphrase,
        opts,
        credentials,
        cancel,
    )
    .await;
    workspace.cleanup_merging(result)
}

async fn run(
    daemon: &dyn DaemonClient,
    workspace: &Workspace,
    reference: &ImageRef,
    passphrase: &Passphrase,
    opts: &CryptoOpts,
    credentials: Credentials,
    cancel: CancellationToken,
) -> Result<Digest> {
    let manifest =
        image::export_and_encrypt(daemon, workspace, reference, passphrase, opts).await?;
    if cancel.is_cancelled() {
        return Err(CryptoCliError::Cancelled);
    }

    let client = Arc::new(RegistryClient::for_push(
        reference,
        credentials,
        cancel.clone(),
    ));

    let blobs: Vec<&Descriptor> = std::iter::once(&manifest.config)
        .chain(manifest.layers.iter())
        .collect();
    tracing::info!(reference = %reference, blobs = blobs.len(), "Uploading blobs");

    let mut uploads = futures::stream::iter(blobs.into_iter().map(|descriptor| {
        let client = Arc::clone(&client);
        let path = descriptor.local_path().cloned();
        let digest = descriptor.digest().clone();
        let size = descriptor.size();
        async move {
            let path = path.ok_or_else(|| {
                CryptoCliError::Other(format!("blob {digest} has no local path"))
            })?;
            client.upload_blob(&path, &digest, size).await
        }
    }))
    .buffer_unordered(TRANSFER_CONCURRENCY);

    let mut errors = ErrorSet::new();
    while let Some(result) = uploads.next().await {
        if let Err(err) = result {
            // Cancellation fallout from an earlier failure is not a new
            // cause.
            if errors.is_empty() || !matches!(err, CryptoCliError::Cancelled) {
                errors.push(err);
            }
            cancel.cancel();
        }
    }
    drop(uploads);
    if let Some(err) = errors.into_error() {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(CryptoCliError::Cancelled);
    }

    // Happens-before: every blob is confirmed at this point.
    let digest = client.put_manifest(&reference.tag, &manifest).await?;
    tracing::info!(reference = %reference, digest = %digest, "Uploaded manifest");
    Ok(digest)
}
