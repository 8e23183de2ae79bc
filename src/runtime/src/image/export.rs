//! Export direction: daemon image to encrypted manifest and blob set.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crypto_cli_core::config::{CryptoOpts, Passphrase};
use crypto_cli_core::error::{CryptoCliError, Result};
use crypto_cli_core::workspace::Workspace;

use crate::blob;
use crate::crypto::keys::{config_salt, layer_salt, KdfParams};
use crate::daemon::DaemonClient;
use crate::digest::{sha256sum, Digest};
use crate::manifest::{
    CryptoEnvelope, Descriptor, EncryptedDescriptor, ImageManifest, PlainDescriptor,
    CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, LAYER_MEDIA_TYPE_ENCRYPTED,
};
use crate::reference::ImageRef;

/// Build instruction marking the encryption boundary.
pub const ENCRYPTION_SENTINEL: &str = "LABEL com.senetas.crypto.enabled=true";

/// Entry of the `manifest.json` inside a daemon tar export.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SavedImageEntry {
    config: String,
    layers: Vec<String>,
}

/// Determine which rootfs layers sit above the encryption boundary.
///
/// The boundary is the history entry carrying the sentinel label; the first
/// occurrence (scanning from the newest entry) wins, matching how the
/// boundary was recorded at build time. Layers present in the image but not
/// in the boundary's parent are the confidential set.
pub async fn find_encrypted_layers(
    daemon: &dyn DaemonClient,
    reference: &ImageRef,
) -> Result<HashSet<Digest>> {
    let history = daemon.image_history(&reference.repo_tag()).await?;

    let boundary = history
        .iter()
        .position(|entry| entry.created_by.contains(ENCRYPTION_SENTINEL))
        .ok_or(CryptoCliError::NotEncryptable)?;
    if boundary + 1 >= history.len() {
        return Err(CryptoCliError::NotEncryptable);
    }

    let parent = &history[boundary + 1];
    if parent.is_missing() {
        return Err(CryptoCliError::NotBuiltLocally);
    }

    let top: HashSet<Digest> = daemon
        .image_layers(&history[0].id)
        .await?
        .into_iter()
        .collect();
    let base: HashSet<Digest> = daemon.image_layers(&parent.id).await?.into_iter().collect();

    Ok(top.difference(&base).cloned().collect())
}

/// Export an image from the daemon and transform it into an encrypted
/// manifest whose descriptors point at blobs in the workspace.
///
/// The config blob is always encrypted; layers are encrypted when their
/// content digest falls above the encryption boundary and compressed
/// otherwise. Layer order follows the daemon tar.
pub async fn export_and_encrypt(
    daemon: &dyn DaemonClient,
    workspace: &Workspace,
    reference: &ImageRef,
    passphrase: &Passphrase,
    opts: &CryptoOpts,
) -> Result<ImageManifest> {
    let encrypted_set = find_encrypted_layers(daemon, reference).await?;
    tracing::debug!(
        reference = %reference,
        encrypted_layers = encrypted_set.len(),
        "Selected encryption boundary"
    );

    let dir = workspace.subdir()?;
    let tar_path = dir.join("image.tar");
    daemon.image_save(&reference.repo_tag(), &tar_path).await?;

    // Unpacking and per-blob crypto are CPU/file-bound.
    let reference = reference.clone();
    let passphrase = passphrase.clone();
    let opts = opts.clone();
    tokio::task::spawn_blocking(move || {
        unpack_export(&tar_path, &dir)?;
        build_manifest(&dir, &reference, &encrypted_set, &passphrase, &opts)
    })
    .await
    .map_err(|e| CryptoCliError::Other(format!("Export task failed: {}", e)))?
}

/// Unpack the daemon tar export into `dir`.
fn unpack_export(tar_path: &Path, dir: &Path) -> Result<()> {
    let file = std::fs::File::open(tar_path).map_err(|e| CryptoCliError::io(tar_path, e))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(dir)
        .map_err(|e| CryptoCliError::io(dir, e))?;
    let _ = std::fs::remove_file(tar_path);
    Ok(())
}

/// Run every exported file through the pipeline and assemble the manifest.
fn build_manifest(
    dir: &Path,
    reference: &ImageRef,
    encrypted_set: &HashSet<Digest>,
    passphrase: &Passphrase,
    opts: &CryptoOpts,
) -> Result<ImageManifest> {
    let entry = read_saved_manifest(dir)?;

    let config_path = dir.join(&entry.config);
    let config = encrypt_file(
        &config_path,
        CONFIG_MEDIA_TYPE,
        config_salt(&reference.repository, &reference.tag),
        passphrase,
        opts,
    )?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for (index, layer_rel) in entry.layers.iter().enumerate() {
        let layer_path = dir.join(layer_rel);
        let diff_id = sha256sum(&layer_path)?;

        let descriptor = if encrypted_set.contains(&diff_id) {
            let media_type = if opts.compat {
                LAYER_MEDIA_TYPE
            } else {
                LAYER_MEDIA_TYPE_ENCRYPTED
            };
            encrypt_file(
                &layer_path,
                media_type,
                layer_salt(&reference.repository, &reference.tag, index),
                passphrase,
                opts,
            )?
        } else {
            let compressed = blob::compress(&layer_path)?;
            Descriptor::Plain(PlainDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: compressed.digest,
                size: compressed.size,
                local_path: Some(compressed.path),
            })
        };
        layers.push(descriptor);
    }

    Ok(ImageManifest::new(config, layers))
}

fn encrypt_file(
    path: &Path,
    media_type: &str,
    salt: String,
    passphrase: &Passphrase,
    opts: &CryptoOpts,
) -> Result<Descriptor> {
    let encrypted = blob::encrypt(path, passphrase, KdfParams::new(salt))?;
    Ok(Descriptor::Encrypted(EncryptedDescriptor {
        media_type: media_type.to_string(),
        digest: encrypted.digest,
        size: encrypted.size,
        local_path: Some(encrypted.path),
        crypto: CryptoEnvelope {
            enc_type: opts.algo,
            wrapped_key: encrypted.wrapped_key,
            digest_plaintext: encrypted.plaintext_digest,
        },
    }))
}

fn read_saved_manifest(dir: &Path) -> Result<SavedImageEntry> {
    let path = dir.join("manifest.json");
    let data = std::fs::read_to_string(&path).map_err(|e| CryptoCliError::io(&path, e))?;
    let mut entries: Vec<SavedImageEntry> = serde_json::from_str(&data)?;
    if entries.is_empty() {
        return Err(CryptoCliError::Daemon(
            "no image data in daemon export".to_string(),
        ));
    }
    Ok(entries.remove(0))
}
