//! Import direction: downloaded blobs back to a daemon-loadable tar.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crypto_cli_core::config::Passphrase;
use crypto_cli_core::error::{CryptoCliError, Result};

use crate::blob;
use crate::manifest::{Descriptor, ImageManifest};
use crate::reference::ImageRef;

/// Entry of the `manifest.json` a daemon load tar carries.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoadManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Recover one blob's plaintext from its downloaded form.
///
/// Encrypted descriptors are decrypted and gunzipped with the plaintext
/// digest cross-checked; plain descriptors are gunzipped only.
pub fn restore_blob(
    descriptor: &Descriptor,
    input: &Path,
    output: &Path,
    passphrase: &Passphrase,
) -> Result<()> {
    match descriptor {
        Descriptor::Encrypted(d) => {
            blob::decrypt(
                input,
                &d.crypto.wrapped_key,
                passphrase,
                output,
                Some(&d.crypto.digest_plaintext),
            )?;
        }
        Descriptor::Plain(_) => {
            blob::decompress(input, output)?;
        }
    }
    Ok(())
}

/// Write a tar the daemon accepts for `load`, laying out the restored
/// config and layers in manifest order.
///
/// `config` and `layers` are plaintext paths produced by [`restore_blob`];
/// `layers` must be ordered exactly as the manifest's layer list.
pub fn write_load_tar(
    manifest: &ImageManifest,
    reference: &ImageRef,
    config: &Path,
    layers: &[PathBuf],
    dir: &Path,
) -> Result<PathBuf> {
    if layers.len() != manifest.layers.len() {
        return Err(CryptoCliError::Other(format!(
            "layer count mismatch: manifest lists {}, restored {}",
            manifest.layers.len(),
            layers.len()
        )));
    }

    let staging = dir.join("image");
    std::fs::create_dir_all(&staging).map_err(|e| CryptoCliError::io(&staging, e))?;

    let config_name = "config.json".to_string();
    copy_into(config, &staging.join(&config_name))?;

    let mut layer_names = Vec::with_capacity(layers.len());
    for (index, layer) in layers.iter().enumerate() {
        let layer_dir = staging.join(index.to_string());
        std::fs::create_dir_all(&layer_dir).map_err(|e| CryptoCliError::io(&layer_dir, e))?;
        let name = format!("{index}/layer.tar");
        copy_into(layer, &layer_dir.join("layer.tar"))?;
        layer_names.push(name);
    }

    let entry = LoadManifestEntry {
        config: config_name,
        repo_tags: vec![reference.repo_tag()],
        layers: layer_names,
    };
    let manifest_path = staging.join("manifest.json");
    let data = serde_json::to_vec_pretty(&[entry])?;
    std::fs::write(&manifest_path, data).map_err(|e| CryptoCliError::io(&manifest_path, e))?;

    let tar_path = dir.join("image.tar");
    let file = std::fs::File::create(&tar_path).map_err(|e| CryptoCliError::io(&tar_path, e))?;
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", &staging)
        .and_then(|_| builder.finish())
        .map_err(|e| CryptoCliError::io(&tar_path, e))?;

    Ok(tar_path)
}

fn copy_into(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst).map_err(|e| CryptoCliError::io(src, e))?;
    Ok(())
}
