//! Push and pull workflows end to end against a mock registry and a fake
//! daemon.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use mockito::Matcher;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crypto_cli_core::config::{CryptoOpts, Passphrase};
use crypto_cli_core::error::{CryptoCliError, Result};
use crypto_cli_runtime::blob;
use crypto_cli_runtime::crypto::keys::KdfParams;
use crypto_cli_runtime::manifest::{
    CryptoEnvelope, Descriptor, EncryptedDescriptor, ImageManifest, PlainDescriptor,
    CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, LAYER_MEDIA_TYPE_ENCRYPTED,
};
use crypto_cli_runtime::registry::Credentials;
use crypto_cli_runtime::{
    pull_image, push_image, DaemonClient, Digest, HistoryEntry, ImageRef,
};

const SENTINEL: &str = "LABEL com.senetas.crypto.enabled=true";

/// Test double for the container daemon.
struct FakeDaemon {
    history: Vec<HistoryEntry>,
    layers_by_id: Vec<(String, Vec<Digest>)>,
    layer_contents: Vec<Vec<u8>>,
    loaded: Mutex<Vec<Vec<u8>>>,
}

impl FakeDaemon {
    /// An image with `layer_contents` whose layers from `boundary` upward
    /// are above the encryption boundary.
    fn new(layer_contents: Vec<Vec<u8>>, boundary: usize) -> Self {
        let all: Vec<Digest> = layer_contents.iter().map(|c| digest_of(c)).collect();
        let base = all[..boundary].to_vec();
        Self {
            history: vec![
                HistoryEntry {
                    id: "sha256:top".to_string(),
                    created_by: "/bin/sh -c #(nop)  CMD [\"app\"]".to_string(),
                },
                HistoryEntry {
                    id: "sha256:label".to_string(),
                    created_by: format!("/bin/sh -c #(nop)  {SENTINEL}"),
                },
                HistoryEntry {
                    id: "sha256:base".to_string(),
                    created_by: "/bin/sh -c apt-get install app".to_string(),
                },
            ],
            layers_by_id: vec![
                ("sha256:top".to_string(), all),
                ("sha256:base".to_string(), base),
            ],
            layer_contents,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// A daemon that should never be asked to load an image.
    fn empty() -> Self {
        Self::new(vec![b"only".to_vec()], 0)
    }
}

#[async_trait]
impl DaemonClient for FakeDaemon {
    async fn image_history(&self, _reference: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.clone())
    }

    async fn image_layers(&self, image: &str) -> Result<Vec<Digest>> {
        self.layers_by_id
            .iter()
            .find(|(id, _)| id == image)
            .map(|(_, layers)| layers.clone())
            .ok_or_else(|| CryptoCliError::Daemon(format!("unknown image {image}")))
    }

    async fn image_save(&self, _reference: &str, dest: &Path) -> Result<()> {
        let staging = TempDir::new().unwrap();
        std::fs::write(staging.path().join("config.json"), b"{\"os\":\"linux\"}").unwrap();
        let mut layer_names = Vec::new();
        for (i, content) in self.layer_contents.iter().enumerate() {
            let layer_dir = staging.path().join(format!("{i}"));
            std::fs::create_dir(&layer_dir).unwrap();
            std::fs::write(layer_dir.join("layer.tar"), content).unwrap();
            layer_names.push(format!("{i}/layer.tar"));
        }
        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["e2e/app:latest"],
            "Layers": layer_names,
        }]);
        std::fs::write(
            staging.path().join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let file = std::fs::File::create(dest).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", staging.path()).unwrap();
        builder.finish().unwrap();
        Ok(())
    }

    async fn image_load(&self, tar: &Path) -> Result<()> {
        self.loaded
            .lock()
            .unwrap()
            .push(std::fs::read(tar).unwrap());
        Ok(())
    }
}

fn digest_of(content: &[u8]) -> Digest {
    use sha2::Digest as _;
    Digest::from_sha256(sha2::Sha256::digest(content))
}

fn fast_params(salt: &str) -> KdfParams {
    KdfParams {
        iter: 1000,
        ..KdfParams::new(salt)
    }
}

fn reference_for(server: &mockito::ServerGuard, repo: &str) -> ImageRef {
    let host = server.url().trim_start_matches("http://").to_string();
    ImageRef {
        registry: host,
        repository: repo.to_string(),
        tag: "latest".to_string(),
    }
}

/// Full push: every blob goes through HEAD/POST/PUT, then the manifest is
/// PUT once.
#[tokio::test]
async fn push_uploads_all_blobs_then_manifest() {
    let mut server = mockito::Server::new_async().await;
    let repo = "push-repo";

    // Config + 2 layers = 3 blobs, digests unknown upfront (fresh DEKs).
    let head = server
        .mock(
            "HEAD",
            Matcher::Regex(format!(r"^/v2/{repo}/blobs/sha256:[0-9a-f]{{64}}$")),
        )
        .with_status(404)
        .expect(3)
        .create_async()
        .await;
    let post = server
        .mock("POST", format!("/v2/{repo}/blobs/uploads/").as_str())
        .with_status(202)
        .with_header("Location", &format!("/v2/{repo}/blobs/uploads/session"))
        .expect(3)
        .create_async()
        .await;
    let put = server
        .mock("PUT", format!("/v2/{repo}/blobs/uploads/session").as_str())
        .match_query(Matcher::Any)
        .with_status(201)
        .expect(3)
        .create_async()
        .await;
    let manifest_put = server
        .mock("PUT", format!("/v2/{repo}/manifests/latest").as_str())
        .with_status(201)
        .with_header(
            "Docker-Content-Digest",
            &format!("sha256:{}", "ab".repeat(32)),
        )
        .expect(1)
        .create_async()
        .await;

    let daemon = FakeDaemon::new(vec![b"public base".to_vec(), b"secret upper".to_vec()], 1);
    let reference = reference_for(&server, repo);
    let digest = push_image(
        &daemon,
        &reference,
        &Passphrase::new("p"),
        &CryptoOpts::default(),
        Credentials::Anonymous,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(digest.to_string(), format!("sha256:{}", "ab".repeat(32)));
    head.assert_async().await;
    post.assert_async().await;
    put.assert_async().await;
    manifest_put.assert_async().await;
}

/// Re-pushing an image the registry already holds re-PUTs only the
/// manifest.
#[tokio::test]
async fn second_push_skips_existing_blobs() {
    let mut server = mockito::Server::new_async().await;
    let repo = "dup-push-repo";

    server
        .mock(
            "HEAD",
            Matcher::Regex(format!(r"^/v2/{repo}/blobs/sha256:[0-9a-f]{{64}}$")),
        )
        .with_status(200)
        .expect(3)
        .create_async()
        .await;
    let post = server
        .mock("POST", format!("/v2/{repo}/blobs/uploads/").as_str())
        .expect(0)
        .create_async()
        .await;
    let manifest_put = server
        .mock("PUT", format!("/v2/{repo}/manifests/latest").as_str())
        .with_status(201)
        .with_header(
            "Docker-Content-Digest",
            &format!("sha256:{}", "cd".repeat(32)),
        )
        .expect(1)
        .create_async()
        .await;

    let daemon = FakeDaemon::new(vec![b"base".to_vec(), b"upper".to_vec()], 1);
    let reference = reference_for(&server, repo);
    push_image(
        &daemon,
        &reference,
        &Passphrase::new("p"),
        &CryptoOpts::default(),
        Credentials::Anonymous,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    post.assert_async().await;
    manifest_put.assert_async().await;
}

/// A failed blob upload skips the manifest PUT entirely.
#[tokio::test]
async fn failed_upload_skips_manifest() {
    let mut server = mockito::Server::new_async().await;
    let repo = "fail-repo";

    server
        .mock(
            "HEAD",
            Matcher::Regex(format!(r"^/v2/{repo}/blobs/sha256:[0-9a-f]{{64}}$")),
        )
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", format!("/v2/{repo}/blobs/uploads/").as_str())
        .with_status(403)
        .create_async()
        .await;
    let manifest_put = server
        .mock("PUT", format!("/v2/{repo}/manifests/latest").as_str())
        .expect(0)
        .create_async()
        .await;

    let daemon = FakeDaemon::new(vec![b"base".to_vec(), b"upper".to_vec()], 1);
    let reference = reference_for(&server, repo);
    let err = push_image(
        &daemon,
        &reference,
        &Passphrase::new("p"),
        &CryptoOpts::default(),
        Credentials::Anonymous,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match &err {
        CryptoCliError::UploadFailed { .. } | CryptoCliError::Multiple(_) => {}
        other => panic!("expected upload failure, got {other:?}"),
    }
    manifest_put.assert_async().await;
}

/// Pull: manifest with three layers, the middle one plain, reconstructed
/// into a load tar in manifest order.
#[tokio::test]
async fn pull_restores_image_in_order() {
    let mut server = mockito::Server::new_async().await;
    let repo = "pull-repo";
    let pass = Passphrase::new("p");
    let staging = TempDir::new().unwrap();

    // Build the blobs the registry will serve.
    let make_encrypted = |name: &str, content: &[u8], salt: &str| {
        let path = staging.path().join(name);
        std::fs::write(&path, content).unwrap();
        let enc = blob::encrypt(&path, &pass, fast_params(salt)).unwrap();
        let bytes = std::fs::read(&enc.path).unwrap();
        (enc, bytes)
    };
    let (config_enc, config_bytes) = make_encrypted(
        "config",
        b"{\"os\":\"linux\"}",
        "com.senetas.crypto/pull-repo/latest/config",
    );
    let (l0_enc, l0_bytes) = make_encrypted(
        "l0",
        b"layer zero",
        "com.senetas.crypto/pull-repo/latest/layer0",
    );
    let l1_plain = {
        let path = staging.path().join("l1");
        std::fs::write(&path, b"layer one").unwrap();
        blob::compress(&path).unwrap()
    };
    let l1_bytes = std::fs::read(&l1_plain.path).unwrap();
    let (l2_enc, l2_bytes) = make_encrypted(
        "l2",
        b"layer two",
        "com.senetas.crypto/pull-repo/latest/layer2",
    );

    let to_descriptor = |enc: &blob::EncryptedBlob, media_type: &str| {
        Descriptor::Encrypted(EncryptedDescriptor {
            media_type: media_type.to_string(),
            digest: enc.digest.clone(),
            size: enc.size,
            local_path: None,
            crypto: CryptoEnvelope {
                enc_type: Default::default(),
                wrapped_key: enc.wrapped_key.clone(),
                digest_plaintext: enc.plaintext_digest.clone(),
            },
        })
    };
    let manifest = ImageManifest::new(
        to_descriptor(&config_enc, CONFIG_MEDIA_TYPE),
        vec![
            to_descriptor(&l0_enc, LAYER_MEDIA_TYPE_ENCRYPTED),
            Descriptor::Plain(PlainDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: l1_plain.digest.clone(),
                size: l1_plain.size,
                local_path: None,
            }),
            to_descriptor(&l2_enc, LAYER_MEDIA_TYPE_ENCRYPTED),
        ],
    );

    server
        .mock("GET", format!("/v2/{repo}/manifests/latest").as_str())
        .with_status(200)
        .with_body(manifest.to_canonical_json().unwrap())
        .create_async()
        .await;
    for (descriptor, bytes) in [
        (&manifest.config, &config_bytes),
        (&manifest.layers[0], &l0_bytes),
        (&manifest.layers[1], &l1_bytes),
        (&manifest.layers[2], &l2_bytes),
    ] {
        server
            .mock(
                "GET",
                format!("/v2/{repo}/blobs/{}", descriptor.digest()).as_str(),
            )
            .with_status(200)
            .with_body(bytes)
            .create_async()
            .await;
    }

    let daemon = FakeDaemon::empty();
    let reference = reference_for(&server, repo);
    pull_image(
        &daemon,
        &reference,
        &pass,
        Credentials::Anonymous,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Inspect what the daemon was asked to load.
    let loaded = daemon.loaded.lock().unwrap();
    assert_eq!(loaded.len(), 1);
    let unpack = TempDir::new().unwrap();
    let mut archive = tar::Archive::new(std::io::Cursor::new(loaded[0].clone()));
    archive.unpack(unpack.path()).unwrap();

    let manifest_json =
        std::fs::read_to_string(unpack.path().join("manifest.json")).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&manifest_json).unwrap();
    assert_eq!(
        entries[0]["Layers"],
        serde_json::json!(["0/layer.tar", "1/layer.tar", "2/layer.tar"])
    );

    let read = |p: &str| std::fs::read(unpack.path().join(p)).unwrap();
    assert_eq!(read("config.json"), b"{\"os\":\"linux\"}");
    assert_eq!(read("0/layer.tar"), b"layer zero");
    assert_eq!(read("1/layer.tar"), b"layer one");
    assert_eq!(read("2/layer.tar"), b"layer two");
}

/// A wrong passphrase on pull surfaces as `BadPassphrase`.
#[tokio::test]
async fn pull_with_wrong_passphrase_fails() {
    let mut server = mockito::Server::new_async().await;
    let repo = "wrongpass-repo";
    let staging = TempDir::new().unwrap();

    let path = staging.path().join("config");
    std::fs::write(&path, b"{}").unwrap();
    let enc = blob::encrypt(
        &path,
        &Passphrase::new("right"),
        fast_params("com.senetas.crypto/wrongpass-repo/latest/config"),
    )
    .unwrap();
    let bytes = std::fs::read(&enc.path).unwrap();

    let manifest = ImageManifest::new(
        Descriptor::Encrypted(EncryptedDescriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            digest: enc.digest.clone(),
            size: enc.size,
            local_path: None,
            crypto: CryptoEnvelope {
                enc_type: Default::default(),
                wrapped_key: enc.wrapped_key.clone(),
                digest_plaintext: enc.plaintext_digest.clone(),
            },
        }),
        vec![],
    );

    server
        .mock("GET", format!("/v2/{repo}/manifests/latest").as_str())
        .with_status(200)
        .with_body(manifest.to_canonical_json().unwrap())
        .create_async()
        .await;
    server
        .mock("GET", format!("/v2/{repo}/blobs/{}", enc.digest).as_str())
        .with_status(200)
        .with_body(&bytes)
        .create_async()
        .await;

    let daemon = FakeDaemon::empty();
    let reference = reference_for(&server, repo);
    let err = pull_image(
        &daemon,
        &reference,
        &Passphrase::new("wrong"),
        Credentials::Anonymous,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CryptoCliError::BadPassphrase));
    assert!(daemon.loaded.lock().unwrap().is_empty());
}

/// A cancelled pull returns `Cancelled` without loading anything.
#[tokio::test]
async fn cancelled_pull_returns_cancelled() {
    let mut server = mockito::Server::new_async().await;
    let repo = "cancelled-repo";
    let get = server
        .mock("GET", format!("/v2/{repo}/manifests/latest").as_str())
        .expect(0)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let daemon = FakeDaemon::empty();
    let reference = reference_for(&server, repo);
    let err = pull_image(
        &daemon,
        &reference,
        &Passphrase::new("p"),
        Credentials::Anonymous,
        cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CryptoCliError::Cancelled));
    assert!(daemon.loaded.lock().unwrap().is_empty());
    get.assert_async().await;
}
