//! Typed model of the encrypted image manifest.
//!
//! A mirror of the Docker v2 manifest with one extension: descriptors of
//! encrypted blobs carry a `crypto` envelope holding the wrapped DEK and
//! the plaintext digest. In memory a descriptor is a tagged variant, so
//! encrypted and plain blobs cannot be confused; the variant flattens back
//! to the optional `crypto` JSON field only at the serialization boundary.
//!
//! JSON is the wire form. Key order is irrelevant on parse; the canonical
//! pretty-printed form is used for local equality hashing, while the
//! registry's returned `Docker-Content-Digest` stays authoritative.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crypto_cli_core::config::EncAlgo;
use crypto_cli_core::error::Result;

use crate::crypto::keys::WrappedKey;
use crate::digest::Digest;

/// Media type of the manifest itself.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media type of an image config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Media type of a compressed layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Media type of a compressed, encrypted layer.
pub const LAYER_MEDIA_TYPE_ENCRYPTED: &str =
    "application/vnd.oci.image.layer.v1.tar+gzip+encrypted";

/// Crypto envelope attached to descriptors of encrypted blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoEnvelope {
    /// Algorithm family that produced the blob.
    pub enc_type: EncAlgo,
    /// Wrapped DEK with its KDF parameters (`encKey`, `nonce`, `kdf`).
    #[serde(flatten)]
    pub wrapped_key: WrappedKey,
    /// Digest of the uncompressed plaintext, for the post-decrypt
    /// cross-check.
    pub digest_plaintext: Digest,
}

/// A blob that is compressed but not encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    /// Present only while the blob sits in the workspace.
    pub local_path: Option<PathBuf>,
}

/// An encrypted blob and the material needed to recover it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    /// Present only while the blob sits in the workspace.
    pub local_path: Option<PathBuf>,
    pub crypto: CryptoEnvelope,
}

/// A typed pointer to a blob: encrypted or plain.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Plain(PlainDescriptor),
    Encrypted(EncryptedDescriptor),
}

impl Descriptor {
    pub fn media_type(&self) -> &str {
        match self {
            Descriptor::Plain(d) => &d.media_type,
            Descriptor::Encrypted(d) => &d.media_type,
        }
    }

    pub fn digest(&self) -> &Digest {
        match self {
            Descriptor::Plain(d) => &d.digest,
            Descriptor::Encrypted(d) => &d.digest,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Descriptor::Plain(d) => d.size,
            Descriptor::Encrypted(d) => d.size,
        }
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        match self {
            Descriptor::Plain(d) => d.local_path.as_ref(),
            Descriptor::Encrypted(d) => d.local_path.as_ref(),
        }
    }

    pub fn set_local_path(&mut self, path: Option<PathBuf>) {
        match self {
            Descriptor::Plain(d) => d.local_path = path,
            Descriptor::Encrypted(d) => d.local_path = path,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Descriptor::Encrypted(_))
    }

    pub fn crypto(&self) -> Option<&CryptoEnvelope> {
        match self {
            Descriptor::Plain(_) => None,
            Descriptor::Encrypted(d) => Some(&d.crypto),
        }
    }
}

/// Wire form of a descriptor: the variant flattened to an optional field.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorWire {
    media_type: String,
    size: u64,
    digest: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    crypto: Option<CryptoEnvelope>,
}

impl Serialize for Descriptor {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let wire = DescriptorWire {
            media_type: self.media_type().to_string(),
            size: self.size(),
            digest: self.digest().clone(),
            crypto: self.crypto().cloned(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let wire = DescriptorWire::deserialize(deserializer)?;
        Ok(match wire.crypto {
            Some(crypto) => Descriptor::Encrypted(EncryptedDescriptor {
                media_type: wire.media_type,
                digest: wire.digest,
                size: wire.size,
                local_path: None,
                crypto,
            }),
            None => Descriptor::Plain(PlainDescriptor {
                media_type: wire.media_type,
                digest: wire.digest,
                size: wire.size,
                local_path: None,
            }),
        })
    }
}

/// The top-level image manifest: config plus ordered layers.
///
/// Layer order is significant end to end: it matches the daemon tar's layer
/// order on push and drives reconstruction order on pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
        }
    }

    /// Parse the JSON wire form.
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Canonical pretty-printed JSON, used for uploads and local hashing.
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Digest of the canonical form, for local equality checks only; the
    /// registry's `Docker-Content-Digest` is authoritative.
    pub fn local_digest(&self) -> Result<Digest> {
        use sha2::Digest as _;
        let json = self.to_canonical_json()?;
        Ok(Digest::from_sha256(sha2::Sha256::digest(json.as_bytes())))
    }
}
