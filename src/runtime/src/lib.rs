//! Encrypted image pipeline for crypto-cli.
//!
//! This crate implements the transformation between a daemon-resident
//! container image and a set of registry-stored ciphertext blobs:
//!
//! - Per-blob streaming `plain → gzip → AEAD-encrypt → digest/size` and its
//!   exact inverse ([`blob`], [`crypto`])
//! - The key hierarchy: passphrase-derived KEKs wrapping per-blob DEKs,
//!   salt-bound to the image coordinate ([`crypto::keys`])
//! - The typed encrypted manifest and its JSON wire form ([`manifest`])
//! - Conversion between daemon tar exports and manifests ([`image`])
//! - A registry v2 protocol client with bearer auth and retries
//!   ([`registry`])
//! - The push and pull workflows wiring it all together ([`workflow`])

pub mod blob;
pub mod crypto;
pub mod daemon;
pub mod digest;
pub mod image;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod workflow;

pub use daemon::{DaemonClient, DockerCli, HistoryEntry};
pub use digest::{sha256sum, Digest};
pub use manifest::{Descriptor, ImageManifest};
pub use reference::ImageRef;
pub use registry::{Credentials, RegistryClient};
pub use workflow::{pull_image, push_image};
