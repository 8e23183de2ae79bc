//! Conversion between daemon tar exports and encrypted manifests.
//!
//! The export direction turns a daemon-resident image into a manifest plus
//! a set of compressed/encrypted blobs in the workspace; the import
//! direction rebuilds a tar the daemon can load from downloaded blobs.

mod export;
mod import;

pub use export::{export_and_encrypt, find_encrypted_layers, ENCRYPTION_SENTINEL};
pub use import::{restore_blob, write_load_tar};
