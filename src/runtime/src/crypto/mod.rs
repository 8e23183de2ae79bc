//! Cryptographic primitives: key derivation, key wrapping, and streaming
//! AEAD over files.

pub mod keys;
pub mod stream;

pub use keys::{
    config_salt, derive_kek, layer_salt, unwrap, wrap, DataKey, KdfParams, WrappedKey,
};
