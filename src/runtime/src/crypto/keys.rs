//! Key hierarchy: passphrase-derived KEKs wrapping per-blob DEKs.
//!
//! ## Key Derivation
//!
//! The KEK is derived with PBKDF2-HMAC-SHA256 from the passphrase and a
//! domain-separating salt string
//! `com.senetas.crypto/{repo}/{tag}/{role}[{index}]`, binding every wrapped
//! key to the image coordinate it was produced for. The same passphrase on a
//! different tag yields an independent KEK.
//!
//! ## Wrapping
//!
//! DEKs are 32 random bytes, wrapped with AES-256-GCM under the KEK with a
//! fresh 96-bit nonce. The salt string doubles as associated data, so a
//! wrapped key moved to a different coordinate fails authentication. An
//! unwrap failure is always reported as `BadPassphrase`: the caller cannot
//! distinguish a wrong passphrase from tampering.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crypto_cli_core::config::Passphrase;
use crypto_cli_core::error::{CryptoCliError, Result};

/// Key length for AES-256-GCM.
pub const KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// KDF algorithm identifier recorded in manifests.
const KDF_ALGO: &str = "pbkdf2-hmac-sha256";

/// Domain prefix for all key-derivation salts.
const SALT_PREFIX: &str = "com.senetas.crypto";

/// Salt string for an image's config blob.
pub fn config_salt(repository: &str, tag: &str) -> String {
    format!("{}/{}/{}/config", SALT_PREFIX, repository, tag)
}

/// Salt string for the layer at 0-based position `index`.
pub fn layer_salt(repository: &str, tag: &str, index: usize) -> String {
    format!("{}/{}/{}/layer{}", SALT_PREFIX, repository, tag, index)
}

/// Self-describing KDF parameters, embedded in every wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// KDF algorithm name.
    pub algo: String,
    /// Full domain-separating salt string.
    pub salt: String,
    /// PBKDF2 iteration count.
    pub iter: u32,
}

impl KdfParams {
    /// Default parameters for a given salt string.
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            algo: KDF_ALGO.to_string(),
            salt: salt.into(),
            iter: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

/// A key-encryption key derived from the passphrase. Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Kek([u8; KEY_LEN]);

/// A per-blob data-encryption key. Exists only in memory, zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataKey").field(&"<redacted>").finish()
    }
}

impl DataKey {
    /// Generate a fresh random DEK. Fails only if the OS RNG fails.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key).map_err(|_| CryptoCliError::RngFailure)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// A DEK wrapped under a passphrase-derived KEK.
///
/// Self-describing: together with the passphrase, the embedded KDF
/// parameters are sufficient to recover the DEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// AES-256-GCM ciphertext of the raw DEK, auth tag appended.
    #[serde(rename = "encKey", with = "base64_serde")]
    pub ciphertext: Vec<u8>,
    /// The 12-byte wrap nonce.
    #[serde(with = "base64_serde")]
    pub nonce: Vec<u8>,
    /// Parameters used to derive the KEK.
    pub kdf: KdfParams,
}

/// Derive the KEK for the given parameters.
pub fn derive_kek(passphrase: &Passphrase, params: &KdfParams) -> Result<Kek> {
    let iterations = std::num::NonZeroU32::new(params.iter).ok_or_else(|| {
        CryptoCliError::Serialization("KDF iteration count must be non-zero".to_string())
    })?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        params.salt.as_bytes(),
        passphrase.as_bytes(),
        &mut key,
    );
    Ok(Kek(key))
}

/// Wrap a DEK under the passphrase for the given KDF parameters.
pub fn wrap(dek: &DataKey, passphrase: &Passphrase, params: KdfParams) -> Result<WrappedKey> {
    let kek = derive_kek(passphrase, &params)?;

    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoCliError::RngFailure)?;

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &kek.0)
        .map_err(|_| CryptoCliError::Other("Failed to create AES-256-GCM key".to_string()))?;
    let mut sealing_key = aead::SealingKey::new(unbound, SingleNonce::new(nonce_bytes));

    let mut in_out = dek.as_bytes().to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(params.salt.as_bytes()), &mut in_out)
        .map_err(|_| CryptoCliError::Other("AES-256-GCM wrap failed".to_string()))?;

    Ok(WrappedKey {
        ciphertext: in_out,
        nonce: nonce_bytes.to_vec(),
        kdf: params,
    })
}

/// Unwrap a DEK with the passphrase and the parameters embedded in the key.
pub fn unwrap(wrapped: &WrappedKey, passphrase: &Passphrase) -> Result<DataKey> {
    if wrapped.nonce.len() != NONCE_LEN
        || wrapped.ciphertext.len() != KEY_LEN + aead::AES_256_GCM.tag_len()
    {
        return Err(CryptoCliError::BadPassphrase);
    }

    let kek = derive_kek(passphrase, &wrapped.kdf)?;

    let nonce_bytes: [u8; NONCE_LEN] = wrapped
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| CryptoCliError::BadPassphrase)?;

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &kek.0)
        .map_err(|_| CryptoCliError::Other("Failed to create AES-256-GCM key".to_string()))?;
    let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce::new(nonce_bytes));

    let mut in_out = wrapped.ciphertext.clone();
    let plaintext = opening_key
        .open_in_place(Aad::from(wrapped.kdf.salt.as_bytes()), &mut in_out)
        .map_err(|_| CryptoCliError::BadPassphrase)?;

    let key: [u8; KEY_LEN] = plaintext
        .try_into()
        .map_err(|_| CryptoCliError::BadPassphrase)?;
    in_out.zeroize();
    Ok(DataKey(key))
}

/// A NonceSequence that yields a single nonce then fails.
pub(crate) struct SingleNonce {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SingleNonce {
    pub(crate) fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

/// Base64 serde helper for binary manifest fields.
pub(crate) mod base64_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Vec<u8>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        use base64::Engine;
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params(salt: &str) -> KdfParams {
        // Keep test iterations low; the production default is exercised by
        // KdfParams::new.
        KdfParams {
            algo: KDF_ALGO.to_string(),
            salt: salt.to_string(),
            iter: 1000,
        }
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let pass = Passphrase::new("196884 = 196883 + 1");
        let dek = DataKey::generate().unwrap();
        let wrapped = wrap(&dek, &pass, test_params("com.senetas.crypto/foo/bar/config")).unwrap();
        let recovered = unwrap(&wrapped, &pass).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let pass = Passphrase::new("correct horse");
        let dek = DataKey::generate().unwrap();
        let wrapped = wrap(&dek, &pass, test_params("com.senetas.crypto/a/b/config")).unwrap();
        let err = unwrap(&wrapped, &Passphrase::new("battery staple")).unwrap_err();
        assert!(matches!(err, CryptoCliError::BadPassphrase));
    }

    #[test]
    fn test_salt_binding() {
        let pass = Passphrase::new("hunter2");
        let dek = DataKey::generate().unwrap();
        let wrapped = wrap(&dek, &pass, test_params("com.senetas.crypto/foo/v1/layer0")).unwrap();

        // Moving the wrapped key to a different coordinate must fail even
        // with the right passphrase.
        let mut moved = wrapped.clone();
        moved.kdf.salt = "com.senetas.crypto/foo/v2/layer0".to_string();
        let err = unwrap(&moved, &pass).unwrap_err();
        assert!(matches!(err, CryptoCliError::BadPassphrase));

        // The original still unwraps.
        assert_eq!(unwrap(&wrapped, &pass).unwrap().as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_distinct_tags_produce_distinct_wraps() {
        let pass = Passphrase::new("same passphrase");
        let dek = DataKey::generate().unwrap();
        let w1 = wrap(&dek, &pass, test_params(&layer_salt("foo", "v1", 0))).unwrap();
        let w2 = wrap(&dek, &pass, test_params(&layer_salt("foo", "v2", 0))).unwrap();
        assert_ne!(w1.ciphertext, w2.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let pass = Passphrase::new("p");
        let dek = DataKey::generate().unwrap();
        let mut wrapped = wrap(&dek, &pass, test_params("com.senetas.crypto/r/t/config")).unwrap();
        wrapped.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            unwrap(&wrapped, &pass).unwrap_err(),
            CryptoCliError::BadPassphrase
        ));
    }

    #[test]
    fn test_fresh_nonce_per_wrap() {
        let pass = Passphrase::new("p");
        let dek = DataKey::generate().unwrap();
        let params = test_params("com.senetas.crypto/r/t/config");
        let w1 = wrap(&dek, &pass, params.clone()).unwrap();
        let w2 = wrap(&dek, &pass, params).unwrap();
        assert_ne!(w1.nonce, w2.nonce);
    }

    #[test]
    fn test_wrapped_key_serde_roundtrip() {
        let pass = Passphrase::new("p");
        let dek = DataKey::generate().unwrap();
        let wrapped = wrap(&dek, &pass, test_params("com.senetas.crypto/r/t/layer3")).unwrap();
        let json = serde_json::to_string(&wrapped).unwrap();
        assert!(json.contains("\"encKey\""));
        assert!(json.contains("\"kdf\""));
        let back: WrappedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wrapped);
    }

    #[test]
    fn test_salt_format() {
        assert_eq!(
            config_salt("library/nginx", "latest"),
            "com.senetas.crypto/library/nginx/latest/config"
        );
        assert_eq!(
            layer_salt("foo", "bar", 0),
            "com.senetas.crypto/foo/bar/layer0"
        );
    }

    #[test]
    fn test_default_kdf_params() {
        let p = KdfParams::new("s");
        assert_eq!(p.algo, "pbkdf2-hmac-sha256");
        assert_eq!(p.iter, DEFAULT_PBKDF2_ITERATIONS);
    }
}
