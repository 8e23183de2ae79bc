//! Cryptographic options shared by the push and pull workflows.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encryption algorithm selector.
///
/// Names follow the `--type` CLI flag; the string form is also what is
/// recorded as `enc_type` in manifest crypto envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncAlgo {
    /// PBKDF2-HMAC-SHA256 key derivation wrapping per-blob AES-256-GCM keys.
    #[default]
    #[serde(rename = "pbkdf2-aes256-gcm")]
    Pbkdf2Aes256Gcm,
}

impl EncAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncAlgo::Pbkdf2Aes256Gcm => "pbkdf2-aes256-gcm",
        }
    }
}

impl std::fmt::Display for EncAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EncAlgo {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pbkdf2-aes256-gcm" => Ok(EncAlgo::Pbkdf2Aes256Gcm),
            _ => Err(format!(
                "unknown encryption type: '{}' (supported: pbkdf2-aes256-gcm)",
                s
            )),
        }
    }
}

/// Options controlling how blobs and manifests are produced.
#[derive(Debug, Clone, Default)]
pub struct CryptoOpts {
    /// AEAD/KDF algorithm family.
    pub algo: EncAlgo,
    /// Emit manifests whose descriptors keep standard media types, so
    /// unencrypted clients can still parse the manifest and fetch plain
    /// layers.
    pub compat: bool,
}

/// A passphrase held in memory.
///
/// Never printed: the `Debug` form is redacted, and the buffer is zeroed
/// on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Passphrase(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_enc_algo_roundtrip() {
        let algo = EncAlgo::from_str("pbkdf2-aes256-gcm").unwrap();
        assert_eq!(algo, EncAlgo::Pbkdf2Aes256Gcm);
        assert_eq!(algo.to_string(), "pbkdf2-aes256-gcm");
    }

    #[test]
    fn test_enc_algo_unknown() {
        assert!(EncAlgo::from_str("rot13").is_err());
    }

    #[test]
    fn test_passphrase_debug_redacted() {
        let pass = Passphrase::new("hunter2");
        assert_eq!(format!("{:?}", pass), "Passphrase(<redacted>)");
    }

    #[test]
    fn test_default_algo() {
        assert_eq!(EncAlgo::default(), EncAlgo::Pbkdf2Aes256Gcm);
    }
}
