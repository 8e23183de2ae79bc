//! Content digests.
//!
//! A digest is an `(algorithm, hex)` pair with canonical algorithm
//! `sha256`, rendered as `sha256:<hex>`. Blob digests are always computed
//! over the bytes at rest, after the final pipeline transform.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crypto_cli_core::error::{CryptoCliError, Result};

/// Canonical digest algorithm.
const CANONICAL_ALGORITHM: &str = "sha256";

/// A content digest, totally ordered by its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Construct a sha256 digest from raw hash output.
    pub fn from_sha256(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm: CANONICAL_ALGORITHM.to_string(),
            hex: hex::encode(bytes),
        }
    }

    /// Parse a digest from its `algorithm:hex` string form.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            CryptoCliError::Serialization(format!(
                "invalid digest '{}': expected algorithm:hex",
                s
            ))
        })?;
        if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(CryptoCliError::Serialization(format!(
                "invalid digest '{}'",
                s
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_lowercase(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Streaming sha256 of a file.
pub fn sha256sum(path: &Path) -> Result<Digest> {
    let file = std::fs::File::open(path).map_err(|e| CryptoCliError::io(path, e))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| CryptoCliError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest::from_sha256(hasher.finalize()))
}

/// A writer that hashes and counts everything passing through it.
///
/// Used wherever a descriptor's digest and size must match the bytes at
/// rest exactly: stream encryption output and blob downloads.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Flush and return the inner writer together with the digest and byte
    /// count of everything written.
    pub fn finalize(mut self) -> std::io::Result<(W, Digest, u64)> {
        self.inner.flush()?;
        let digest = Digest::from_sha256(self.hasher.finalize());
        Ok((self.inner, digest, self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
