//! The blob pipeline: gzip and AEAD stages composed over files.
//!
//! Push direction runs `plain -> gzip -> encrypt`, pull direction the exact
//! inverse. Every stage streams with O(frame) memory, produces its output
//! next to the input inside the workspace, and deletes partial output when
//! it fails midway. Digests and sizes always describe the stage's output
//! file exactly as it lands on disk.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crypto_cli_core::config::Passphrase;
use crypto_cli_core::error::{CryptoCliError, Result};

use crate::crypto::keys::{self, DataKey, KdfParams, WrappedKey};
use crate::crypto::stream;
use crate::digest::{sha256sum, Digest, HashingWriter};

/// Suffix appended by the gzip stage.
const GZIP_SUFFIX: &str = "gz";

/// Suffix appended by the encryption stage.
const AEAD_SUFFIX: &str = "aes";

/// A compressed (but not encrypted) blob on disk.
#[derive(Debug, Clone)]
pub struct CompressedBlob {
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

/// An encrypted blob on disk, together with its wrapped DEK.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub path: PathBuf,
    /// Digest of the ciphertext file at rest.
    pub digest: Digest,
    /// Size of the ciphertext file at rest.
    pub size: u64,
    /// Digest of the original uncompressed content, for cross-checks after
    /// decryption.
    pub plaintext_digest: Digest,
    pub wrapped_key: WrappedKey,
}

/// Gzip `input` into `{input}.gz`.
pub fn compress(input: &Path) -> Result<CompressedBlob> {
    let output = suffixed(input, GZIP_SUFFIX);
    let result = compress_inner(input, &output);
    if result.is_err() {
        let _ = std::fs::remove_file(&output);
    }
    let (digest, size) = result?;
    Ok(CompressedBlob {
        path: output,
        digest,
        size,
    })
}

fn compress_inner(input: &Path, output: &Path) -> Result<(Digest, u64)> {
    let infile = std::fs::File::open(input).map_err(|e| CryptoCliError::io(input, e))?;
    let mut reader = BufReader::new(infile);

    let outfile = std::fs::File::create(output).map_err(|e| CryptoCliError::io(output, e))?;
    let writer = HashingWriter::new(BufWriter::new(outfile));
    let mut encoder = GzEncoder::new(writer, Compression::default());

    copy_stream(&mut reader, &mut encoder, input, output)?;
    let writer = encoder
        .finish()
        .map_err(|e| CryptoCliError::io(output, e))?;
    let (_, digest, size) = writer
        .finalize()
        .map_err(|e| CryptoCliError::io(output, e))?;
    Ok((digest, size))
}

/// Gunzip `input` into `output`, returning the digest and size of the
/// decompressed content.
pub fn decompress(input: &Path, output: &Path) -> Result<(Digest, u64)> {
    let result = decompress_inner(input, output);
    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    result
}

fn decompress_inner(input: &Path, output: &Path) -> Result<(Digest, u64)> {
    let infile = std::fs::File::open(input).map_err(|e| CryptoCliError::io(input, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(infile));

    let outfile = std::fs::File::create(output).map_err(|e| CryptoCliError::io(output, e))?;
    let mut writer = HashingWriter::new(BufWriter::new(outfile));

    copy_stream(&mut decoder, &mut writer, input, output)?;
    let (_, digest, size) = writer
        .finalize()
        .map_err(|e| CryptoCliError::io(output, e))?;
    Ok((digest, size))
}

/// Compress then encrypt `input`, producing `{input}.gz.aes`.
///
/// A fresh DEK is generated for the blob and wrapped under the passphrase
/// with the supplied KDF parameters.
pub fn encrypt(input: &Path, passphrase: &Passphrase, params: KdfParams) -> Result<EncryptedBlob> {
    let plaintext_digest = sha256sum(input)?;

    let compressed = compress(input)?;
    let output = suffixed(&compressed.path, AEAD_SUFFIX);

    let dek = DataKey::generate()?;
    let result = stream::encrypt_file(&compressed.path, &output, &dek);
    let _ = std::fs::remove_file(&compressed.path);
    let (digest, size) = result?;

    let wrapped_key = keys::wrap(&dek, passphrase, params)?;

    Ok(EncryptedBlob {
        path: output,
        digest,
        size,
        plaintext_digest,
        wrapped_key,
    })
}

/// Decrypt then decompress `input` into `output`.
///
/// The DEK is recovered from the wrapped key (`BadPassphrase` on
/// authentication failure); stream authentication failures surface as
/// `CorruptCiphertext`. When `expected_plaintext` is supplied, the recovered
/// content digest is cross-checked against it.
pub fn decrypt(
    input: &Path,
    wrapped: &WrappedKey,
    passphrase: &Passphrase,
    output: &Path,
    expected_plaintext: Option<&Digest>,
) -> Result<(Digest, u64)> {
    let dek = keys::unwrap(wrapped, passphrase)?;

    let compressed = suffixed(output, GZIP_SUFFIX);
    let result = stream::decrypt_file(input, &compressed, &dek)
        .and_then(|_| decompress(&compressed, output));
    let _ = std::fs::remove_file(&compressed);
    let (digest, size) = match result {
        Ok(pair) => pair,
        Err(e) => {
            let _ = std::fs::remove_file(output);
            return Err(e);
        }
    };

    if let Some(expected) = expected_plaintext {
        if expected != &digest {
            let _ = std::fs::remove_file(output);
            return Err(CryptoCliError::CorruptCiphertext(format!(
                "plaintext digest mismatch: expected {}, got {}",
                expected, digest
            )));
        }
    }

    Ok((digest, size))
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn copy_stream(
    reader: &mut impl Read,
    writer: &mut impl Write,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| CryptoCliError::io(input, e))?;
        if n == 0 {
            return Ok(());
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| CryptoCliError::io(output, e))?;
    }
}
