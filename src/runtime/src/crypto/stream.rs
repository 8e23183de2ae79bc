//! Streaming AEAD over files.
//!
//! The at-rest encoding is
//!
//! ```text
//! [ nonce (12) ][ frame 0 ] ... [ frame N-1 ][ final tag (16) ]
//! ```
//!
//! where each frame is `[ len (4 BE) ][ ciphertext ][ tag (16) ]` over at
//! most 64 KiB of plaintext. Per-frame nonces are the base nonce combined
//! with the frame counter, and the frame index is bound as associated data,
//! so reordering or substituting frames fails authentication at the frame
//! boundary without buffering the whole file. The trailing tag
//! authenticates the total frame count, so truncation is detected too.
//!
//! Memory use is one frame regardless of file size; sizes are tracked as
//! `u64` so blobs past 4 GiB stream fine.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crypto_cli_core::error::{CryptoCliError, Result};

use super::keys::DataKey;
use crate::digest::{Digest, HashingWriter};

/// Plaintext bytes per frame.
pub const FRAME_LEN: usize = 64 * 1024;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Encrypt `input` into `output`, returning the digest and size of the
/// ciphertext file exactly as it lands on disk.
pub fn encrypt_file(input: &Path, output: &Path, dek: &DataKey) -> Result<(Digest, u64)> {
    let result = encrypt_file_inner(input, output, dek);
    if result.is_err() {
        remove_partial(output);
    }
    result
}

fn encrypt_file_inner(input: &Path, output: &Path, dek: &DataKey) -> Result<(Digest, u64)> {
    let infile = std::fs::File::open(input).map_err(|e| CryptoCliError::io(input, e))?;
    let mut reader = BufReader::new(infile);

    let outfile = std::fs::File::create(output).map_err(|e| CryptoCliError::io(output, e))?;
    let mut writer = HashingWriter::new(BufWriter::new(outfile));

    let rng = SystemRandom::new();
    let mut base_nonce = [0u8; NONCE_LEN];
    rng.fill(&mut base_nonce)
        .map_err(|_| CryptoCliError::RngFailure)?;
    writer
        .write_all(&base_nonce)
        .map_err(|e| CryptoCliError::io(output, e))?;

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, dek.as_bytes())
        .map_err(|_| CryptoCliError::Other("Failed to create AES-256-GCM key".to_string()))?;
    let mut sealing_key = aead::SealingKey::new(unbound, CounterNonce::new(base_nonce));

    let mut frame = vec![0u8; FRAME_LEN];
    let mut index: u64 = 0;
    loop {
        let n = read_full(&mut reader, &mut frame).map_err(|e| CryptoCliError::io(input, e))?;
        if n == 0 {
            break;
        }

        let mut in_out = frame[..n].to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::from(&index.to_be_bytes()), &mut in_out)
            .map_err(|_| CryptoCliError::Other("AES-256-GCM seal failed".to_string()))?;

        writer
            .write_all(&(n as u32).to_be_bytes())
            .and_then(|_| writer.write_all(&in_out))
            .map_err(|e| CryptoCliError::io(output, e))?;
        index += 1;
    }

    // Trailing tag over the empty string, bound to the frame count: a
    // truncated stream cannot present a valid terminator.
    let mut terminator = Vec::new();
    sealing_key
        .seal_in_place_append_tag(Aad::from(&index.to_be_bytes()), &mut terminator)
        .map_err(|_| CryptoCliError::Other("AES-256-GCM seal failed".to_string()))?;
    writer
        .write_all(&terminator)
        .map_err(|e| CryptoCliError::io(output, e))?;

    let (_, digest, size) = writer
        .finalize()
        .map_err(|e| CryptoCliError::io(output, e))?;
    Ok((digest, size))
}

/// Decrypt `input` into `output`, returning the digest and size of the
/// recovered plaintext.
///
/// Any framing or authentication failure is `CorruptCiphertext`; a wrong
/// passphrase never reaches this layer (key unwrap fails first).
pub fn decrypt_file(input: &Path, output: &Path, dek: &DataKey) -> Result<(Digest, u64)> {
    let result = decrypt_file_inner(input, output, dek);
    if result.is_err() {
        remove_partial(output);
    }
    result
}

fn decrypt_file_inner(input: &Path, output: &Path, dek: &DataKey) -> Result<(Digest, u64)> {
    let infile = std::fs::File::open(input).map_err(|e| CryptoCliError::io(input, e))?;
    let total = infile
        .metadata()
        .map_err(|e| CryptoCliError::io(input, e))?
        .len();
    let mut reader = BufReader::new(infile);

    if total < (NONCE_LEN + TAG_LEN) as u64 {
        return Err(CryptoCliError::CorruptCiphertext(
            "stream shorter than nonce and terminator".to_string(),
        ));
    }

    let mut base_nonce = [0u8; NONCE_LEN];
    reader
        .read_exact(&mut base_nonce)
        .map_err(|e| CryptoCliError::io(input, e))?;
    let mut remaining = total - NONCE_LEN as u64;

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, dek.as_bytes())
        .map_err(|_| CryptoCliError::Other("Failed to create AES-256-GCM key".to_string()))?;
    let mut opening_key = aead::OpeningKey::new(unbound, CounterNonce::new(base_nonce));

    let outfile = std::fs::File::create(output).map_err(|e| CryptoCliError::io(output, e))?;
    let mut writer = HashingWriter::new(BufWriter::new(outfile));

    let mut index: u64 = 0;
    while remaining > TAG_LEN as u64 {
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|e| CryptoCliError::io(input, e))?;
        let ct_len = u32::from_be_bytes(len_bytes) as usize;
        if ct_len > FRAME_LEN {
            return Err(CryptoCliError::CorruptCiphertext(format!(
                "frame {} larger than {} bytes",
                index, FRAME_LEN
            )));
        }

        let need = (4 + ct_len + TAG_LEN) as u64;
        if remaining < need + TAG_LEN as u64 {
            return Err(CryptoCliError::CorruptCiphertext(format!(
                "truncated frame {}",
                index
            )));
        }

        let mut in_out = vec![0u8; ct_len + TAG_LEN];
        reader
            .read_exact(&mut in_out)
            .map_err(|e| CryptoCliError::io(input, e))?;

        let plaintext = opening_key
            .open_in_place(Aad::from(&index.to_be_bytes()), &mut in_out)
            .map_err(|_| {
                CryptoCliError::CorruptCiphertext(format!(
                    "authentication failed at frame {}",
                    index
                ))
            })?;
        writer
            .write_all(plaintext)
            .map_err(|e| CryptoCliError::io(output, e))?;

        remaining -= need;
        index += 1;
    }

    if remaining != TAG_LEN as u64 {
        return Err(CryptoCliError::CorruptCiphertext(
            "malformed stream terminator".to_string(),
        ));
    }
    let mut terminator = vec![0u8; TAG_LEN];
    reader
        .read_exact(&mut terminator)
        .map_err(|e| CryptoCliError::io(input, e))?;
    opening_key
        .open_in_place(Aad::from(&index.to_be_bytes()), &mut terminator)
        .map_err(|_| {
            CryptoCliError::CorruptCiphertext("stream terminator authentication failed".to_string())
        })?;

    let (_, digest, size) = writer
        .finalize()
        .map_err(|e| CryptoCliError::io(output, e))?;
    Ok((digest, size))
}

/// Fill `buf` as far as the reader allows; returns bytes read (0 at EOF).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Delete a partially written output file, ignoring absence.
fn remove_partial(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Per-frame nonces: the base nonce combined with a monotone counter.
struct CounterNonce {
    base: [u8; NONCE_LEN],
    counter: u64,
}

impl CounterNonce {
    fn new(base: [u8; NONCE_LEN]) -> Self {
        Self { base, counter: 0 }
    }
}

impl NonceSequence for CounterNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        let mut nonce = self.base;
        for (b, c) in nonce[4..].iter_mut().zip(self.counter.to_be_bytes()) {
            *b ^= c;
        }
        self.counter = self.counter.checked_add(1).ok_or(ring::error::Unspecified)?;
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}
