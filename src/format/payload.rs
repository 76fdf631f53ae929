//! Encrypted KDBX3 payload.
//!
//! Plaintext layout after AES-256-CBC decryption:
//! ```text
//! STREAM_START (32) | { INDEX (u32) | SHA256 (32) | SIZE (u32) | DATA } ... | INDEX | 0 x 32 | 0
//! ```

use std::io::{Read, Write};

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::header::{Compression, Header};
use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::cipher;
use crate::error::KdbxError;

/// Largest data run stored in a single hashed block.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const HASH_LEN: usize = 32;

/// Decrypts the bytes after the header and returns the document bytes.
///
/// # Errors
///
/// Returns `AuthenticationFailed` for a wrong key (bad padding or stream
/// start mismatch) and `CorruptedPayload` for damaged blocks.
pub fn decrypt(
    header: &Header,
    master_key: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KdbxError> {
    let plaintext = cipher::decrypt(master_key, header.encryption_iv(), ciphertext)?;

    let mut r = ByteReader::new(&plaintext);
    let start = r
        .read_bytes(header.stream_start_bytes().len())
        .map_err(|_| KdbxError::AuthenticationFailed)?;
    if start != &header.stream_start_bytes()[..] {
        return Err(KdbxError::AuthenticationFailed);
    }

    let joined = read_blocks(&mut r)?;

    match header.compression() {
        Compression::None => Ok(joined),
        Compression::Gzip => gunzip(&joined),
    }
}

/// Compresses, chains and encrypts `document` using the header's current
/// seeds. The caller is responsible for regenerating them beforehand.
pub fn encrypt(header: &Header, master_key: &[u8], document: &[u8]) -> Result<Vec<u8>, KdbxError> {
    let body = match header.compression() {
        Compression::None => Zeroizing::new(document.to_vec()),
        Compression::Gzip => gzip(document)?,
    };

    let mut plaintext = Zeroizing::new(Vec::with_capacity(body.len() + 128));
    let mut w = ByteWriter::new(&mut *plaintext);
    w.write_bytes(header.stream_start_bytes())?;
    write_blocks(&mut w, &body)?;

    cipher::encrypt(master_key, header.encryption_iv(), &plaintext)
}

fn read_blocks(r: &mut ByteReader<'_>) -> Result<Zeroizing<Vec<u8>>, KdbxError> {
    let mut out = Zeroizing::new(Vec::new());
    let mut expected_index = 0u32;

    loop {
        let index = r.read_u32().map_err(truncated)?;
        let hash: [u8; HASH_LEN] = r.read_array().map_err(truncated)?;
        let size = r.read_u32().map_err(truncated)? as usize;

        if index != expected_index {
            return Err(KdbxError::CorruptedPayload(format!(
                "block index {index}, expected {expected_index}"
            )));
        }

        if size == 0 {
            if hash != [0u8; HASH_LEN] {
                return Err(KdbxError::CorruptedPayload(
                    "terminator block carries a hash".into(),
                ));
            }
            return Ok(out);
        }

        let data = r.read_bytes(size).map_err(truncated)?;
        if Sha256::digest(data)[..] != hash[..] {
            return Err(KdbxError::CorruptedPayload(format!(
                "hash mismatch in block {index}"
            )));
        }
        out.extend_from_slice(data);
        expected_index += 1;
    }
}

fn write_blocks<W: Write>(w: &mut ByteWriter<W>, body: &[u8]) -> Result<(), KdbxError> {
    let mut index = 0u32;
    for chunk in body.chunks(MAX_BLOCK_SIZE) {
        w.write_u32(index)?;
        w.write_bytes(&Sha256::digest(chunk))?;
        w.write_u32(chunk.len() as u32)?;
        w.write_bytes(chunk)?;
        index += 1;
    }
    w.write_u32(index)?;
    w.write_bytes(&[0u8; HASH_LEN])?;
    w.write_u32(0)?;
    Ok(())
}

fn truncated(e: crate::error::CodecError) -> KdbxError {
    KdbxError::CorruptedPayload(e.to_string())
}

fn gzip(data: &[u8]) -> Result<Zeroizing<Vec<u8>>, KdbxError> {
    let failed = |e: std::io::Error| KdbxError::CorruptedPayload(format!("compression failed: {e}"));
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(data).map_err(failed)?;
    encoder.finish().map(Zeroizing::new).map_err(failed)
}

fn gunzip(data: &[u8]) -> Result<Zeroizing<Vec<u8>>, KdbxError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Zeroizing::new(Vec::new());
    decoder
        .read_to_end(&mut out)
        .map_err(|e| KdbxError::CorruptedPayload(format!("decompression failed: {e}")))?;
    Ok(out)
}
