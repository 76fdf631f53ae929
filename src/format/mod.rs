//! KDBX container handling.
//!
//! Version-aware decoding and encoding of vault containers. Only KDBX3 is
//! decoded; any other major version is reported as unsupported so callers
//! can route it elsewhere.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::codec::ByteReader;
use crate::crypto::{CompositeKey, ProtectedStreamCipher, kdf};
use crate::error::KdbxError;
use crate::tree::VaultTree;

pub mod header;
pub mod payload;
pub mod xml;

pub use header::{Compression, Header};

/// Parses a container, decrypts it and unprotects every protected value.
///
/// # Errors
///
/// Returns an error if:
/// - The signature is not KDBX or the major version is not 3
/// - A header field is unknown, unsupported or missing
/// - The password is wrong (`AuthenticationFailed`)
/// - A payload block or the stored header hash does not verify
///   (`CorruptedPayload`)
pub fn decode(data: &[u8], key: &CompositeKey) -> Result<(Header, VaultTree), KdbxError> {
    let mut r = ByteReader::new(data);
    let (major, minor) = header::read_signature(&mut r)?;

    match major {
        header::VERSION_MAJOR => decode_v3(data, key),
        _ => Err(KdbxError::UnsupportedVersion { major, minor }),
    }
}

fn decode_v3(data: &[u8], key: &CompositeKey) -> Result<(Header, VaultTree), KdbxError> {
    let (header, offset) = Header::from_bytes(data)?;
    let header_hash = STANDARD.encode(Sha256::digest(&data[..offset]));

    let master = kdf::master_key(
        key,
        header.master_seed(),
        header.transform_seed(),
        header.kdf(),
    )?;
    let document = payload::decrypt(&header, master.as_slice(), &data[offset..])?;

    let mut session =
        ProtectedStreamCipher::new(header.inner_algorithm(), header.protected_stream_key())?;
    let tree = xml::read(&document, |v| session.unprotect(v))?;

    if let Some(stored) = tree.meta.header_hash.as_deref() {
        if !stored.is_empty() && stored != header_hash {
            return Err(KdbxError::CorruptedPayload("header hash mismatch".into()));
        }
    }

    Ok((header, tree))
}

/// Serializes `tree` into a KDBX3 container.
///
/// The header's random fields are regenerated first, so two calls never
/// share seeds, IV, stream key or stream start bytes.
///
/// # Errors
///
/// Returns `RoundsBelowPolicy` if the header carries fewer transform rounds
/// than new containers require.
pub fn encode(
    tree: &VaultTree,
    header: &mut Header,
    key: &CompositeKey,
) -> Result<Vec<u8>, KdbxError> {
    header.kdf().validate()?;
    header.regenerate()?;

    let mut out = header.to_bytes()?;

    let mut tree = tree.clone();
    tree.meta.header_hash = Some(STANDARD.encode(Sha256::digest(&out)));

    let mut session =
        ProtectedStreamCipher::new(header.inner_algorithm(), header.protected_stream_key())?;
    let tree = tree.map_protected(|v| Ok(session.protect(v)))?;
    let document = Zeroizing::new(xml::write(&tree)?);

    let master = kdf::master_key(
        key,
        header.master_seed(),
        header.transform_seed(),
        header.kdf(),
    )?;
    out.extend_from_slice(&payload::encrypt(header, master.as_slice(), &document)?);
    Ok(out)
}
