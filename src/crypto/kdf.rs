use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::KEY_LEN;
use crate::error::KdbxError;

/// Lowest transform round count accepted when writing a container.
pub const MIN_TRANSFORM_ROUNDS: u64 = 80_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    transform_rounds: u64,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            transform_rounds: MIN_TRANSFORM_ROUNDS,
        }
    }
}

impl KdfParams {
    /// Parameters for a container about to be written.
    pub fn new(transform_rounds: u64) -> Result<Self, KdbxError> {
        let params = Self { transform_rounds };
        params.validate()?;
        Ok(params)
    }

    /// Parameters read back from an existing container. Older vaults may
    /// carry fewer rounds than the write policy allows.
    pub fn legacy(transform_rounds: u64) -> Self {
        Self { transform_rounds }
    }

    pub fn transform_rounds(&self) -> u64 {
        self.transform_rounds
    }

    pub fn validate(&self) -> Result<(), KdbxError> {
        if self.transform_rounds < MIN_TRANSFORM_ROUNDS {
            return Err(KdbxError::RoundsBelowPolicy {
                rounds: self.transform_rounds,
                minimum: MIN_TRANSFORM_ROUNDS,
            });
        }
        Ok(())
    }
}

/// `SHA256(password)`, the only key component this vault uses.
#[derive(Clone)]
pub struct CompositeKey(Zeroizing<[u8; KEY_LEN]>);

impl CompositeKey {
    pub fn from_password(password: &str) -> Self {
        Self(Zeroizing::new(Sha256::digest(password.as_bytes()).into()))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompositeKey(..)")
    }
}

/// Encrypts `key_material` in place `rounds` times with AES-256 in ECB mode
/// keyed by `seed`.
pub fn stretch(
    seed: &[u8],
    key_material: &[u8; KEY_LEN],
    rounds: u64,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KdbxError> {
    let cipher = Aes256::new_from_slice(seed).map_err(|_| KdbxError::KeyDerivationFailed)?;

    let mut blocks = [
        aes::Block::clone_from_slice(&key_material[..16]),
        aes::Block::clone_from_slice(&key_material[16..]),
    ];
    for _ in 0..rounds {
        cipher.encrypt_blocks(&mut blocks);
    }

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out[..16].copy_from_slice(&blocks[0]);
    out[16..].copy_from_slice(&blocks[1]);
    for block in blocks.iter_mut() {
        block.as_mut_slice().zeroize();
    }
    Ok(out)
}

/// `SHA256(master_seed ++ stretched_key_hash)`.
pub fn derive_master_key(master_seed: &[u8], stretched_key_hash: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(stretched_key_hash);
    Zeroizing::new(hasher.finalize().into())
}

/// Full KDBX3 key schedule from composite key to the payload cipher key.
pub fn master_key(
    composite: &CompositeKey,
    master_seed: &[u8],
    transform_seed: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KdbxError> {
    let hashed: Zeroizing<[u8; KEY_LEN]> =
        Zeroizing::new(Sha256::digest(composite.as_bytes()).into());
    let stretched = stretch(transform_seed, &hashed, kdf.transform_rounds())?;
    let stretched_hash: Zeroizing<[u8; KEY_LEN]> =
        Zeroizing::new(Sha256::digest(stretched.as_slice()).into());
    Ok(derive_master_key(master_seed, stretched_hash.as_slice()))
}
