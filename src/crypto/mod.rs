//! Cryptographic primitives for KDBX3 containers.
//!
//! Provides the AES key transform, the AES-256-CBC payload cipher and the
//! Salsa20 session that protects individual field values.

pub mod cipher;
pub mod kdf;
pub mod protected;

pub use kdf::{CompositeKey, KdfParams, MIN_TRANSFORM_ROUNDS};
pub use protected::{InnerAlgorithm, ProtectedStreamCipher};

use getrandom::fill;

use crate::error::KdbxError;

/// Length of derived keys and of the master/transform seeds (32 bytes).
pub const KEY_LEN: usize = 32;
/// Length of the CBC initialization vector (16 bytes).
pub const IV_LEN: usize = 16;

/// Fill buffer with cryptographically secure random bytes
fn secure_random(buf: &mut [u8]) -> Result<(), KdbxError> {
    fill(buf).map_err(|_| KdbxError::RandomUnavailable)
}

/// Fresh random array drawn from the OS generator.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], KdbxError> {
    let mut out = [0u8; N];
    secure_random(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_differ_between_draws() {
        let a: [u8; KEY_LEN] = random_bytes().unwrap();
        let b: [u8; KEY_LEN] = random_bytes().unwrap();
        assert_ne!(a, b);
    }
}
