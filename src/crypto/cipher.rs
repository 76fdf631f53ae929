use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use zeroize::Zeroizing;

use crate::error::KdbxError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK_LEN: usize = 16;

/// AES-256-CBC with PKCS7 padding.
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, KdbxError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| KdbxError::UnsupportedValue {
        field: "EncryptionIV",
        detail: format!("{} bytes", iv.len()),
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Inverse of [`encrypt`].
///
/// # Errors
///
/// A ciphertext that is not a positive multiple of the block size is
/// `CorruptedPayload`. Bad padding is `AuthenticationFailed`, which is what a
/// wrong master key produces.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, KdbxError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(KdbxError::CorruptedPayload(format!(
            "ciphertext length {} is not a multiple of {BLOCK_LEN}",
            ciphertext.len()
        )));
    }

    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| KdbxError::UnsupportedValue {
        field: "EncryptionIV",
        detail: format!("{} bytes", iv.len()),
    })?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| KdbxError::AuthenticationFailed)
}
