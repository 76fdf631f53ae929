//! Inner stream cipher for protected field values.
//!
//! One [`ProtectedStreamCipher`] covers a whole document: the keystream
//! position carries over from one value to the next, so values must be
//! processed in exactly the order they were produced.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use salsa20::Salsa20;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::KdbxError;

/// Fixed IV used by KeePass for the Salsa20 inner stream.
pub const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerAlgorithm {
    None,
    ArcFour,
    Salsa20,
}

impl InnerAlgorithm {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::ArcFour),
            2 => Some(Self::Salsa20),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::ArcFour => 1,
            Self::Salsa20 => 2,
        }
    }
}

pub struct ProtectedStreamCipher {
    stream: Option<Salsa20>,
}

impl ProtectedStreamCipher {
    /// Starts a session at keystream position zero.
    ///
    /// # Errors
    ///
    /// ArcFour is recognised in headers but not supported here.
    pub fn new(algorithm: InnerAlgorithm, stream_key: &[u8]) -> Result<Self, KdbxError> {
        let stream = match algorithm {
            InnerAlgorithm::None => None,
            InnerAlgorithm::Salsa20 => {
                let key: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(stream_key).into());
                Some(Salsa20::new(&(*key).into(), &SALSA20_NONCE.into()))
            }
            InnerAlgorithm::ArcFour => {
                return Err(KdbxError::UnsupportedValue {
                    field: "InnerRandomStreamID",
                    detail: "ArcFour".into(),
                });
            }
        };
        Ok(Self { stream })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        if let Some(stream) = self.stream.as_mut() {
            stream.apply_keystream(buf);
        }
    }

    pub fn protect(&mut self, plaintext: &str) -> String {
        let mut buf = Zeroizing::new(plaintext.as_bytes().to_vec());
        self.apply(&mut buf);
        STANDARD.encode(buf.as_slice())
    }

    /// Only a base64 failure is reported. A session that is out of step
    /// yields garbage text, decoded lossily.
    pub fn unprotect(&mut self, encoded: &str) -> Result<String, KdbxError> {
        let mut buf = Zeroizing::new(STANDARD.decode(encoded)?);
        self.apply(&mut buf);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
