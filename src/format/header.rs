//! KDBX3 outer header.
//!
//! ```text
//! MAGIC (8) | MINOR (u16) | MAJOR (u16) | { TYPE (u8) | LEN (u16) | VALUE } ... | END
//! ```

use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::{IV_LEN, InnerAlgorithm, KEY_LEN, KdfParams, random_bytes};
use crate::error::KdbxError;

pub const MAGIC: [u8; 8] = [0x03, 0xD9, 0xA2, 0x9A, 0x67, 0xFB, 0x4B, 0xB5];
pub const VERSION_MAJOR: u16 = 3;
pub const VERSION_MINOR: u16 = 1;

/// AES-256 cipher UUID `31C1F2E6-BF71-4350-BE58-05216AFC5AFF`.
pub const AES_CIPHER_ID: [u8; 16] = [
    0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A, 0xFF,
];

const END_OF_HEADER: [u8; 4] = *b"\r\n\r\n";

mod field {
    pub const END: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION_FLAGS: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const PROTECTED_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
    pub const INNER_RANDOM_STREAM_ID: u8 = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    version_minor: u16,
    compression: Compression,
    master_seed: [u8; KEY_LEN],
    transform_seed: [u8; KEY_LEN],
    kdf: KdfParams,
    encryption_iv: [u8; IV_LEN],
    protected_stream_key: [u8; KEY_LEN],
    stream_start_bytes: [u8; KEY_LEN],
    inner_algorithm: InnerAlgorithm,
    comment: Option<Vec<u8>>,
}

impl Header {
    /// Header for a new vault with every random field freshly drawn.
    pub fn new(kdf: KdfParams, compression: Compression) -> Result<Self, KdbxError> {
        kdf.validate()?;
        let mut header = Self {
            version_minor: VERSION_MINOR,
            compression,
            master_seed: [0; KEY_LEN],
            transform_seed: [0; KEY_LEN],
            kdf,
            encryption_iv: [0; IV_LEN],
            protected_stream_key: [0; KEY_LEN],
            stream_start_bytes: [0; KEY_LEN],
            inner_algorithm: InnerAlgorithm::Salsa20,
            comment: None,
        };
        header.regenerate()?;
        Ok(header)
    }

    /// Redraws the master seed, transform seed, IV, protected stream key
    /// and stream start bytes. Must run before every encryption.
    pub fn regenerate(&mut self) -> Result<(), KdbxError> {
        self.master_seed = random_bytes()?;
        self.transform_seed = random_bytes()?;
        self.encryption_iv = random_bytes()?;
        self.protected_stream_key = random_bytes()?;
        self.stream_start_bytes = random_bytes()?;
        self.version_minor = VERSION_MINOR;
        Ok(())
    }

    pub fn version_minor(&self) -> u16 {
        self.version_minor
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    pub fn set_kdf(&mut self, kdf: KdfParams) {
        self.kdf = kdf;
    }

    pub fn master_seed(&self) -> &[u8; KEY_LEN] {
        &self.master_seed
    }

    pub fn transform_seed(&self) -> &[u8; KEY_LEN] {
        &self.transform_seed
    }

    pub fn encryption_iv(&self) -> &[u8; IV_LEN] {
        &self.encryption_iv
    }

    pub fn protected_stream_key(&self) -> &[u8; KEY_LEN] {
        &self.protected_stream_key
    }

    pub fn stream_start_bytes(&self) -> &[u8; KEY_LEN] {
        &self.stream_start_bytes
    }

    pub fn inner_algorithm(&self) -> InnerAlgorithm {
        self.inner_algorithm
    }

    pub fn comment(&self) -> Option<&[u8]> {
        self.comment.as_deref()
    }

    /// Serializes the header in canonical field order.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KdbxError> {
        let mut w = ByteWriter::new(Vec::with_capacity(256));

        w.write_bytes(&MAGIC)?;
        w.write_u16(VERSION_MINOR)?;
        w.write_u16(VERSION_MAJOR)?;

        write_field(&mut w, field::CIPHER_ID, &AES_CIPHER_ID)?;
        write_field(
            &mut w,
            field::COMPRESSION_FLAGS,
            &self.compression.as_u32().to_le_bytes(),
        )?;
        write_field(&mut w, field::MASTER_SEED, &self.master_seed)?;
        write_field(&mut w, field::TRANSFORM_SEED, &self.transform_seed)?;
        write_field(
            &mut w,
            field::TRANSFORM_ROUNDS,
            &self.kdf.transform_rounds().to_le_bytes(),
        )?;
        write_field(&mut w, field::ENCRYPTION_IV, &self.encryption_iv)?;
        write_field(&mut w, field::PROTECTED_STREAM_KEY, &self.protected_stream_key)?;
        write_field(&mut w, field::STREAM_START_BYTES, &self.stream_start_bytes)?;
        write_field(
            &mut w,
            field::INNER_RANDOM_STREAM_ID,
            &self.inner_algorithm.as_u32().to_le_bytes(),
        )?;
        if let Some(comment) = &self.comment {
            write_field(&mut w, field::COMMENT, comment)?;
        }
        write_field(&mut w, field::END, &END_OF_HEADER)?;

        Ok(w.into_inner())
    }

    /// Parses a header and returns it together with its length in bytes.
    ///
    /// # Errors
    ///
    /// The signature and version are checked before any field, so a caller
    /// can fall back to another handler on `NotAKdbx3Container` or
    /// `UnsupportedVersion`.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), KdbxError> {
        let mut r = ByteReader::new(data);
        let (major, minor) = read_signature(&mut r)?;
        if major != VERSION_MAJOR {
            return Err(KdbxError::UnsupportedVersion { major, minor });
        }

        let mut cipher_seen = false;
        let mut compression = Compression::None;
        let mut master_seed = None;
        let mut transform_seed = None;
        let mut rounds = None;
        let mut encryption_iv = None;
        let mut protected_stream_key = None;
        let mut stream_start_bytes = None;
        let mut inner_algorithm = InnerAlgorithm::None;
        let mut comment = None;

        loop {
            let field_type = r.read_u8()?;
            let len = r.read_u16()? as usize;
            let value = r.read_bytes(len)?;

            match field_type {
                field::END => break,
                field::COMMENT => comment = Some(value.to_vec()),
                field::CIPHER_ID => {
                    if value != AES_CIPHER_ID {
                        return Err(KdbxError::UnsupportedValue {
                            field: "CipherID",
                            detail: hex(value),
                        });
                    }
                    cipher_seen = true;
                }
                field::COMPRESSION_FLAGS => {
                    let raw = u32::from_le_bytes(fixed("CompressionFlags", value)?);
                    compression =
                        Compression::from_u32(raw).ok_or(KdbxError::UnsupportedValue {
                            field: "CompressionFlags",
                            detail: raw.to_string(),
                        })?;
                }
                field::MASTER_SEED => master_seed = Some(fixed("MasterSeed", value)?),
                field::TRANSFORM_SEED => transform_seed = Some(fixed("TransformSeed", value)?),
                field::TRANSFORM_ROUNDS => {
                    rounds = Some(u64::from_le_bytes(fixed("TransformRounds", value)?))
                }
                field::ENCRYPTION_IV => encryption_iv = Some(fixed("EncryptionIV", value)?),
                field::PROTECTED_STREAM_KEY => {
                    protected_stream_key = Some(fixed("ProtectedStreamKey", value)?)
                }
                field::STREAM_START_BYTES => {
                    stream_start_bytes = Some(fixed("StreamStartBytes", value)?)
                }
                field::INNER_RANDOM_STREAM_ID => {
                    let raw = u32::from_le_bytes(fixed("InnerRandomStreamID", value)?);
                    inner_algorithm =
                        InnerAlgorithm::from_u32(raw).ok_or(KdbxError::UnsupportedValue {
                            field: "InnerRandomStreamID",
                            detail: raw.to_string(),
                        })?;
                }
                other => return Err(KdbxError::UnknownFieldType(other)),
            }
        }

        if !cipher_seen {
            return Err(KdbxError::MissingField("CipherID"));
        }

        let header = Header {
            version_minor: minor,
            compression,
            master_seed: master_seed.ok_or(KdbxError::MissingField("MasterSeed"))?,
            transform_seed: transform_seed.ok_or(KdbxError::MissingField("TransformSeed"))?,
            kdf: KdfParams::legacy(rounds.ok_or(KdbxError::MissingField("TransformRounds"))?),
            encryption_iv: encryption_iv.ok_or(KdbxError::MissingField("EncryptionIV"))?,
            protected_stream_key: protected_stream_key
                .ok_or(KdbxError::MissingField("ProtectedStreamKey"))?,
            stream_start_bytes: stream_start_bytes
                .ok_or(KdbxError::MissingField("StreamStartBytes"))?,
            inner_algorithm,
            comment,
        };

        Ok((header, r.position()))
    }
}

/// Checks the magic bytes and returns `(major, minor)`.
pub fn read_signature(r: &mut ByteReader<'_>) -> Result<(u16, u16), KdbxError> {
    let magic = r
        .read_array::<8>()
        .map_err(|_| KdbxError::NotAKdbx3Container)?;
    if magic != MAGIC {
        return Err(KdbxError::NotAKdbx3Container);
    }
    let minor = r.read_u16()?;
    let major = r.read_u16()?;
    Ok((major, minor))
}

fn write_field(w: &mut ByteWriter<Vec<u8>>, field_type: u8, value: &[u8]) -> Result<(), KdbxError> {
    let len = u16::try_from(value.len()).map_err(|_| KdbxError::UnsupportedValue {
        field: "header field",
        detail: format!("{} bytes", value.len()),
    })?;
    w.write_u8(field_type)?;
    w.write_u16(len)?;
    w.write_bytes(value)?;
    Ok(())
}

fn fixed<const N: usize>(field: &'static str, value: &[u8]) -> Result<[u8; N], KdbxError> {
    value.try_into().map_err(|_| KdbxError::UnsupportedValue {
        field,
        detail: format!("expected {N} bytes, got {}", value.len()),
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
