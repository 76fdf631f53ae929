use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Failures of the little-endian byte primitives.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput { needed: usize, available: usize },
    #[error("sink rejected write: {0}")]
    SinkError(#[source] io::Error),
}

/// Errors raised while reading or writing a KDBX3 container.
#[derive(Debug, Error)]
pub enum KdbxError {
    #[error("not a KDBX3 container")]
    NotAKdbx3Container,
    #[error("unsupported KDBX version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unknown header field type {0}")]
    UnknownFieldType(u8),
    #[error("unsupported value for {field}: {detail}")]
    UnsupportedValue { field: &'static str, detail: String },
    #[error("header field {0} is missing")]
    MissingField(&'static str),
    #[error("invalid password")]
    AuthenticationFailed,
    #[error("corrupted payload: {0}")]
    CorruptedPayload(String),
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("transform rounds {rounds} below the minimum of {minimum}")]
    RoundsBelowPolicy { rounds: u64, minimum: u64 },
    #[error("protected value is not valid base64")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("malformed vault document: {0}")]
    MalformedDocument(String),
    #[error("OS random generator unavailable")]
    RandomUnavailable,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl KdbxError {
    /// Format errors are never retried and tell the caller to try another
    /// container handler.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            KdbxError::NotAKdbx3Container
                | KdbxError::UnsupportedVersion { .. }
                | KdbxError::UnknownFieldType(_)
                | KdbxError::UnsupportedValue { .. }
                | KdbxError::MissingField(_)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("entry '{0}' not found")]
    EntryNotFound(Uuid),
    #[error("group '{0}' not found")]
    GroupNotFound(Uuid),
}

/// Errors surfaced by the card transport.
#[derive(Debug, Error)]
pub enum CardError {
    #[error("argument '{value}' exceeds {limit} bytes")]
    ArgumentInvalid { value: String, limit: usize },
    #[error("Bluetooth is not enabled")]
    BluetoothNotPoweredOn,
    #[error("card is not paired")]
    CardNotPaired,
    #[error("characteristic read failed: {0}")]
    CharacteristicReadFailure(String),
    #[error("characteristic write failed: {0}")]
    CharacteristicWriteFailure(String),
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("file '{0}' not found on card")]
    FileNotFound(String),
    #[error("checksum mismatch (expected {expected:04X}, card reported {reported})")]
    InvalidChecksum { expected: u16, reported: String },
    #[error("card response did not settle before the deadline")]
    ResponseTimedOut,
    #[error("card is not connected")]
    NotConnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Vault(#[from] KdbxError),
    #[error(transparent)]
    Card(#[from] CardError),
    #[error("no database found on card")]
    DatabaseNotFound,
    #[error("sync worker has stopped")]
    WorkerStopped,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("password length {length} is outside {min}..={max}")]
    LengthOutOfRange {
        length: usize,
        min: usize,
        max: usize,
    },
    #[error("no character classes selected")]
    NoCharacterClasses,
    #[error("OS random generator unavailable")]
    RandomUnavailable,
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secure storage unavailable: {0}")]
    Unavailable(String),
}
