//! Command/response transport to a GateKeeper-style Bluetooth card.
//!
//! Commands are written without response to the control-point
//! characteristic as `[opcode][len][path][0x00]`. Replies come back as
//! notification fragments with no length marker, so a reply is complete once
//! a full `quiescence_interval` passes without the buffer growing. Bulk data
//! goes to the file-write characteristic in small chunks and is verified
//! afterwards with a CRC-16 read back from the same characteristic.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use crc::{CRC_16_ARC, Crc};
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::ByteWriter;
use crate::error::CardError;

pub mod emulator;
#[cfg(test)]
pub(crate) mod memory;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x423AD87A_B100_4F14_9EAA_5EB5839F2A54);
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x423AD87A_0001_4F14_9EAA_5EB5839F2A54);
pub const FILE_WRITE_UUID: Uuid = Uuid::from_u128(0x423AD87A_0002_4F14_9EAA_5EB5839F2A54);

pub const OP_GET: u8 = 2;
pub const OP_PUT: u8 = 3;
pub const OP_CLOSE: u8 = 4;
pub const OP_DELETE: u8 = 7;
pub const OP_RENAME: u8 = 8;
pub const OP_EXISTS: u8 = 10;

/// Positive acknowledgement byte.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement byte.
pub const NAK: u8 = 0x15;

pub const MAX_PATH_LEN: usize = 30;
pub const MAX_NAME_LEN: usize = 11;
pub const MAX_CHUNK_SIZE: usize = 128;

pub(crate) const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC-16/ARC as computed by the card firmware.
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    ControlPoint,
    FileWrite,
}

impl Characteristic {
    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::ControlPoint => CONTROL_POINT_UUID,
            Characteristic::FileWrite => FILE_WRITE_UUID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

/// Errors reported by a GATT peripheral implementation.
#[derive(Debug, Error)]
pub enum GattError {
    #[error("operation timed out")]
    Timeout,
    #[error("insufficient encryption")]
    InsufficientEncryption,
    #[error("peripheral is not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

/// Receives every notification fragment of a subscribed characteristic.
pub type NotificationSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// GATT access to a single card.
#[async_trait]
pub trait Peripheral: Send + Sync {
    async fn radio_state(&self) -> RadioState;

    async fn connect(&mut self, timeout: Duration) -> Result<(), GattError>;

    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), GattError>;

    async fn write_without_response(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), GattError>;

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, GattError>;

    async fn disconnect(&mut self) -> Result<(), GattError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Busy,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Timing and chunking parameters of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub quiescence_interval: Duration,
    pub response_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            quiescence_interval: Duration::from_secs(2),
            response_timeout: Duration::from_secs(30),
            chunk_size: MAX_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(5),
        }
    }
}

/// One logical connection to a card.
///
/// Every command takes `&mut self`, so a transport can never have two
/// commands in flight.
pub struct CardTransport<P> {
    peripheral: P,
    settings: TransportSettings,
    state: State,
    response: Arc<Mutex<Vec<u8>>>,
}

impl<P: Peripheral> CardTransport<P> {
    pub fn new(peripheral: P, mut settings: TransportSettings) -> Self {
        settings.chunk_size = settings.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        Self {
            peripheral,
            settings,
            state: State::Disconnected,
            response: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Fails with `BluetoothNotPoweredOn` unless the radio is usable.
    pub async fn ensure_powered_on(&self) -> Result<(), CardError> {
        match self.peripheral.radio_state().await {
            RadioState::PoweredOn => Ok(()),
            other => {
                debug!(state = ?other, "radio not available");
                Err(CardError::BluetoothNotPoweredOn)
            }
        }
    }

    /// Connects and enables notifications on the control point.
    ///
    /// # Errors
    ///
    /// `ConnectionTimedOut` if the card does not answer within
    /// `connect_timeout`, `CardNotPaired` if notifications require a bond
    /// the host does not have.
    pub async fn connect(&mut self) -> Result<(), CardError> {
        if self.state != State::Disconnected {
            return Ok(());
        }

        self.state = State::Connecting;
        debug!(timeout = ?self.settings.connect_timeout, "connecting to card");

        let timeout = self.settings.connect_timeout;
        let connected = match time::timeout(timeout, self.peripheral.connect(timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(GattError::Timeout)) | Err(_) => Err(CardError::ConnectionTimedOut),
            Ok(Err(e)) => Err(CardError::ConnectionFailed(e.to_string())),
        };
        if let Err(e) = connected {
            self.state = State::Disconnected;
            return Err(e);
        }

        let buffer = Arc::clone(&self.response);
        let sink: NotificationSink = Arc::new(move |fragment: &[u8]| {
            buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(fragment);
        });

        if let Err(e) = self
            .peripheral
            .subscribe(Characteristic::ControlPoint, sink)
            .await
        {
            if let Err(d) = self.peripheral.disconnect().await {
                warn!(error = %d, "disconnect after failed subscribe");
            }
            self.state = State::Disconnected;
            return Err(match e {
                GattError::InsufficientEncryption => CardError::CardNotPaired,
                other => CardError::ConnectionFailed(other.to_string()),
            });
        }

        self.state = State::Connected;
        debug!("connected");
        Ok(())
    }

    /// Drops the connection. Safe in any state.
    pub async fn disconnect(&mut self) -> Result<(), CardError> {
        debug!(state = %self.state, "disconnecting");
        self.state = State::Disconnected;
        self.take_response();
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| CardError::DisconnectFailed(e.to_string()))
    }

    /// Reads a file. An empty reply means the file does not exist.
    pub async fn get(&mut self, path: &str) -> Result<Vec<u8>, CardError> {
        let data = self.command(OP_GET, Some(path), MAX_PATH_LEN, true).await?;
        if data.is_empty() {
            return Err(CardError::FileNotFound(path.to_string()));
        }
        Ok(data)
    }

    /// Opens a write and streams `data` to the file-write characteristic.
    ///
    /// The file is named by the `close` that follows.
    pub async fn put(&mut self, data: &[u8]) -> Result<(), CardError> {
        self.command(OP_PUT, None, MAX_PATH_LEN, false).await?;

        self.state = State::Busy;
        let result = self.file_write(data).await;
        self.state = State::Connected;
        result
    }

    /// Commits the pending write under `path`.
    pub async fn close(&mut self, path: &str) -> Result<(), CardError> {
        self.command(OP_CLOSE, Some(path), MAX_PATH_LEN, false)
            .await
            .map(drop)
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), CardError> {
        self.command(OP_DELETE, Some(path), MAX_PATH_LEN, false)
            .await
            .map(drop)
    }

    /// Sets the card's advertised display name.
    pub async fn rename(&mut self, name: &str) -> Result<(), CardError> {
        self.command(OP_RENAME, Some(name), MAX_NAME_LEN, false)
            .await
            .map(drop)
    }

    /// True only for a reply that is exactly one `ACK` byte.
    pub async fn exists(&mut self, path: &str) -> Result<bool, CardError> {
        let reply = self.command(OP_EXISTS, Some(path), MAX_PATH_LEN, true).await?;
        Ok(reply.as_slice() == [ACK])
    }

    /// Compares the CRC-16 of `data` against the one the card computed over
    /// the bytes it received.
    pub async fn verify_checksum(&mut self, data: &[u8]) -> Result<(), CardError> {
        self.require_connected()?;
        let expected = checksum(data);

        self.state = State::Busy;
        let reported = self.peripheral.read(Characteristic::FileWrite).await;
        self.state = State::Connected;

        let reported = reported.map_err(|e| CardError::CharacteristicReadFailure(e.to_string()))?;
        debug!(expected = %format!("{expected:04X}"), reported = %hex(&reported), "checksum");

        match <[u8; 2]>::try_from(reported.as_slice()) {
            Ok(bytes) if u16::from_be_bytes(bytes) == expected => Ok(()),
            _ => Err(CardError::InvalidChecksum {
                expected,
                reported: hex(&reported),
            }),
        }
    }

    async fn command(
        &mut self,
        opcode: u8,
        argument: Option<&str>,
        limit: usize,
        await_reply: bool,
    ) -> Result<Vec<u8>, CardError> {
        if let Some(arg) = argument {
            if arg.len() > limit {
                return Err(CardError::ArgumentInvalid {
                    value: arg.to_string(),
                    limit,
                });
            }
        }
        self.require_connected()?;

        let frame = frame(opcode, argument)?;
        self.state = State::Busy;
        self.take_response();

        let result = self.exchange(&frame, await_reply).await;
        self.state = State::Connected;
        result
    }

    async fn exchange(&mut self, frame: &[u8], await_reply: bool) -> Result<Vec<u8>, CardError> {
        debug!(frame = %hex(frame), "control point <-");
        self.peripheral
            .write_without_response(Characteristic::ControlPoint, frame)
            .await
            .map_err(|e| CardError::CharacteristicWriteFailure(e.to_string()))?;

        if !await_reply {
            return Ok(Vec::new());
        }
        let reply = self.await_reply().await?;
        debug!(len = reply.len(), "control point ->");
        Ok(reply)
    }

    async fn await_reply(&self) -> Result<Vec<u8>, CardError> {
        let interval = self.settings.quiescence_interval;
        let started = Instant::now();
        let deadline = started + self.settings.response_timeout;
        let mut ticks = time::interval_at(started + interval, interval);
        let mut seen = 0usize;

        loop {
            ticks.tick().await;
            let len = self.buffered();
            if len == seen {
                return Ok(self.take_response());
            }
            seen = len;
            if Instant::now() >= deadline {
                self.take_response();
                return Err(CardError::ResponseTimedOut);
            }
        }
    }

    async fn file_write(&mut self, data: &[u8]) -> Result<(), CardError> {
        let total = data.len().div_ceil(self.settings.chunk_size);
        for (i, chunk) in data.chunks(self.settings.chunk_size).enumerate() {
            debug!(chunk = i + 1, total, len = chunk.len(), "file write <-");
            self.peripheral
                .write_without_response(Characteristic::FileWrite, chunk)
                .await
                .map_err(|e| CardError::CharacteristicWriteFailure(e.to_string()))?;
            if i + 1 < total {
                time::sleep(self.settings.chunk_delay).await;
            }
        }
        Ok(())
    }

    fn require_connected(&self) -> Result<(), CardError> {
        match self.state {
            State::Connected => Ok(()),
            _ => Err(CardError::NotConnected),
        }
    }

    fn buffered(&self) -> usize {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take_response(&self) -> Vec<u8> {
        std::mem::take(&mut *self.response.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Encodes a control-point command.
pub fn frame(opcode: u8, argument: Option<&str>) -> Result<Vec<u8>, CardError> {
    let mut w = ByteWriter::new(Vec::new());
    w.write_u8(opcode)?;
    if let Some(arg) = argument {
        w.write_u8(arg.len() as u8)?;
        w.write_bytes(arg.as_bytes())?;
        w.write_u8(0)?;
    }
    Ok(w.into_inner())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
