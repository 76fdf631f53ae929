//! A card that lives in a local directory.
//!
//! `EmulatedCard` speaks the same control-point protocol as the hardware:
//! replies are pushed back as 20-byte notification fragments, PUT data is
//! staged until CLOSE names the file, and the file-write characteristic reads
//! back the CRC-16 of the staged bytes.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    ACK, Characteristic, GattError, NAK, NotificationSink, OP_CLOSE, OP_DELETE, OP_EXISTS, OP_GET,
    OP_PUT, OP_RENAME, Peripheral, RadioState, checksum,
};
use crate::codec::ByteReader;
use crate::storage::Storage;

/// Largest notification payload of a default BLE connection.
pub const FRAGMENT_SIZE: usize = 20;

pub struct EmulatedCard {
    root: PathBuf,
    name: String,
    fragment_gap: Duration,
    connected: bool,
    sink: Option<NotificationSink>,
    staged: Option<Vec<u8>>,
}

impl EmulatedCard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            name: "GateKeeper".to_string(),
            fragment_gap: Duration::from_millis(2),
            connected: false,
            sink: None,
            staged: None,
        }
    }

    /// Delay before each notification fragment.
    pub fn with_fragment_gap(mut self, gap: Duration) -> Self {
        self.fragment_gap = gap;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Display name last set through RENAME.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn storage(&self, path: &str) -> Result<Storage, GattError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(GattError::Other(format!("invalid card path '{path}'")));
        }
        Ok(Storage::new(self.root.join(relative)))
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, GattError> {
        let (opcode, argument) = match parse(frame) {
            Some(parsed) => parsed,
            None => return Ok(Some(vec![NAK])),
        };
        debug!(opcode, argument = argument.as_deref().unwrap_or(""), "card command");

        let reply = match (opcode, argument) {
            (OP_GET, Some(path)) => {
                let storage = self.storage(&path)?;
                if storage.exists() {
                    Some(storage.load().map_err(io_failure)?)
                } else {
                    Some(Vec::new())
                }
            }
            (OP_PUT, None) => {
                self.staged = Some(Vec::new());
                None
            }
            (OP_CLOSE, Some(path)) => {
                if let Some(data) = self.staged.take() {
                    self.storage(&path)?.save(&data).map_err(io_failure)?;
                }
                None
            }
            (OP_DELETE, Some(path)) => {
                self.storage(&path)?.remove().map_err(io_failure)?;
                None
            }
            (OP_RENAME, Some(name)) => {
                self.name = name;
                None
            }
            (OP_EXISTS, Some(path)) => {
                let found = self.storage(&path)?.exists();
                Some(vec![if found { ACK } else { NAK }])
            }
            _ => Some(vec![NAK]),
        };
        Ok(reply)
    }

    fn notify(&self, reply: Vec<u8>) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let gap = self.fragment_gap;
        tokio::spawn(async move {
            for fragment in reply.chunks(FRAGMENT_SIZE) {
                tokio::time::sleep(gap).await;
                sink(fragment);
            }
        });
    }

    fn require_connected(&self) -> Result<(), GattError> {
        if self.connected {
            Ok(())
        } else {
            Err(GattError::NotConnected)
        }
    }
}

/// Splits a control-point frame into opcode and optional argument.
fn parse(frame: &[u8]) -> Option<(u8, Option<String>)> {
    let mut r = ByteReader::new(frame);
    let opcode = r.read_u8().ok()?;
    if r.is_empty() {
        return Some((opcode, None));
    }
    let len = r.read_u8().ok()? as usize;
    let bytes = r.read_bytes(len).ok()?;
    if r.read_u8().ok()? != 0 {
        return None;
    }
    let argument = String::from_utf8(bytes.to_vec()).ok()?;
    Some((opcode, Some(argument)))
}

fn io_failure(e: anyhow::Error) -> GattError {
    GattError::Other(format!("{e:#}"))
}

#[async_trait]
impl Peripheral for EmulatedCard {
    async fn radio_state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    async fn connect(&mut self, _timeout: Duration) -> Result<(), GattError> {
        std::fs::create_dir_all(&self.root).map_err(|e| GattError::Other(e.to_string()))?;
        self.connected = true;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), GattError> {
        self.require_connected()?;
        if characteristic == Characteristic::ControlPoint {
            self.sink = Some(sink);
        }
        Ok(())
    }

    async fn write_without_response(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), GattError> {
        self.require_connected()?;
        match characteristic {
            Characteristic::ControlPoint => {
                if let Some(reply) = self.handle(data)? {
                    self.notify(reply);
                }
                Ok(())
            }
            Characteristic::FileWrite => match self.staged.as_mut() {
                Some(staged) => {
                    staged.extend_from_slice(data);
                    Ok(())
                }
                None => Err(GattError::Other("no write in progress".into())),
            },
        }
    }

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, GattError> {
        self.require_connected()?;
        match characteristic {
            Characteristic::FileWrite => {
                let staged = self.staged.as_deref().unwrap_or_default();
                Ok(checksum(staged).to_be_bytes().to_vec())
            }
            Characteristic::ControlPoint => Ok(Vec::new()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), GattError> {
        self.connected = false;
        self.sink = None;
        self.staged = None;
        Ok(())
    }
}
