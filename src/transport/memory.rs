//! In-memory peripheral that records every GATT operation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    Characteristic, GattError, NotificationSink, OP_PUT, Peripheral, RadioState, checksum,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    Subscribe(Characteristic),
    Write(Characteristic, Vec<u8>),
    Read(Characteristic),
    Disconnect,
}

/// Scripted reply: fragments delivered after the given delays, in order.
pub type Reply = Vec<(Duration, Vec<u8>)>;

struct Script {
    ops: Vec<Op>,
    radio: RadioState,
    replies: VecDeque<Reply>,
    connect_failures: VecDeque<GattError>,
    subscribe_failure: Option<GattError>,
    hang_connect: bool,
    checksum: Option<Vec<u8>>,
    received: Vec<u8>,
    sink: Option<NotificationSink>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            radio: RadioState::PoweredOn,
            replies: VecDeque::new(),
            connect_failures: VecDeque::new(),
            subscribe_failure: None,
            hang_connect: false,
            checksum: None,
            received: Vec::new(),
            sink: None,
        }
    }
}

/// Clones share one script, so a test keeps a handle after moving a clone
/// into a transport.
#[derive(Clone, Default)]
pub struct RecordingPeripheral {
    script: Arc<Mutex<Script>>,
}

impl RecordingPeripheral {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.script().ops.clone()
    }

    /// Queues the reply to the next control-point write.
    pub fn queue_reply(&self, reply: Reply) {
        self.script().replies.push_back(reply);
    }

    pub fn fail_connect(&self, error: GattError) {
        self.script().connect_failures.push_back(error);
    }

    pub fn fail_subscribe(&self, error: GattError) {
        self.script().subscribe_failure = Some(error);
    }

    pub fn hang_connect(&self) {
        self.script().hang_connect = true;
    }

    /// Overrides the value read back from the file-write characteristic.
    pub fn set_checksum(&self, value: Vec<u8>) {
        self.script().checksum = Some(value);
    }

    pub fn set_radio(&self, state: RadioState) {
        self.script().radio = state;
    }
}

#[async_trait]
impl Peripheral for RecordingPeripheral {
    async fn radio_state(&self) -> RadioState {
        self.script().radio
    }

    async fn connect(&mut self, _timeout: Duration) -> Result<(), GattError> {
        let hang = {
            let mut s = self.script();
            s.ops.push(Op::Connect);
            if let Some(e) = s.connect_failures.pop_front() {
                return Err(e);
            }
            s.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), GattError> {
        let mut s = self.script();
        s.ops.push(Op::Subscribe(characteristic));
        if let Some(e) = s.subscribe_failure.take() {
            return Err(e);
        }
        s.sink = Some(sink);
        Ok(())
    }

    async fn write_without_response(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), GattError> {
        let mut s = self.script();
        s.ops.push(Op::Write(characteristic, data.to_vec()));

        match characteristic {
            Characteristic::FileWrite => s.received.extend_from_slice(data),
            Characteristic::ControlPoint => {
                if data == [OP_PUT] {
                    s.received.clear();
                }
                if let (Some(reply), Some(sink)) = (s.replies.pop_front(), s.sink.clone()) {
                    tokio::spawn(async move {
                        for (delay, fragment) in reply {
                            tokio::time::sleep(delay).await;
                            sink(&fragment);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, GattError> {
        let mut s = self.script();
        s.ops.push(Op::Read(characteristic));
        Ok(match &s.checksum {
            Some(value) => value.clone(),
            None => checksum(&s.received).to_be_bytes().to_vec(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), GattError> {
        let mut s = self.script();
        s.ops.push(Op::Disconnect);
        s.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_in_order() {
        let mut card = RecordingPeripheral::default();
        card.connect(Duration::from_secs(1)).await.unwrap();
        card.write_without_response(Characteristic::FileWrite, b"abc")
            .await
            .unwrap();
        card.disconnect().await.unwrap();

        assert_eq!(
            card.ops(),
            [
                Op::Connect,
                Op::Write(Characteristic::FileWrite, b"abc".to_vec()),
                Op::Disconnect
            ]
        );
    }

    #[tokio::test]
    async fn default_checksum_covers_received_bytes() {
        let mut card = RecordingPeripheral::default();
        card.write_without_response(Characteristic::ControlPoint, &[OP_PUT])
            .await
            .unwrap();
        card.write_without_response(Characteristic::FileWrite, b"data")
            .await
            .unwrap();

        let crc = card.read(Characteristic::FileWrite).await.unwrap();
        assert_eq!(crc, checksum(b"data").to_be_bytes());
    }
}
