use std::fmt;

use tokio::sync::mpsc::Sender;

use crate::analog3::A3_DATA_LENGTH;

/// A single CAN frame as seen by the protocol core.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CanMessage {
    id: u32,
    is_extended: bool,
    is_remote: bool,
    data_length: u8,
    data: [u8; A3_DATA_LENGTH],
}

impl CanMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(id: u32, payload: &[u8]) -> Self {
        let mut message = Self::new();
        message.set_id(id);
        message.set_payload(payload);
        message
    }

    pub fn extended(id: u32, payload: &[u8]) -> Self {
        let mut message = Self::standard(id, payload);
        message.set_extended(true);
        message
    }

    pub fn remote(id: u32) -> Self {
        let mut message = Self::new();
        message.set_id(id);
        message.set_remote(true);
        message
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn set_extended(&mut self, is_extended: bool) {
        self.is_extended = is_extended;
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn set_remote(&mut self, is_remote: bool) {
        self.is_remote = is_remote;
    }

    pub fn data_length(&self) -> u8 {
        self.data_length
    }

    pub fn set_data_length(&mut self, length: u8) {
        self.data_length = length.min(A3_DATA_LENGTH as u8);
    }

    /// Byte at `index`, or None when the frame is shorter than that.
    pub fn get_data(&self, index: usize) -> Option<u8> {
        self.payload().get(index).copied()
    }

    pub fn set_data(&mut self, index: usize, value: u8) {
        self.data[index] = value;
    }

    /// Valid bytes of the frame.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_length as usize]
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        let length = payload.len().min(A3_DATA_LENGTH);
        self.data[..length].copy_from_slice(&payload[..length]);
        self.data_length = length as u8;
    }

    pub fn mut_data(&mut self) -> &mut [u8; A3_DATA_LENGTH] {
        &mut self.data
    }
}

impl fmt::Debug for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CanMessage {{ id={:08x}{}{} data=[{}] }}",
            self.id,
            if self.is_extended { " ext" } else { "" },
            if self.is_remote { " rtr" } else { "" },
            hex::encode(self.payload())
        )
    }
}

/// Frame transmission primitives of the bus.
pub trait Transport {
    fn send(&mut self, message: CanMessage);

    /// Sends a zero-payload remote frame on `id`.
    fn send_remote_frame(&mut self, id: u32) {
        self.send(CanMessage::remote(id));
    }

    /// Asks the producer on a wire for the next chunk: an empty data frame
    /// followed by a remote frame.
    fn request_continuation(&mut self, wire_id: u32) {
        self.send(CanMessage::standard(wire_id, &[]));
        self.send_remote_frame(wire_id);
    }
}

/// Transport that hands frames to an async TX task.
pub struct ChannelTransport {
    can_tx: Sender<CanMessage>,
}

impl ChannelTransport {
    pub fn new(can_tx: Sender<CanMessage>) -> Self {
        Self { can_tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, message: CanMessage) {
        log::debug!("Sending message {:?}", message);
        if let Err(e) = self.can_tx.try_send(message) {
            log::error!("Failed to put a TX message to channel: {e:?}");
        }
    }
}

#[cfg(test)]
pub use testing::RecordingTransport;

#[cfg(test)]
mod testing {
    use std::sync::{Arc, Mutex};

    use super::{CanMessage, Transport};

    /// Transport double that keeps every sent frame.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        sent: Arc<Mutex<Vec<CanMessage>>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take(&self) -> Vec<CanMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, message: CanMessage) {
            self.sent.lock().unwrap().push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let mut message = CanMessage::standard(0x700, &[0x03, 0x05, 0x01]);
        assert_eq!(message.id(), 0x700);
        assert!(!message.is_extended());
        assert_eq!(message.data_length(), 3);
        assert_eq!(message.get_data(1), Some(0x05));
        assert_eq!(message.get_data(3), None);
        message.set_data(3, 0xff);
        message.set_data_length(4);
        assert_eq!(message.payload(), &[0x03, 0x05, 0x01, 0xff]);
    }

    #[test]
    fn test_payload_is_capped() {
        let message = CanMessage::extended(0x1acebeef, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(message.is_extended());
        assert_eq!(message.data_length(), 8);
        assert_eq!(format!("{:?}", message), "CanMessage { id=1acebeef ext data=[0102030405060708] }");
    }

    #[test]
    fn test_continuation_sends_both_signals() {
        let mut transport = RecordingTransport::new();
        transport.request_continuation(0x681);
        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id(), 0x681);
        assert!(!sent[0].is_remote());
        assert_eq!(sent[0].data_length(), 0);
        assert!(sent[1].is_remote());
    }
}
