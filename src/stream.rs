//! Property streaming over an admin wire.
//!
//! One session exists per module. A request from Mission Control names a wire
//! (`0x680 + index`); the module answers with a status byte on that wire and,
//! when ready, moves property data across as many 8-byte frames as it takes.
//!
//! Each property travels as `[id][length][value...]`. Config dumps and config
//! modifications carry a leading property count; a name read does not.

use std::cmp::min;

use crate::a3_message;
use crate::analog3::{
    A3_DATA_LENGTH, A3_ID_ADMIN_WIRES_BASE, A3_MAX_CONFIG_DATA_LENGTH, PropertyId, StreamStatus,
};
use crate::can_controller::{CanMessage, Transport};
use crate::registry::Registry;
use crate::scheduler::{Tick, is_due};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    ReadName,
    ReadConfig,
    WriteConfig,
}

/// Result of an idle check on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
    /// No session is open.
    Inactive,
    /// The session was open past its deadline and has been terminated.
    Expired,
    /// Still active; expires at the given tick unless traffic arrives.
    ActiveUntil(Tick),
}

// Read encoder ////////////////////////////////////////////////////////////////

/// Serializes table entries, resuming mid-property between chunks.
#[derive(Debug, Default)]
struct ReadEncoder {
    /// Table position of the property being sent.
    property_cursor: usize,
    /// Bytes of the current property already emitted.
    byte_cursor: usize,
    remaining_properties: u8,
    header_sent: bool,
    /// `[id][length][value]` of the current property, captured when it starts.
    current: Vec<u8>,
}

impl ReadEncoder {
    fn for_config(registry: &Registry) -> Self {
        Self {
            remaining_properties: registry.len() as u8,
            ..Default::default()
        }
    }

    fn for_single(position: usize) -> Self {
        Self {
            property_cursor: position,
            remaining_properties: 1,
            header_sent: true,
            ..Default::default()
        }
    }

    fn is_done(&self) -> bool {
        self.header_sent && self.remaining_properties == 0
    }

    /// Fills `out` with the next piece of the stream and returns the number of
    /// bytes written.
    fn fill(&mut self, registry: &Registry, out: &mut [u8]) -> usize {
        let mut index = 0;
        if !self.header_sent {
            if out.is_empty() {
                return 0;
            }
            out[index] = self.remaining_properties;
            index += 1;
            self.header_sent = true;
        }
        while index < out.len() && self.remaining_properties > 0 {
            if self.byte_cursor == 0 {
                self.current = encode_property(registry, self.property_cursor);
            }
            let to_send = min(out.len() - index, self.current.len() - self.byte_cursor);
            out[index..index + to_send]
                .copy_from_slice(&self.current[self.byte_cursor..self.byte_cursor + to_send]);
            index += to_send;
            self.byte_cursor += to_send;
            if self.byte_cursor == self.current.len() {
                self.byte_cursor = 0;
                self.property_cursor += 1;
                self.remaining_properties -= 1;
            }
        }
        index
    }
}

/// `[id][length][value]` of the property at a table position.
fn encode_property(registry: &Registry, position: usize) -> Vec<u8> {
    let Some(def) = registry.def_at(position) else {
        return vec![0xff, 0];
    };
    let value = match registry.get(def.id) {
        Ok((_, value)) => value,
        Err(e) => {
            log::warn!("Sending empty value for ({}) {}: {}", def.id, def.name, e);
            Vec::new()
        }
    };
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(def.id);
    out.push(value.len() as u8);
    out.extend_from_slice(&value);
    out
}

// Write decoder ///////////////////////////////////////////////////////////////

/// Parses incoming property data and applies complete properties.
#[derive(Debug)]
struct WriteDecoder {
    header_received: bool,
    remaining_properties: u8,
    /// Id of the property being received.
    property_cursor: Option<u8>,
    value_length: Option<u8>,
    byte_cursor: usize,
    scratch: [u8; A3_MAX_CONFIG_DATA_LENGTH],
}

impl Default for WriteDecoder {
    fn default() -> Self {
        Self {
            header_received: false,
            remaining_properties: 0,
            property_cursor: None,
            value_length: None,
            byte_cursor: 0,
            scratch: [0; A3_MAX_CONFIG_DATA_LENGTH],
        }
    }
}

impl WriteDecoder {
    fn is_done(&self) -> bool {
        self.header_received && self.remaining_properties == 0
    }

    fn consume(&mut self, data: &[u8], registry: &mut Registry, storage: &mut dyn Storage) {
        let mut index = 0;
        if !self.header_received {
            let Some(count) = data.first() else {
                return;
            };
            self.remaining_properties = *count;
            self.header_received = true;
            index += 1;
        }
        while index < data.len() && self.remaining_properties > 0 {
            if self.property_cursor.is_none() {
                self.property_cursor = Some(data[index]);
                index += 1;
                continue;
            }
            let length = match self.value_length {
                Some(length) => length as usize,
                None => {
                    self.value_length = Some(data[index]);
                    index += 1;
                    if data[index - 1] == 0 {
                        self.finish_property(registry, storage);
                    }
                    continue;
                }
            };
            let to_read = min(length - self.byte_cursor, data.len() - index);
            for (offset, byte) in data[index..index + to_read].iter().enumerate() {
                // bytes beyond the scratch buffer are consumed and dropped
                if let Some(slot) = self.scratch.get_mut(self.byte_cursor + offset) {
                    *slot = *byte;
                }
            }
            index += to_read;
            self.byte_cursor += to_read;
            if self.byte_cursor == length {
                self.finish_property(registry, storage);
            }
        }
    }

    fn finish_property(&mut self, registry: &mut Registry, storage: &mut dyn Storage) {
        let id = self.property_cursor.unwrap_or_default();
        let length = self.value_length.unwrap_or_default() as usize;
        if registry.is_writable(id) {
            let stored = min(length, self.scratch.len());
            registry.set(id, &self.scratch[..stored], storage);
        } else {
            log::warn!("Skipped {} bytes of unwritable property {}", length, id);
        }
        self.property_cursor = None;
        self.value_length = None;
        self.byte_cursor = 0;
        self.remaining_properties -= 1;
    }
}

// Session /////////////////////////////////////////////////////////////////////

pub struct StreamSession {
    peer_channel: Option<u32>,
    direction: Direction,
    encoder: ReadEncoder,
    decoder: WriteDecoder,
    generation: u32,
    last_activity: Tick,
}

impl StreamSession {
    pub fn new() -> Self {
        return Self {
            peer_channel: None,
            direction: Direction::None,
            encoder: ReadEncoder::default(),
            decoder: WriteDecoder::default(),
            generation: 0,
            last_activity: 0,
        };
    }

    pub fn peer_channel(&self) -> Option<u32> {
        self.peer_channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_active(&self) -> bool {
        self.direction != Direction::None
    }

    /// Counter that changes with every accepted request.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Handles a stream request naming `wire_index`.
    ///
    /// A busy session answers Busy on the requested wire and is left exactly
    /// as it was.
    pub fn request(
        &mut self,
        direction: Direction,
        wire_index: u8,
        registry: &Registry,
        transport: &mut dyn Transport,
        now: Tick,
    ) -> StreamStatus {
        let wire_id = A3_ID_ADMIN_WIRES_BASE + wire_index as u32;
        let status = if self.is_active() {
            log::warn!(
                "Stream request on wire {:03x} rejected, wire {:03x} is busy",
                wire_id,
                self.peer_channel.unwrap_or_default()
            );
            StreamStatus::Busy
        } else {
            self.start(direction, wire_id, registry, now)
        };
        transport.send(a3_message::stream_status(wire_id, status));
        status
    }

    fn start(
        &mut self,
        direction: Direction,
        wire_id: u32,
        registry: &Registry,
        now: Tick,
    ) -> StreamStatus {
        match direction {
            Direction::None => return StreamStatus::NotSupported,
            Direction::ReadName => {
                let Some(position) = (0..registry.len()).find(|position| {
                    registry
                        .def_at(*position)
                        .is_some_and(|def| def.id == u8::from(PropertyId::Name))
                }) else {
                    return StreamStatus::NoSuchStream;
                };
                self.encoder = ReadEncoder::for_single(position);
            }
            Direction::ReadConfig => self.encoder = ReadEncoder::for_config(registry),
            Direction::WriteConfig => self.decoder = WriteDecoder::default(),
        }
        self.direction = direction;
        self.peer_channel = Some(wire_id);
        self.generation = self.generation.wrapping_add(1);
        self.last_activity = now;
        log::info!("Stream {:?} started on wire {:03x}", direction, wire_id);
        StreamStatus::Ready
    }

    /// Advances the session with a frame received on its wire. Frames on
    /// other wires are ignored.
    pub fn on_wire_frame(
        &mut self,
        message: &CanMessage,
        registry: &mut Registry,
        storage: &mut dyn Storage,
        transport: &mut dyn Transport,
        now: Tick,
    ) {
        let Some(wire_id) = self.peer_channel else {
            return;
        };
        if message.is_extended() || message.id() != wire_id {
            return;
        }
        self.last_activity = now;
        match self.direction {
            Direction::None => {}
            Direction::ReadName | Direction::ReadConfig => {
                let mut out_message = CanMessage::new();
                out_message.set_id(wire_id);
                let length = self.encoder.fill(registry, &mut out_message.mut_data()[..A3_DATA_LENGTH]);
                out_message.set_data_length(length as u8);
                transport.send(out_message);
                if self.encoder.is_done() {
                    self.terminate();
                }
            }
            Direction::WriteConfig => {
                if message.is_remote() || message.data_length() == 0 {
                    return;
                }
                self.decoder.consume(message.payload(), registry, storage);
                if self.decoder.is_done() {
                    self.terminate();
                } else {
                    transport.request_continuation(wire_id);
                }
            }
        }
    }

    /// Terminates the session once `timeout_ms` passed without traffic on
    /// its wire.
    pub fn check_idle(&mut self, now: Tick, timeout_ms: Tick) -> IdleCheck {
        if !self.is_active() {
            return IdleCheck::Inactive;
        }
        let deadline = self.last_activity.wrapping_add(timeout_ms);
        if !is_due(deadline, now) {
            return IdleCheck::ActiveUntil(deadline);
        }
        log::warn!(
            "Stream {:?} on wire {:03x} timed out",
            self.direction,
            self.peer_channel.unwrap_or_default()
        );
        self.terminate();
        IdleCheck::Expired
    }

    pub fn terminate(&mut self) {
        if let Some(wire_id) = self.peer_channel {
            log::info!("Stream {:?} on wire {:03x} finished", self.direction, wire_id);
        }
        self.peer_channel = None;
        self.direction = Direction::None;
        self.encoder = ReadEncoder::default();
        self.decoder = WriteDecoder::default();
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}
