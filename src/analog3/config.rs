//! Coordinator side of the property stream.
//!
//! The module encodes its table with [`crate::stream`]; this is the peer that
//! consumes read streams and produces write streams. The simulated Mission
//! Control and the tests use it to drive a module over the bus.

use std::cmp::min;

use crate::error::{AppError, ErrorType, Result};

fn error<T>(message: &str) -> Result<T> {
    Err(AppError::new(ErrorType::A3InvalidValue, message.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Property {
    pub fn u8(id: u8, value: u8) -> Self {
        Self {
            id,
            data: vec![value],
        }
    }

    pub fn u16(id: u8, value: u16) -> Self {
        Self {
            id,
            data: value.to_be_bytes().to_vec(),
        }
    }

    pub fn u32(id: u8, value: u32) -> Self {
        Self {
            id,
            data: value.to_be_bytes().to_vec(),
        }
    }

    pub fn text(id: u8, value: &str) -> Self {
        Self {
            id,
            data: value.as_bytes().to_vec(),
        }
    }

    pub fn vector_u8(id: u8, value: &[u8]) -> Self {
        Self {
            id,
            data: value.to_vec(),
        }
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }

    /// Reads an integer value of any width, big-endian.
    pub fn as_u32(&self) -> Result<u32> {
        if self.data.is_empty() || self.data.len() > 4 {
            return error("Property: not an integer value");
        }
        Ok(self
            .data
            .iter()
            .fold(0u32, |value, byte| (value << 8) | *byte as u32))
    }
}

// Stream parser ///////////////////////////////////////////////////////////////

/// What the next byte of a read stream means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Count,
    Id,
    Length { id: u8 },
    Value { id: u8, length: usize },
    Nothing,
}

/// Collects the properties of a read stream across frames.
#[derive(Debug, Clone)]
pub struct ChunkParser {
    expect: Expect,
    remaining: usize,
    value: Vec<u8>,
    properties: Vec<Property>,
}

impl ChunkParser {
    /// Parser for a config dump that starts with the property count.
    pub fn new() -> Self {
        Self {
            expect: Expect::Count,
            remaining: 0,
            value: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Parser for a stream that carries exactly one property and no count.
    pub fn for_single_field() -> Self {
        Self {
            expect: Expect::Id,
            remaining: 1,
            ..Self::new()
        }
    }

    /// Feeds one frame worth of data. Returns true once every property arrived.
    pub fn data(&mut self, data: &[u8]) -> Result<bool> {
        if self.is_done() && !data.is_empty() {
            return error("ChunkParser: data past the end of the stream");
        }
        for byte in data {
            match self.expect {
                Expect::Nothing => {
                    return error("ChunkParser: data past the end of the stream");
                }
                Expect::Count => {
                    self.remaining = *byte as usize;
                    self.next_property();
                }
                Expect::Id => self.expect = Expect::Length { id: *byte },
                Expect::Length { id } => {
                    self.expect = Expect::Value {
                        id,
                        length: *byte as usize,
                    };
                    if *byte == 0 {
                        self.push_property(id);
                    }
                }
                Expect::Value { id, length } => {
                    self.value.push(*byte);
                    if self.value.len() == length {
                        self.push_property(id);
                    }
                }
            }
        }
        Ok(self.is_done())
    }

    fn push_property(&mut self, id: u8) {
        let data = std::mem::take(&mut self.value);
        self.properties.push(Property { id, data });
        self.remaining -= 1;
        self.next_property();
    }

    fn next_property(&mut self) {
        self.expect = if self.remaining == 0 {
            Expect::Nothing
        } else {
            Expect::Id
        };
    }

    pub fn is_done(&self) -> bool {
        self.expect == Expect::Nothing
    }

    pub fn commit(self) -> Result<Vec<Property>> {
        if !self.is_done() {
            return error("ChunkParser: stream is incomplete");
        }
        Ok(self.properties)
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

// Stream encoder //////////////////////////////////////////////////////////////

/// Lays out a modify-config stream and hands it out frame by frame.
pub struct PropertyEncoder {
    stream: Vec<u8>,
    cursor: usize,
}

impl PropertyEncoder {
    pub fn new(props: &[Property]) -> Self {
        let mut stream = vec![props.len() as u8];
        for prop in props {
            stream.push(prop.id);
            stream.push(prop.data.len() as u8);
            stream.extend_from_slice(&prop.data);
        }
        Self { stream, cursor: 0 }
    }

    /// Copies the next piece of the stream into `out` and returns its length.
    pub fn flush(&mut self, out: &mut [u8]) -> usize {
        let length = min(out.len(), self.stream.len() - self.cursor);
        out[..length].copy_from_slice(&self.stream[self.cursor..self.cursor + length]);
        self.cursor += length;
        length
    }

    pub fn is_done(&self) -> bool {
        self.cursor == self.stream.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_properties() {
        let property = Property::u32(0, 0x1acebeef);
        assert_eq!(property.data, vec![0x1a, 0xce, 0xbe, 0xef]);
        assert_eq!(property.as_u32().unwrap(), 0x1acebeef);
        assert_eq!(Property::u16(1, 0x0102).as_u32().unwrap(), 0x0102);
        assert!(Property::text(2, "").as_u32().is_err());
    }

    #[test]
    fn test_name_stream() {
        let mut parser = ChunkParser::for_single_field();
        assert!(!parser.data(b"\x02\x08cv-d").unwrap());
        assert!(parser.data(b"epot").unwrap());
        let properties = parser.commit().unwrap();
        assert_eq!(properties, vec![Property::text(2, "cv-depot")]);
    }

    #[test]
    fn test_config_stream_split_anywhere() {
        let stream = b"\x03\x03\x01\x02\x06\x02\x00\x01\x02\x04bass";
        for split in 0..=stream.len() {
            let mut parser = ChunkParser::new();
            let (head, tail) = stream.split_at(split);
            parser.data(head).unwrap();
            assert!(parser.data(tail).unwrap(), "split at {}", split);
            let properties = parser.commit().unwrap();
            assert_eq!(properties[0], Property::u8(3, 2));
            assert_eq!(properties[1], Property::vector_u8(6, &[0, 1]));
            assert_eq!(properties[2].as_text(), "bass");
        }
    }

    #[test]
    fn test_zero_length_value() {
        let mut parser = ChunkParser::new();
        assert!(parser.data(b"\x02\x06\x00\x05\x01\x01").unwrap());
        let properties = parser.commit().unwrap();
        assert!(properties[0].data.is_empty());
        assert_eq!(properties[1], Property::u8(5, 1));
    }

    #[test]
    fn test_incomplete_and_overrun() {
        let mut parser = ChunkParser::new();
        assert!(!parser.data(b"\x01\x03").unwrap());
        assert!(parser.clone().commit().is_err());
        assert!(parser.data(b"\x01\x02").unwrap());
        assert!(parser.data(b"\x00").is_err());
    }

    #[test]
    fn test_encoder_chunks() {
        let props = vec![Property::text(2, "sequencer"), Property::u16(9, 0xbeef)];
        let mut encoder = PropertyEncoder::new(&props);
        let mut frame = [0u8; 8];

        assert_eq!(encoder.flush(&mut frame), 8);
        assert_eq!(&frame, b"\x02\x02\x09seque");
        assert!(!encoder.is_done());

        assert_eq!(encoder.flush(&mut frame), 8);
        assert_eq!(&frame, b"ncer\x09\x02\xbe\xef");
        assert!(encoder.is_done());
        assert_eq!(encoder.flush(&mut frame), 0);
    }

    #[test]
    fn test_encoder_feeds_parser() {
        let props = vec![
            Property::vector_u8(6, &[]),
            Property::u32(0, 7),
            Property::text(2, "a longer module name"),
        ];
        let mut encoder = PropertyEncoder::new(&props);
        let mut parser = ChunkParser::new();
        let mut frame = [0u8; 3];
        while !encoder.is_done() {
            let length = encoder.flush(&mut frame);
            parser.data(&frame[..length]).unwrap();
        }
        assert_eq!(parser.commit().unwrap(), props);
    }
}
