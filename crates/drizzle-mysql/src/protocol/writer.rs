//! Payload builder and frame encoder.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{Command, MAX_PACKET_SIZE, PacketHeader};

/// A growable payload buffer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the buffer as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer using the shortest form.
    pub fn write_lenenc_int(&mut self, value: u64) {
        match value {
            0..=250 => self.write_u8(value as u8),
            251..=0xFFFF => {
                self.write_u8(0xFC);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(0xFD);
                self.write_u24_le(value as u32);
            }
            _ => {
                self.write_u8(0xFE);
                self.write_u64_le(value);
            }
        }
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a length-encoded string.
    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Write a NUL-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zero padding.
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Frame `payload` into one or more packets starting at `sequence_id`.
///
/// Returns the encoded bytes and the next sequence id to use. A payload that
/// is an exact multiple of the maximum frame size ends with an empty frame.
pub fn frame(payload: &[u8], mut sequence_id: u8) -> (Vec<u8>, u8) {
    let frames = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
    let mut chunks = payload.chunks(MAX_PACKET_SIZE);
    loop {
        let chunk = chunks.next().unwrap_or_default();
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
        if chunk.len() < MAX_PACKET_SIZE {
            break;
        }
    }
    (out, sequence_id)
}

/// Build the payload of a single-byte command followed by its argument.
pub fn command_payload(command: Command, argument: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + argument.len());
    writer.write_u8(command as u8);
    writer.write_bytes(argument);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_integers() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x42);
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn lenenc_boundaries() {
        let encode = |v: u64| {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(v);
            writer.into_bytes()
        };
        assert_eq!(encode(250), vec![0xFA]);
        assert_eq!(encode(251), vec![0xFC, 0xFB, 0x00]);
        assert_eq!(encode(0x1_0000), vec![0xFD, 0x00, 0x00, 0x01]);
        assert_eq!(encode(1 << 24), vec![0xFE, 0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("root");
        writer.write_lenenc_string("db");
        writer.write_zeros(2);
        assert_eq!(writer.as_bytes(), b"root\0\x02db\0\0");
    }

    #[test]
    fn single_frame() {
        let (bytes, next) = frame(b"hello", 1);
        assert_eq!(&bytes[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[4..], b"hello");
        assert_eq!(next, 2);
    }

    #[test]
    fn empty_payload_is_one_empty_frame() {
        let (bytes, next) = frame(&[], 255);
        assert_eq!(bytes, vec![0, 0, 0, 255]);
        assert_eq!(next, 0);
    }

    #[test]
    fn oversized_payload_is_split() {
        let payload = vec![7u8; MAX_PACKET_SIZE];
        let (bytes, next) = frame(&payload, 0);
        // full frame followed by an empty terminator frame
        assert_eq!(bytes.len(), MAX_PACKET_SIZE + 8);
        assert_eq!(&bytes[MAX_PACKET_SIZE + 4..], &[0, 0, 0, 1]);
        assert_eq!(next, 2);
    }

    #[test]
    fn query_command() {
        let payload = command_payload(Command::Query, b"SELECT 1");
        assert_eq!(payload[0], 0x03);
        assert_eq!(&payload[1..], b"SELECT 1");
    }
}
