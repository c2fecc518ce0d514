//! Cursor over a packet payload.
//!
//! All reads return `None` on truncated input rather than panicking, so the
//! callers can turn a short packet into a protocol error.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket, PacketHeader};

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        self.take_array::<1>().map(|[b]| b)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.take_array::<3>()
            .map(|[a, b, c]| u32::from_le_bytes([a, b, c, 0]))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    /// - 0xFB (NULL marker) and 0xFF yield `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            first @ 0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            _ => None,
        }
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.take(len)
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a text-protocol cell: `None` for the 0xFB NULL marker.
    ///
    /// The outer `Option` is `None` when the packet is truncated.
    pub fn read_cell(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek() == Some(0xFB) {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_bytes().map(Some)
    }

    /// Read a NUL-terminated string; a missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += (len + 1).min(rest.len());
        Some(s)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        self.take(len)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes; false when fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        self.take(n).is_some()
    }

    /// Parse an OK packet from a full payload.
    ///
    /// The header byte is 0x00, or 0xFE when it terminates a result set on a
    /// session that negotiated `CLIENT_DEPRECATE_EOF`.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.pos += 1;
        }
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le().unwrap_or(0);
        let info = String::from_utf8_lossy(self.read_rest()).into_owned();
        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet (the 0xFF marker is optional).
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.pos += 1;
        }
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.pos += 1;
            String::from_utf8_lossy(self.take(5)?).into_owned()
        } else {
            String::new()
        };
        let error_message = String::from_utf8_lossy(self.read_rest()).into_owned();
        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet (the 0xFE marker is optional).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.pos += 1;
        }
        Some(EofPacket {
            warnings: self.read_u16_le()?,
            status_flags: self.read_u16_le()?,
        })
    }
}

/// Locate the first complete frame in `buf`.
///
/// Returns the header and the total frame length (header included), or
/// `None` if more bytes are needed.
pub fn split_frame(buf: &[u8]) -> Option<(PacketHeader, usize)> {
    let header: [u8; 4] = buf.get(..PacketHeader::SIZE)?.try_into().ok()?;
    let header = PacketHeader::from_bytes(header);
    let total = PacketHeader::SIZE + header.payload_length as usize;
    (buf.len() >= total).then_some((header, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_integers() {
        let data = [0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u32_le(), Some(0x1234_5678));
        assert!(reader.is_empty());
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn truncated_reads_do_not_advance() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.remaining(), 3);
        assert_eq!(reader.read_u64_le(), None);
        assert_eq!(reader.read_u24_le(), Some(0x0003_0201));
    }

    #[test]
    fn lenenc_forms() {
        let mut reader = PacketReader::new(&[0xFA]);
        assert_eq!(reader.read_lenenc_int(), Some(250));

        let mut reader = PacketReader::new(&[0xFC, 0xFB, 0x00]);
        assert_eq!(reader.read_lenenc_int(), Some(251));

        let mut reader = PacketReader::new(&[0xFD, 0x00, 0x00, 0x01]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0001_0000));

        let mut reader = PacketReader::new(&[0xFE, 0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(reader.read_lenenc_int(), Some(1 << 32));

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int(), None);
    }

    #[test]
    fn text_cells() {
        let data = [0x01, b'7', 0xFB, 0x00, 0x03, b'a', b'b'];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_cell(), Some(Some(&b"7"[..])));
        assert_eq!(reader.read_cell(), Some(None));
        assert_eq!(reader.read_cell(), Some(Some(&b""[..])));
        // length 3 but only two bytes remain
        assert_eq!(reader.read_cell(), None);
    }

    #[test]
    fn null_terminated_strings() {
        let mut reader = PacketReader::new(b"8.0.36\0caching_sha2_password");
        assert_eq!(reader.read_null_string(), Some("8.0.36".to_string()));
        assert_eq!(
            reader.read_null_string(),
            Some("caching_sha2_password".to_string())
        );
        assert!(reader.is_empty());
    }

    #[test]
    fn ok_packet_with_info() {
        let mut data = vec![0x00, 0x03, 0xFC, 0x10, 0x27, 0x02, 0x00, 0x01, 0x00];
        data.extend_from_slice(b"Rows matched: 3");
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 10_000);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "Rows matched: 3");
    }

    #[test]
    fn ok_terminator_with_eof_header() {
        let ok = PacketReader::new(&[0xFE, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00])
            .parse_ok_packet()
            .unwrap();
        assert_eq!(ok.affected_rows, 0);
        assert_eq!(ok.status_flags, 0x22);
    }

    #[test]
    fn err_packet_with_and_without_state() {
        let mut data = vec![0xFF, 0x28, 0x04, b'#'];
        data.extend_from_slice(b"42000");
        data.extend_from_slice(b"You have an error in your SQL syntax");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1064);
        assert_eq!(err.sql_state, "42000");
        assert!(err.error_message.starts_with("You have an error"));

        let legacy = [0xFF, 0x15, 0x04, b'n', b'o'];
        let err = PacketReader::new(&legacy).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert!(err.sql_state.is_empty());
        assert_eq!(err.error_message, "no");
    }

    #[test]
    fn eof_packet() {
        let eof = PacketReader::new(&[0xFE, 0x02, 0x00, 0x22, 0x00])
            .parse_eof_packet()
            .unwrap();
        assert_eq!(eof.warnings, 2);
        assert_eq!(eof.status_flags, 0x22);
    }

    #[test]
    fn frame_splitting() {
        let buf = [0x02, 0x00, 0x00, 0x05, b'o', b'k', 0x09];
        let (header, len) = split_frame(&buf).unwrap();
        assert_eq!(header.sequence_id, 5);
        assert_eq!(len, 6);
        assert!(split_frame(&buf[..5]).is_none());
        assert!(split_frame(&buf[..3]).is_none());
    }
}
