//! MySQL wire protocol building blocks.
//!
//! Every MySQL packet starts with a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! A payload of exactly 2^24 - 1 bytes signals that the logical packet
//! continues in the next frame.

pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags exchanged during the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Protocol-41 core understood by every Drizzle/MySQL server.
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_CONNECT_WITH_DB;

    /// Base flags plus the MySQL-only extensions (pluggable auth, no EOF).
    pub const MYSQL_CLIENT_FLAGS: u32 = BASE_CLIENT_FLAGS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// Command codes (COM_xxx) used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the session
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Liveness check
    Ping = 0x0e,
}

/// Server status flags carried by OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// Character set codes.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Resolve a charset name to the collation id sent in the handshake.
    pub fn from_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "utf8mb4" | "utf8mb4_0900_ai_ci" => Some(UTF8MB4_0900_AI_CI),
            "utf8mb4_general_ci" => Some(UTF8MB4_GENERAL_CI),
            "utf8" | "utf8mb3" | "utf8_general_ci" => Some(UTF8_GENERAL_CI),
            "latin1" | "latin1_swedish_ci" => Some(LATIN1_SWEDISH_CI),
            "binary" => Some(BINARY),
            _ => None,
        }
    }
}

/// A frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a header from 4 bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        let [a, b, c, _] = self.payload_length.to_le_bytes();
        [a, b, c, self.sequence_id]
    }
}

/// Classification of a server response by its first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE, short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Anything else: column count, column definition or row
    Data,
}

impl PacketType {
    /// Classify a payload.
    pub fn of(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) => PacketType::Ok,
            Some(0xFF) => PacketType::Error,
            // 0xFE doubles as a lenenc prefix in rows; EOF is always short
            Some(0xFE) if payload.len() < 9 => PacketType::Eof,
            Some(0xFB) => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Server error code
    pub error_code: u16,
    /// SQL state (5 characters, empty on pre-4.1 servers)
    pub sql_state: String,
    /// Human-readable message
    pub error_message: String,
}

impl ErrPacket {
    /// ER_DUP_ENTRY
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }

    /// ER_ROW_IS_REFERENCED_2 / ER_NO_REFERENCED_ROW_2
    pub fn is_foreign_key_violation(&self) -> bool {
        self.error_code == 1451 || self.error_code == 1452
    }

    /// ER_PARSE_ERROR or any SQLSTATE class 42 report.
    pub fn is_syntax_error(&self) -> bool {
        self.error_code == 1064 || self.sql_state.starts_with("42")
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}
