//! Column metadata.
//!
//! `ColumnDef` is the raw definition packet sent by the server;
//! `ColumnDescriptor` is what callers see: a name plus one of nine semantic
//! type tags.

use serde::{Deserialize, Serialize};

use crate::protocol::PacketReader;

/// Wire field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte; unknown codes read as `String`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }
}

/// Column definition flags.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const SET: u16 = 2048;
}

/// Column definition as sent by the server (protocol 4.1 layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    /// Declared display width
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet; `None` if it is truncated.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PacketReader::new(payload);
        let _catalog = reader.read_lenenc_bytes()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let _org_table = reader.read_lenenc_bytes()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // length of the fixed-size block, always 0x0c
        let _fixed = reader.read_lenenc_int()?;
        Some(Self {
            schema,
            table,
            name,
            org_name,
            charset: reader.read_u16_le()?,
            column_length: reader.read_u32_le()?,
            column_type: FieldType::from_u8(reader.read_u8()?),
            flags: reader.read_u16_le()?,
            decimals: reader.read_u8()?,
        })
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

/// Semantic classification of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    /// Blob payloads, exposed as raw bytes
    Text,
    Int,
    Number,
    Date,
    Time,
    DateTime,
    Bool,
    Set,
}

impl ColumnType {
    /// Classify a wire column. Total: anything unlisted is `String`.
    ///
    /// Servers send SET columns as `STRING` with the SET flag raised, so the
    /// flags take part in the decision.
    pub fn classify(field_type: FieldType, declared_width: u32, flags: u16) -> Self {
        match field_type {
            FieldType::String | FieldType::VarString if flags & column_flags::SET != 0 => {
                ColumnType::Set
            }
            FieldType::Tiny if declared_width == 1 => ColumnType::Bool,
            FieldType::Tiny
            | FieldType::Bit
            | FieldType::Short
            | FieldType::Year
            | FieldType::Int24
            | FieldType::Long
            | FieldType::LongLong => ColumnType::Int,
            FieldType::Float | FieldType::Double | FieldType::Decimal | FieldType::NewDecimal => {
                ColumnType::Number
            }
            FieldType::Date | FieldType::NewDate => ColumnType::Date,
            FieldType::Time => ColumnType::Time,
            FieldType::Timestamp | FieldType::DateTime => ColumnType::DateTime,
            FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Blob => {
                ColumnType::Text
            }
            FieldType::Set => ColumnType::Set,
            _ => ColumnType::String,
        }
    }

    /// Lowercase tag used in serialized descriptors.
    pub const fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Int => "int",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::DateTime => "datetime",
            ColumnType::Bool => "bool",
            ColumnType::Set => "set",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-result column metadata handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(skip)]
    pub field_type: Option<FieldType>,
    #[serde(skip)]
    pub width: u32,
    #[serde(skip)]
    pub unsigned: bool,
    #[serde(skip)]
    pub binary: bool,
}

impl ColumnDescriptor {
    /// Descriptor with only a name and semantic type.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            field_type: None,
            width: 0,
            unsigned: false,
            binary: false,
        }
    }

    pub fn is_bit(&self) -> bool {
        self.field_type == Some(FieldType::Bit)
    }
}

impl From<&ColumnDef> for ColumnDescriptor {
    fn from(def: &ColumnDef) -> Self {
        Self {
            name: def.name.clone(),
            column_type: ColumnType::classify(def.column_type, def.column_length, def.flags),
            field_type: Some(def.column_type),
            width: def.column_length,
            unsigned: def.is_unsigned(),
            binary: def.is_binary(),
        }
    }
}

#[cfg(test)]
pub(crate) fn column_def_payload(name: &str, field_type: FieldType, width: u32, flags: u16) -> Vec<u8> {
    use crate::protocol::PacketWriter;

    let mut writer = PacketWriter::new();
    writer.write_lenenc_string("def");
    writer.write_lenenc_string("app");
    writer.write_lenenc_string("t");
    writer.write_lenenc_string("t");
    writer.write_lenenc_string(name);
    writer.write_lenenc_string(name);
    writer.write_lenenc_int(0x0c);
    writer.write_u16_le(45);
    writer.write_u32_le(width);
    writer.write_u8(field_type as u8);
    writer.write_u16_le(flags);
    writer.write_u8(0);
    writer.write_zeros(2);
    writer.into_bytes()
}
