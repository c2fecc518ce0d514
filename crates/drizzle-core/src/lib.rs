//! Core types for the drizzle client.
//!
//! This crate holds the backend-independent pieces shared by the driver:
//!
//! - `Value` for typed cells and bind parameters
//! - `Row` with shared column metadata
//! - `Error` taxonomy and the `Result` alias

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, CursorError, CursorErrorKind, Error,
    PlaceholderError, PlaceholderErrorKind, ProtocolError, QueryError, QueryErrorKind, Result,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
