//! MySQL/Drizzle client with a callback-driven query pipeline.
//!
//! The wire protocol is implemented from scratch over a non-blocking TCP
//! socket. Layers, bottom up:
//!
//! - `protocol`: packet framing, readers and writers
//! - `wire`: resumable handshake and query state machines that return
//!   `Poll::Pending` instead of blocking
//! - `connection` / `result`: a shared connection plus a cursor with one row
//!   of lookahead
//! - `types` / `placeholder`: value coercion in both directions and `?`
//!   substitution
//! - `executor`: a [`Database`] front end that runs work on a blocking pool
//!   and delivers callbacks on the caller's thread
//!
//! # Example
//!
//! ```rust,ignore
//! use drizzle_mysql::{ConnectOptions, ConnectionConfig, Database, QueryOptions};
//!
//! let config = ConnectionConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("app");
//!
//! let mut db = Database::new(config);
//! db.connect(ConnectOptions::new().on_error(|e| eprintln!("{e}")))?;
//! db.wait();
//!
//! db.query(
//!     "SELECT id, name FROM users WHERE id = ?",
//!     &[7.into()],
//!     QueryOptions::new().on_success(|_, rows| println!("{:?}", rows)),
//! )?;
//! db.wait();
//! ```

pub mod auth;
pub mod column;
pub mod config;
pub mod connection;
pub mod executor;
pub mod placeholder;
pub mod protocol;
pub mod result;
pub mod types;
pub mod wire;

#[cfg(test)]
mod mock;

pub use column::{ColumnDescriptor, ColumnType, FieldType};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use executor::{ConnectOptions, Database, QueryOptions, ServerInfo, StartAction};
pub use placeholder::parse_query;
pub use result::ResultCursor;
pub use types::{cast_cell, render_value};
pub use wire::RawRow;

pub use drizzle_core::{ColumnInfo, Error, Result, Row, Value};
