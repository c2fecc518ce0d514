//! A single MySQL/Drizzle session.
//!
//! `Connection` owns the configuration and a shared slot holding the live
//! [`WireSession`]. All methods take `&self` so one connection can be shared
//! between the caller thread and background workers through an `Arc`; the
//! session itself sits behind a mutex, while the state flags are atomics so
//! `is_open` and `escape` never wait on a running query.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use drizzle_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
};
use drizzle_core::{Error, Result};

use crate::config::ConnectionConfig;
use crate::protocol::ErrPacket;
use crate::result::ResultCursor;
use crate::wire::{self, WireError, WireSession, drive};

pub(crate) const LOST_CONNECTION: &str = "Lost connection while executing query";

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Closed = 0,
    Opening = 1,
    Open = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Session storage shared by a connection and its open cursor.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    session: Mutex<Option<WireSession>>,
    state: AtomicU8,
    no_backslash_escapes: AtomicBool,
    result_open: AtomicBool,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            session: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Closed as u8),
            no_backslash_escapes: AtomicBool::new(false),
            result_open: AtomicBool::new(false),
        }
    }

    /// Lock the session, recovering from a poisoned mutex.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<WireSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mirror the session's escaping mode after a server reply.
    ///
    /// `SET sql_mode` can toggle `NO_BACKSLASH_ESCAPES` at any point, and
    /// every OK or EOF packet reports the current setting.
    pub(crate) fn track_status(&self, session: &WireSession) {
        self.no_backslash_escapes
            .store(session.no_backslash_escapes(), Ordering::Release);
    }

    pub(crate) fn set_result_open(&self, open: bool) {
        self.result_open.store(open, Ordering::Release);
    }

    fn result_open(&self) -> bool {
        self.result_open.load(Ordering::Acquire)
    }

    /// Drop the session after a failure that leaves the stream unusable.
    ///
    /// Server errors are clean replies and keep the session.
    pub(crate) fn discard_if_broken(&self, guard: &mut Option<WireSession>, err: &WireError) {
        if matches!(err, WireError::Server(_)) {
            return;
        }
        if let Some(session) = guard.take() {
            tracing::debug!(error = %err, ?session, "discarding broken session");
        }
        self.set_state(ConnectionState::Closed);
    }
}

/// A connection to a MySQL or Drizzle server.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    slot: Arc<SessionSlot>,
    server_version: Mutex<String>,
}

impl Connection {
    /// Create a closed connection; call [`open`](Self::open) to connect.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            slot: Arc::new(SessionSlot::new()),
            server_version: Mutex::new(String::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// A cursor from the previous query is still alive.
    pub fn is_busy(&self) -> bool {
        self.slot.result_open()
    }

    /// Open the session, replacing any existing one.
    ///
    /// Blocks the calling thread while the handshake is driven to
    /// completion. On failure the connection is left `Closed`.
    #[tracing::instrument(level = "debug", skip(self), fields(host = %self.config.hostname, port = self.config.port, user = %self.config.user))]
    pub fn open(&self) -> Result<()> {
        self.close();
        self.config.validate()?;
        self.slot.set_state(ConnectionState::Opening);

        let session = WireSession::connect_tcp(&self.config)
            .map_err(connect_error)
            .and_then(|mut session| {
                drive(&mut session, WireSession::poll_handshake)
                    .map(|()| session)
                    .map_err(handshake_error)
            });

        match session {
            Ok(session) => {
                *self
                    .server_version
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = session.server_version().to_string();
                self.slot.track_status(&session);
                *self.slot.lock() = Some(session);
                self.slot.set_state(ConnectionState::Open);
                tracing::debug!(version = %self.version(), "connection open");
                Ok(())
            }
            Err(err) => {
                self.slot.set_state(ConnectionState::Closed);
                tracing::debug!(error = %err, "connection failed");
                Err(err)
            }
        }
    }

    /// Close the session. Idempotent and infallible.
    pub fn close(&self) {
        let session = self.slot.lock().take();
        self.slot.set_state(ConnectionState::Closed);
        if let Some(session) = session {
            tracing::debug!(host = %self.config.hostname, "closing connection");
            session.quit();
        }
    }

    /// Escape `text` for inclusion in a quoted literal.
    pub fn escape(&self, text: &str) -> String {
        wire::escape(text, self.slot.no_backslash_escapes.load(Ordering::Acquire))
    }

    /// Server version string; empty when not open.
    pub fn version(&self) -> String {
        if !self.is_open() {
            return String::new();
        }
        self.server_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn user(&self) -> &str {
        &self.config.user
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_mysql(&self) -> bool {
        self.config.mysql
    }

    /// Run `sql` and return a cursor over its result.
    ///
    /// Statements without a result set produce an empty cursor carrying the
    /// affected-row count and insert id.
    #[tracing::instrument(level = "debug", skip(self, sql))]
    pub fn query(&self, sql: &str) -> Result<ResultCursor> {
        if !self.is_open() {
            return Err(not_connected().with_sql(sql));
        }
        if self.is_busy() {
            return Err(busy().with_sql(sql));
        }
        tracing::trace!(sql, "executing query");

        let result = {
            let mut guard = self.slot.lock();
            let Some(session) = guard.as_mut() else {
                return Err(not_connected().with_sql(sql));
            };
            match drive(session, |s| s.poll_query(sql)) {
                Ok(result) => {
                    self.slot.track_status(session);
                    result
                }
                Err(err) => {
                    self.slot.discard_if_broken(&mut guard, &err);
                    return Err(wire_error(err, None).with_sql(sql));
                }
            }
        };

        ResultCursor::new(Arc::clone(&self.slot), result).map_err(|e| e.with_sql(sql))
    }

    /// `COM_PING` round trip.
    pub fn ping(&self) -> Result<()> {
        if self.is_busy() {
            return Err(busy());
        }
        let mut guard = self.slot.lock();
        let Some(session) = guard.as_mut() else {
            return Err(not_connected());
        };
        match drive(session, WireSession::poll_ping) {
            Ok(()) => {
                self.slot.track_status(session);
                Ok(())
            }
            Err(err) => {
                self.slot.discard_if_broken(&mut guard, &err);
                Err(wire_error(err, None))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn not_connected() -> Error {
    Error::Query(QueryError::new(QueryErrorKind::NotConnected, "Not connected"))
}

pub(crate) fn busy() -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::Busy,
        "Another query is still in progress on this connection",
    ))
}

fn classify(packet: &ErrPacket) -> QueryErrorKind {
    if packet.is_duplicate_key() || packet.is_foreign_key_violation() {
        QueryErrorKind::Constraint
    } else if packet.is_syntax_error() {
        QueryErrorKind::Syntax
    } else {
        QueryErrorKind::Database
    }
}

/// Convert a wire failure into a crate error, optionally prefixing `context`.
pub(crate) fn wire_error(err: WireError, context: Option<&str>) -> Error {
    let describe = |message: String| match context {
        Some(context) => format!("{context}: {message}"),
        None => message,
    };
    match err {
        WireError::Server(packet) => Error::Query(QueryError {
            kind: classify(&packet),
            sql: None,
            sqlstate: (!packet.sql_state.is_empty()).then(|| packet.sql_state.clone()),
            code: Some(packet.error_code),
            message: describe(packet.error_message),
            source: None,
        }),
        WireError::LostConnection => Error::Query(QueryError::new(
            QueryErrorKind::LostConnection,
            describe(LOST_CONNECTION.to_string()),
        )),
        WireError::Wait(e) => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Wait,
            message: describe(format!("Could not wait for connection: {e}")),
            source: Some(Box::new(e)),
        }),
        WireError::Protocol(message) => Error::Protocol(ProtocolError {
            message: describe(message),
            raw_data: None,
            source: None,
        }),
        WireError::Auth(message) => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Authentication,
            message: describe(message),
            source: None,
        }),
        WireError::Io(e) => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: describe(e.to_string()),
            source: Some(Box::new(e)),
        }),
    }
}

fn connect_error(err: WireError) -> Error {
    match err {
        WireError::Io(e) => {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("Could not connect: {e}"),
                source: Some(Box::new(e)),
            })
        }
        other => handshake_error(other),
    }
}

fn handshake_error(err: WireError) -> Error {
    match err {
        WireError::Server(packet) => {
            // ER_ACCESS_DENIED_ERROR / ER_DBACCESS_DENIED_ERROR
            let kind = if matches!(packet.error_code, 1044 | 1045) || packet.sql_state == "28000" {
                ConnectionErrorKind::Authentication
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: packet.error_message,
                source: None,
            })
        }
        WireError::LostConnection => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: "Lost connection during handshake".to_string(),
            source: None,
        }),
        other => wire_error(other, None),
    }
}
