//! Non-blocking MySQL session.
//!
//! A `WireSession` owns a non-blocking `TcpStream` and exposes the protocol
//! as a set of `poll_*` operations. Each returns `Poll::Pending` when the
//! socket would block; the caller then calls [`WireSession::wait`] and
//! retries the same operation. [`drive`] packages that loop.
//!
//! Outgoing bytes are queued in an outbox and flushed by the next poll, so a
//! retried operation never sends its command twice.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::task::{Poll, ready};
use std::time::Duration;

use crate::auth;
use crate::column::ColumnDef;
use crate::config::ConnectionConfig;
use crate::protocol::reader::split_frame;
use crate::protocol::writer::{command_payload, frame};
use crate::protocol::{
    Command, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketReader, PacketType, PacketWriter,
    capabilities, charset, server_status,
};

/// A text-protocol row: one optional byte string per column, `None` for NULL.
pub type RawRow = Vec<Option<Vec<u8>>>;

const READ_CHUNK: usize = 16 * 1024;

/// Failure of a wire operation.
#[derive(Debug)]
pub enum WireError {
    /// Socket failure other than a dropped peer
    Io(io::Error),
    /// The server went away
    LostConnection,
    /// The server answered with an ERR packet
    Server(ErrPacket),
    /// Malformed or unexpected data
    Protocol(String),
    /// Authentication could not be completed on the client side
    Auth(String),
    /// Waiting for readiness failed or timed out
    Wait(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "{e}"),
            WireError::LostConnection => f.write_str("Lost connection to server"),
            WireError::Server(err) => write!(f, "{} ({})", err.error_message, err.error_code),
            WireError::Protocol(msg) | WireError::Auth(msg) => f.write_str(msg),
            WireError::Wait(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) | WireError::Wait(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => WireError::LostConnection,
            _ => WireError::Io(err),
        }
    }
}

fn protocol(msg: impl Into<String>) -> WireError {
    WireError::Protocol(msg.into())
}

/// Server greeting (initial handshake packet, protocol version 10).
#[derive(Debug, Clone)]
pub struct Greeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
    pub seed: Vec<u8>,
}

impl Greeting {
    fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PacketReader::new(payload);
        let version = reader
            .read_u8()
            .ok_or_else(|| protocol("Missing protocol version"))?;
        if version != 10 {
            return Err(protocol(format!("Unsupported protocol version: {version}")));
        }
        let server_version = reader
            .read_null_string()
            .ok_or_else(|| protocol("Missing server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol("Missing connection ID"))?;
        let seed_head = reader
            .read_bytes(8)
            .ok_or_else(|| protocol("Missing auth data"))?;
        reader.skip(1);
        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| protocol("Missing capability flags"))?;
        let charset = reader.read_u8().unwrap_or(charset::UTF8MB4_0900_AI_CI);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let seed_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            usize::from(reader.read_u8().unwrap_or(0))
        } else {
            reader.skip(1);
            0
        };
        reader.skip(10);

        let mut seed = seed_head.to_vec();
        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let tail_len = seed_len.saturating_sub(8).max(13);
            let tail = reader
                .read_bytes(tail_len)
                .unwrap_or_else(|| reader.read_rest());
            seed.extend_from_slice(tail.strip_suffix(&[0]).unwrap_or(tail));
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader
                .read_null_string()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| auth::plugins::MYSQL_NATIVE_PASSWORD.to_string())
        } else {
            auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            server_version,
            connection_id,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
            seed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Greeting,
    AuthResult,
    PublicKey,
    Done,
}

/// Metadata and progress of one statement's result.
#[derive(Debug, Clone, Default)]
pub struct WireResult {
    column_count: usize,
    columns: Vec<ColumnDef>,
    columns_buffered: bool,
    definitions_terminated: bool,
    finished: bool,
    affected_rows: u64,
    insert_id: u64,
    warnings: u16,
    status_flags: u16,
}

impl WireResult {
    fn with_columns(column_count: usize) -> Self {
        Self {
            column_count,
            columns: Vec::with_capacity(column_count),
            ..Self::default()
        }
    }

    fn from_ok(ok: &OkPacket) -> Self {
        Self {
            columns_buffered: true,
            finished: true,
            affected_rows: ok.affected_rows,
            insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
            ..Self::default()
        }
    }

    /// Number of columns; zero for statements without a result set.
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Column definitions; complete once `poll_columns` has finished.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn columns_buffered(&self) -> bool {
        self.columns_buffered
    }

    /// All rows have been read (or there were none to read).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }
}

/// A live non-blocking session.
pub struct WireSession {
    stream: TcpStream,
    config: ConnectionConfig,
    inbox: Vec<u8>,
    /// Bytes of `inbox` already split into frames
    consumed: usize,
    partial: Vec<u8>,
    outbox: Vec<u8>,
    flushed: usize,
    sequence_id: u8,
    phase: Handshake,
    greeting: Option<Greeting>,
    auth_plugin: String,
    seed: Vec<u8>,
    client_flags: u32,
    status_flags: u16,
    command_sent: bool,
}

impl fmt::Debug for WireSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireSession")
            .field("peer", &self.stream.peer_addr().ok())
            .field("phase", &self.phase)
            .field("client_flags", &format_args!("{:#010x}", self.client_flags))
            .field("status_flags", &self.status_flags)
            .finish_non_exhaustive()
    }
}

impl WireSession {
    /// Open the TCP connection and switch it to non-blocking mode.
    ///
    /// Address resolution and the TCP connect itself block, bounded by the
    /// configured connect timeout. Every resolved address is tried in turn.
    pub fn connect_tcp(config: &ConnectionConfig) -> Result<Self, WireError> {
        let mut last_error = None;
        let addrs = config.socket_addr().to_socket_addrs().map_err(WireError::Io)?;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    tracing::debug!(%addr, "tcp connection established");
                    return Ok(Self::from_stream(stream, config.clone()));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "tcp connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(WireError::Io(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No address found for {}", config.socket_addr()),
            )
        })))
    }

    fn from_stream(stream: TcpStream, config: ConnectionConfig) -> Self {
        Self {
            stream,
            config,
            inbox: Vec::with_capacity(READ_CHUNK),
            consumed: 0,
            partial: Vec::new(),
            outbox: Vec::new(),
            flushed: 0,
            sequence_id: 0,
            phase: Handshake::Greeting,
            greeting: None,
            auth_plugin: String::new(),
            seed: Vec::new(),
            client_flags: 0,
            status_flags: 0,
            command_sent: false,
        }
    }

    /// Greeting received from the server, once the handshake has started.
    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Server version string; empty before the greeting arrives.
    pub fn server_version(&self) -> &str {
        self.greeting.as_ref().map_or("", |g| g.server_version.as_str())
    }

    pub fn is_established(&self) -> bool {
        self.phase == Handshake::Done
    }

    /// Capability flags agreed with the server.
    pub fn client_flags(&self) -> u32 {
        self.client_flags
    }

    /// Server status flags from the most recent OK/EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    fn deprecate_eof(&self) -> bool {
        self.client_flags & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Frame `payload` with the running sequence id and queue it for sending.
    fn queue(&mut self, payload: &[u8]) {
        let (bytes, next) = frame(payload, self.sequence_id);
        self.sequence_id = next;
        self.outbox.extend_from_slice(&bytes);
    }

    fn begin_command(&mut self, command: Command, argument: &[u8]) {
        self.sequence_id = 0;
        self.queue(&command_payload(command, argument));
        self.command_sent = true;
    }

    fn poll_flush(&mut self) -> Poll<Result<(), WireError>> {
        while self.flushed < self.outbox.len() {
            match self.stream.write(&self.outbox[self.flushed..]) {
                Ok(0) => return Poll::Ready(Err(WireError::LostConnection)),
                Ok(n) => self.flushed += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
        self.outbox.clear();
        self.flushed = 0;
        Poll::Ready(Ok(()))
    }

    /// Flush pending output, then read one logical packet.
    ///
    /// Continuation frames of a payload of exactly `MAX_PACKET_SIZE` are
    /// joined before the payload is returned.
    fn poll_packet(&mut self) -> Poll<Result<Vec<u8>, WireError>> {
        ready!(self.poll_flush())?;
        loop {
            while let Some((header, total)) = split_frame(&self.inbox[self.consumed..]) {
                let start = self.consumed;
                self.partial
                    .extend_from_slice(&self.inbox[start + 4..start + total]);
                self.consumed += total;
                self.sequence_id = header.sequence_id.wrapping_add(1);
                if (header.payload_length as usize) < MAX_PACKET_SIZE {
                    return Poll::Ready(Ok(std::mem::take(&mut self.partial)));
                }
            }

            // compact once per read rather than once per frame
            self.inbox.drain(..self.consumed);
            self.consumed = 0;

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Poll::Ready(Err(WireError::LostConnection)),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    /// Block until the socket can make progress.
    ///
    /// The stream is temporarily made blocking, bounded by the configured
    /// wait timeout. Queued output is pushed with one blocking write, which
    /// returns as soon as the socket accepts bytes; otherwise the stream is
    /// peeked until input arrives.
    pub fn wait(&mut self) -> Result<(), WireError> {
        let timeout = self
            .config
            .wait_timeout
            .map(|t| t.max(Duration::from_millis(1)));
        if self.flushed < self.outbox.len() {
            return self.wait_writable(timeout);
        }

        self.stream.set_nonblocking(false).map_err(WireError::Wait)?;
        self.stream.set_read_timeout(timeout).map_err(WireError::Wait)?;
        let mut peeked = [0u8; 1];
        let outcome = loop {
            match self.stream.peek(&mut peeked) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => break other,
            }
        };
        let restored = self
            .stream
            .set_read_timeout(None)
            .and_then(|()| self.stream.set_nonblocking(true));

        match outcome {
            // zero bytes means the peer closed; the next read reports it
            Ok(_) => restored.map_err(WireError::Wait),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Err(WireError::Wait(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Timed out waiting for the server",
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wait_writable(&mut self, timeout: Option<Duration>) -> Result<(), WireError> {
        self.stream.set_nonblocking(false).map_err(WireError::Wait)?;
        self.stream.set_write_timeout(timeout).map_err(WireError::Wait)?;
        let outcome = loop {
            match self.stream.write(&self.outbox[self.flushed..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => break other,
            }
        };
        let restored = self
            .stream
            .set_write_timeout(None)
            .and_then(|()| self.stream.set_nonblocking(true));

        match outcome {
            Ok(0) => Err(WireError::LostConnection),
            Ok(n) => {
                self.flushed += n;
                restored.map_err(WireError::Wait)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Err(WireError::Wait(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Timed out waiting for the server",
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advance the handshake. `Ready(Ok)` once the session is authenticated.
    pub fn poll_handshake(&mut self) -> Poll<Result<(), WireError>> {
        loop {
            match self.phase {
                Handshake::Greeting => {
                    let payload = ready!(self.poll_packet())?;
                    if PacketType::of(&payload) == PacketType::Error {
                        return Poll::Ready(Err(server_error(&payload)));
                    }
                    let greeting = Greeting::parse(&payload)?;
                    tracing::debug!(
                        server_version = %greeting.server_version,
                        connection_id = greeting.connection_id,
                        plugin = %greeting.auth_plugin,
                        "received server greeting"
                    );
                    self.status_flags = greeting.status_flags;
                    self.greeting = Some(greeting);
                    self.send_handshake_response()?;
                    self.phase = Handshake::AuthResult;
                }
                Handshake::AuthResult => {
                    let payload = ready!(self.poll_packet())?;
                    self.handle_auth_packet(&payload)?;
                }
                Handshake::PublicKey => {
                    let payload = ready!(self.poll_packet())?;
                    let pem = payload.strip_prefix(&[0x01]).unwrap_or(&payload);
                    self.send_encrypted_password(pem)?;
                    self.phase = Handshake::AuthResult;
                }
                Handshake::Done => return Poll::Ready(Ok(())),
            }
        }
    }

    fn password(&self) -> &str {
        self.config.password.as_deref().unwrap_or("")
    }

    fn send_handshake_response(&mut self) -> Result<(), WireError> {
        let greeting = self
            .greeting
            .as_ref()
            .ok_or_else(|| protocol("No server handshake received"))?;
        let client_flags = self.config.capability_flags() & greeting.capabilities;
        let charset = self
            .config
            .charset_id()
            .map_err(|e| protocol(e.message()))?;

        // without pluggable auth only mysql_native_password can be spoken
        let plugin = if client_flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            greeting.auth_plugin.clone()
        } else {
            auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };
        let seed = greeting.seed.clone();
        let response = auth::scramble_for(&plugin, self.password(), &seed);

        let mut writer = PacketWriter::new();
        writer.write_u32_le(client_flags);
        writer.write_u32_le(self.config.max_packet_size);
        writer.write_u8(charset);
        writer.write_zeros(23);
        writer.write_null_string(&self.config.user);

        if client_flags & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(&response);
        } else if client_flags & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(response.len() as u8);
            writer.write_bytes(&response);
        } else {
            writer.write_bytes(&response);
            writer.write_u8(0);
        }

        if client_flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(&self.config.database);
        }
        if client_flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(&plugin);
        }
        if client_flags & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in &self.config.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        self.client_flags = client_flags;
        self.auth_plugin = plugin;
        self.seed = seed;
        self.queue(writer.as_bytes());
        Ok(())
    }

    fn handle_auth_packet(&mut self, payload: &[u8]) -> Result<(), WireError> {
        match PacketType::of(payload) {
            PacketType::Ok => {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet()
                    .ok_or_else(|| protocol("Invalid OK packet"))?;
                self.status_flags = ok.status_flags;
                self.phase = Handshake::Done;
                tracing::debug!(plugin = %self.auth_plugin, "authenticated");
                Ok(())
            }
            PacketType::Error => Err(server_error(payload)),
            PacketType::Eof => {
                // auth switch request: plugin name, then a fresh seed
                let mut reader = PacketReader::new(&payload[1..]);
                let plugin = reader
                    .read_null_string()
                    .ok_or_else(|| protocol("Missing plugin name in auth switch"))?;
                let seed = reader.read_rest();
                let seed = seed.strip_suffix(&[0]).unwrap_or(seed).to_vec();
                tracing::debug!(plugin = %plugin, "server requested auth switch");
                let response = auth::scramble_for(&plugin, self.password(), &seed);
                self.auth_plugin = plugin;
                self.seed = seed;
                self.queue(&response);
                Ok(())
            }
            _ => match payload {
                [0x01, auth::caching_sha2::FAST_AUTH_SUCCESS] => {
                    tracing::trace!("caching_sha2 fast auth succeeded");
                    Ok(())
                }
                [0x01, auth::caching_sha2::PERFORM_FULL_AUTH] => {
                    if self.password().is_empty() {
                        self.queue(&[0]);
                    } else {
                        self.queue(&[auth::caching_sha2::REQUEST_PUBLIC_KEY]);
                        self.phase = Handshake::PublicKey;
                    }
                    Ok(())
                }
                // sha256_password answers the key request with the PEM directly
                [0x01, pem @ ..] if pem.starts_with(b"-----") => self.send_encrypted_password(pem),
                [first, ..] => Err(protocol(format!("Unknown auth response: {first:02X}"))),
                [] => Err(protocol("Empty authentication response")),
            },
        }
    }

    fn send_encrypted_password(&mut self, pem: &[u8]) -> Result<(), WireError> {
        let encrypted = auth::sha256_password_rsa(self.password(), &self.seed, pem, true)
            .map_err(WireError::Auth)?;
        self.queue(&encrypted);
        Ok(())
    }

    /// Submit `sql` (once) and read the first response packet.
    pub fn poll_query(&mut self, sql: &str) -> Poll<Result<WireResult, WireError>> {
        if !self.command_sent {
            tracing::trace!(sql, "sending COM_QUERY");
            self.begin_command(Command::Query, sql.as_bytes());
        }
        let payload = match self.poll_packet() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => {
                self.command_sent = false;
                result?
            }
        };

        Poll::Ready(match PacketType::of(&payload) {
            PacketType::Ok => {
                let ok = PacketReader::new(&payload)
                    .parse_ok_packet()
                    .ok_or_else(|| protocol("Invalid OK packet"))?;
                self.status_flags = ok.status_flags;
                Ok(WireResult::from_ok(&ok))
            }
            PacketType::Error => Err(server_error(&payload)),
            PacketType::LocalInfile => Err(protocol("LOAD DATA LOCAL INFILE is not supported")),
            PacketType::Eof | PacketType::Data => {
                let count = PacketReader::new(&payload)
                    .read_lenenc_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| protocol("Invalid column count"))?;
                Ok(WireResult::with_columns(count))
            }
        })
    }

    /// Read the column definitions of `result`.
    pub fn poll_columns(&mut self, result: &mut WireResult) -> Poll<Result<(), WireError>> {
        while result.columns.len() < result.column_count {
            let payload = ready!(self.poll_packet())?;
            if PacketType::of(&payload) == PacketType::Error {
                result.finished = true;
                return Poll::Ready(Err(server_error(&payload)));
            }
            let def =
                ColumnDef::parse(&payload).ok_or_else(|| protocol("Malformed column definition"))?;
            result.columns.push(def);
        }
        if result.column_count > 0 && !self.deprecate_eof() && !result.definitions_terminated {
            let payload = ready!(self.poll_packet())?;
            if PacketType::of(&payload) != PacketType::Eof {
                return Poll::Ready(Err(protocol("Expected EOF after column definitions")));
            }
            result.definitions_terminated = true;
        }
        result.columns_buffered = true;
        Poll::Ready(Ok(()))
    }

    /// Read one row of `result`; `None` once the terminator has been read.
    pub fn poll_row(&mut self, result: &mut WireResult) -> Poll<Result<Option<RawRow>, WireError>> {
        if result.finished {
            return Poll::Ready(Ok(None));
        }
        if !result.columns_buffered {
            return Poll::Ready(Err(protocol("Column definitions have not been read")));
        }

        let payload = ready!(self.poll_packet())?;
        match payload.first() {
            Some(0xFF) => {
                result.finished = true;
                Poll::Ready(Err(server_error(&payload)))
            }
            // a row starting with 0xFE carries a cell of at least 2^24 bytes
            Some(0xFE) if payload.len() < MAX_PACKET_SIZE => {
                result.finished = true;
                let mut reader = PacketReader::new(&payload);
                let (warnings, status_flags) = if self.deprecate_eof() {
                    let ok = reader
                        .parse_ok_packet()
                        .ok_or_else(|| protocol("Invalid result terminator"))?;
                    (ok.warnings, ok.status_flags)
                } else {
                    let eof = reader
                        .parse_eof_packet()
                        .ok_or_else(|| protocol("Invalid result terminator"))?;
                    (eof.warnings, eof.status_flags)
                };
                result.warnings = warnings;
                result.status_flags = status_flags;
                self.status_flags = status_flags;
                Poll::Ready(Ok(None))
            }
            _ => {
                let mut reader = PacketReader::new(&payload);
                let row = (0..result.column_count)
                    .map(|_| reader.read_cell().map(|cell| cell.map(<[u8]>::to_vec)))
                    .collect::<Option<RawRow>>()
                    .ok_or_else(|| protocol("Truncated row"))?;
                Poll::Ready(Ok(Some(row)))
            }
        }
    }

    /// `COM_PING` round trip.
    pub fn poll_ping(&mut self) -> Poll<Result<(), WireError>> {
        if !self.command_sent {
            self.begin_command(Command::Ping, &[]);
        }
        let payload = match self.poll_packet() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => {
                self.command_sent = false;
                result?
            }
        };
        match PacketType::of(&payload) {
            PacketType::Ok => {
                if let Some(ok) = PacketReader::new(&payload).parse_ok_packet() {
                    self.status_flags = ok.status_flags;
                }
                Poll::Ready(Ok(()))
            }
            PacketType::Error => Poll::Ready(Err(server_error(&payload))),
            _ => Poll::Ready(Err(protocol("Unexpected reply to COM_PING"))),
        }
    }

    /// Send `COM_QUIT` and shut the socket down. Best effort.
    pub fn quit(mut self) {
        if self.is_established() {
            self.outbox.clear();
            self.flushed = 0;
            self.begin_command(Command::Quit, &[]);
            let _ = self.poll_flush();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn server_error(payload: &[u8]) -> WireError {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => WireError::Server(err),
        None => protocol("Invalid error packet"),
    }
}

/// Drive a non-blocking operation to completion.
///
/// `Pending` results wait for readiness and retry; a failed wait ends the
/// loop with that failure.
pub fn drive<T>(
    session: &mut WireSession,
    mut op: impl FnMut(&mut WireSession) -> Poll<Result<T, WireError>>,
) -> Result<T, WireError> {
    loop {
        match op(session) {
            Poll::Ready(result) => return result,
            Poll::Pending => session.wait()?,
        }
    }
}

/// Escape `text` for use inside a quoted SQL literal.
///
/// With `no_backslash_escapes` only single quotes are doubled, matching the
/// server's `NO_BACKSLASH_ESCAPES` mode.
pub fn escape(text: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(2 * text.len() + 1);
    if no_backslash_escapes {
        for c in text.chars() {
            if c == '\'' {
                out.push('\'');
            }
            out.push(c);
        }
        return out;
    }
    for c in text.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, ColumnDescriptor, FieldType};
    use crate::mock::{MockColumn, MockServer};

    fn open(server: &MockServer) -> WireSession {
        let mut session = WireSession::connect_tcp(&server.config()).unwrap();
        drive(&mut session, WireSession::poll_handshake).unwrap();
        session
    }

    #[test]
    fn escapes_special_characters() {
        assert_eq!(escape("O'Brien", false), "O\\'Brien");
        assert_eq!(escape("a\"b\\c", false), "a\\\"b\\\\c");
        assert_eq!(escape("\0\n\r\x1a", false), "\\0\\n\\r\\Z");
        assert_eq!(escape("plain", false), "plain");
        assert_eq!(escape("it's", true), "it''s");
        assert_eq!(escape("back\\slash", true), "back\\slash");
    }

    #[test]
    fn escape_never_more_than_doubles() {
        for input in ["", "'", "''''", "\0\0\\", "héllo'wörld", "\n\r\"\x1a"] {
            assert!(escape(input, false).len() <= 2 * input.len());
            assert!(escape(input, true).len() <= 2 * input.len());
        }
    }

    #[test]
    fn wire_error_maps_dropped_peers() {
        let lost: WireError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(lost, WireError::LostConnection));
        let other: WireError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, WireError::Io(_)));
    }

    #[test]
    fn handshake_and_result_set() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            assert_eq!(conn.expect_query().as_deref(), Some("SELECT id, name FROM t"));
            conn.send_result(
                &[
                    MockColumn::new("id", FieldType::Long, 11),
                    MockColumn::new("name", FieldType::VarString, 80),
                ],
                &[vec![Some("1"), Some("a")], vec![Some("2"), None]],
            );
        });

        let mut session = open(&server);
        assert!(session.is_established());
        assert_eq!(session.server_version(), MockServer::VERSION);

        let mut result = drive(&mut session, |s| s.poll_query("SELECT id, name FROM t")).unwrap();
        assert_eq!(result.column_count(), 2);
        drive(&mut session, |s| s.poll_columns(&mut result)).unwrap();
        let descriptors: Vec<ColumnDescriptor> =
            result.columns().iter().map(ColumnDescriptor::from).collect();
        assert_eq!(descriptors[0].column_type, ColumnType::Int);
        assert_eq!(descriptors[1].name, "name");

        let first = drive(&mut session, |s| s.poll_row(&mut result)).unwrap();
        assert_eq!(first, Some(vec![Some(b"1".to_vec()), Some(b"a".to_vec())]));
        let second = drive(&mut session, |s| s.poll_row(&mut result)).unwrap();
        assert_eq!(second, Some(vec![Some(b"2".to_vec()), None]));
        assert_eq!(drive(&mut session, |s| s.poll_row(&mut result)).unwrap(), None);
        assert!(result.is_finished());
        server.join();
    }

    #[test]
    fn frames_batched_in_one_read() {
        const ROWS: usize = 500;
        let server = MockServer::start(|conn| {
            conn.handshake();
            conn.expect_query();
            let values: Vec<String> = (0..ROWS).map(|i| i.to_string()).collect();
            let rows: Vec<Vec<Option<&str>>> =
                values.iter().map(|v| vec![Some(v.as_str())]).collect();
            // hold the rows back so they reach the client as one burst
            std::thread::sleep(Duration::from_millis(50));
            conn.send_result(&[MockColumn::new("n", FieldType::Long, 11)], &rows);
        });

        let mut session = open(&server);
        let mut result = drive(&mut session, |s| s.poll_query("SELECT n FROM t")).unwrap();
        drive(&mut session, |s| s.poll_columns(&mut result)).unwrap();
        let mut seen = 0;
        while let Some(row) = drive(&mut session, |s| s.poll_row(&mut result)).unwrap() {
            assert_eq!(row, vec![Some(seen.to_string().into_bytes())]);
            seen += 1;
        }
        assert_eq!(seen, ROWS);
        assert!(session.inbox.is_empty() || session.consumed == session.inbox.len());
        server.join();
    }

    #[test]
    fn large_query_waits_for_a_slow_reader() {
        const LEN: usize = 8 * 1024 * 1024;
        let server = MockServer::start(|conn| {
            conn.handshake();
            // let the client fill the send buffer before anything is read
            std::thread::sleep(Duration::from_millis(200));
            let sql = conn.expect_query().unwrap();
            assert_eq!(sql.len(), LEN);
            conn.send_ok(1, 0);
        });
        let mut session = open(&server);
        let sql = format!("SELECT '{}'", "x".repeat(LEN - 9));
        let result = drive(&mut session, |s| s.poll_query(&sql)).unwrap();
        assert_eq!(result.affected_rows(), 1);
        assert!(session.outbox.is_empty());
        server.join();
    }

    #[test]
    fn statement_without_result_set() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            conn.expect_query();
            conn.send_ok(3, 42);
        });
        let mut session = open(&server);
        let mut result = drive(&mut session, |s| s.poll_query("UPDATE t SET x = 1")).unwrap();
        assert_eq!(result.column_count(), 0);
        assert_eq!(result.affected_rows(), 3);
        assert_eq!(result.insert_id(), 42);
        assert!(result.is_finished());
        assert_eq!(drive(&mut session, |s| s.poll_row(&mut result)).unwrap(), None);
        server.join();
    }

    #[test]
    fn server_error_is_reported() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            conn.expect_query();
            conn.send_err(1064, "42000", "You have an error in your SQL syntax");
        });
        let mut session = open(&server);
        let err = drive(&mut session, |s| s.poll_query("SELEC 1")).unwrap_err();
        match err {
            WireError::Server(packet) => {
                assert_eq!(packet.error_code, 1064);
                assert_eq!(packet.sql_state, "42000");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server.join();
    }

    #[test]
    fn dropped_server_is_lost_connection() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            conn.expect_query();
            conn.hang_up();
        });
        let mut session = open(&server);
        let err = drive(&mut session, |s| s.poll_query("SELECT SLEEP(10)")).unwrap_err();
        assert!(matches!(err, WireError::LostConnection), "{err:?}");
        server.join();
    }

    #[test]
    fn wait_timeout_surfaces_as_wait_error() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            conn.expect_query();
            std::thread::sleep(Duration::from_millis(300));
        });
        let mut config = server.config();
        config.wait_timeout = Some(Duration::from_millis(20));
        let mut session = WireSession::connect_tcp(&config).unwrap();
        drive(&mut session, WireSession::poll_handshake).unwrap();
        let err = drive(&mut session, |s| s.poll_query("SELECT 1")).unwrap_err();
        assert!(matches!(err, WireError::Wait(_)), "{err:?}");
        server.join();
    }

    #[test]
    fn legacy_dialect_reads_eof_packets() {
        let server = MockServer::start(|conn| {
            conn.handshake();
            assert!(!conn.deprecate_eof());
            conn.expect_query();
            conn.send_result(&[MockColumn::new("n", FieldType::LongLong, 20)], &[vec![Some("7")]]);
        });
        let mut config = server.config();
        config.mysql = false;
        let mut session = WireSession::connect_tcp(&config).unwrap();
        drive(&mut session, WireSession::poll_handshake).unwrap();
        assert_eq!(session.client_flags() & capabilities::CLIENT_PLUGIN_AUTH, 0);

        let mut result = drive(&mut session, |s| s.poll_query("SELECT 7")).unwrap();
        drive(&mut session, |s| s.poll_columns(&mut result)).unwrap();
        let row = drive(&mut session, |s| s.poll_row(&mut result)).unwrap();
        assert_eq!(row, Some(vec![Some(b"7".to_vec())]));
        assert_eq!(drive(&mut session, |s| s.poll_row(&mut result)).unwrap(), None);
        server.join();
    }

    #[test]
    fn auth_switch_and_ping() {
        let server = MockServer::start(|conn| {
            conn.handshake_with_switch(auth::plugins::MYSQL_NATIVE_PASSWORD);
            conn.expect_ping();
        });
        let mut session = open(&server);
        assert!(session.is_established());
        drive(&mut session, WireSession::poll_ping).unwrap();
        server.join();
    }

    #[test]
    fn rejected_login() {
        let server = MockServer::start(|conn| {
            conn.handshake_rejected();
        });
        let mut session = WireSession::connect_tcp(&server.config()).unwrap();
        let err = drive(&mut session, WireSession::poll_handshake).unwrap_err();
        assert!(matches!(err, WireError::Server(ref p) if p.error_code == 1045), "{err:?}");
        server.join();
    }
}
