//! Scripted in-process MySQL server for tests.
//!
//! Each `MockServer` accepts a single client on a loopback port and runs a
//! script against it on its own thread. The script speaks the protocol with
//! the crate's own `PacketWriter`, so the client sees real frames.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::column::{FieldType, column_flags};
use crate::config::ConnectionConfig;
use crate::protocol::writer::frame;
use crate::protocol::{Command, PacketHeader, PacketWriter, capabilities, server_status};

const SEED: [u8; 20] = *b"abcdefghij0123456789";
const AUTOCOMMIT: u16 = server_status::SERVER_STATUS_AUTOCOMMIT;

pub(crate) struct MockServer {
    port: u16,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub const VERSION: &'static str = "8.0.36-mock";

    pub fn start(script: impl FnOnce(&mut ServerConn) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut conn = ServerConn {
                stream,
                seq: 0,
                client_flags: 0,
                login: Vec::new(),
            };
            script(&mut conn);
        });
        Self { port, handle }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .host("127.0.0.1")
            .port(self.port)
            .user("app")
            .password("secret")
            .database("test")
            .wait_timeout(Duration::from_secs(10))
    }

    /// Wait for the script to finish, re-raising its panics.
    pub fn join(self) {
        if let Err(panic) = self.handle.join() {
            std::panic::resume_unwind(panic);
        }
    }
}

pub(crate) struct MockColumn {
    name: &'static str,
    field_type: FieldType,
    width: u32,
    flags: u16,
}

impl MockColumn {
    pub fn new(name: &'static str, field_type: FieldType, width: u32) -> Self {
        Self {
            name,
            field_type,
            width,
            flags: 0,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.flags |= column_flags::UNSIGNED;
        self
    }

    /// Send the column the way servers send SET: `STRING` plus the SET flag.
    pub fn set(mut self) -> Self {
        self.field_type = FieldType::String;
        self.flags |= column_flags::SET;
        self
    }
}

pub(crate) struct ServerConn {
    stream: TcpStream,
    seq: u8,
    client_flags: u32,
    login: Vec<u8>,
}

impl ServerConn {
    pub fn read_packet(&mut self) -> Option<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).ok()?;
        let header = PacketHeader::from_bytes(header);
        let mut payload = vec![0u8; header.payload_length as usize];
        self.stream.read_exact(&mut payload).ok()?;
        self.seq = header.sequence_id.wrapping_add(1);
        Some(payload)
    }

    pub fn send(&mut self, payload: &[u8]) {
        let (bytes, next) = frame(payload, self.seq);
        self.seq = next;
        // the client may already be gone in failure scripts
        let _ = self.stream.write_all(&bytes);
    }

    pub fn deprecate_eof(&self) -> bool {
        self.client_flags & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Raw handshake response sent by the client.
    pub fn login(&self) -> &[u8] {
        &self.login
    }

    fn greet(&mut self, plugin: &str) {
        let caps = capabilities::MYSQL_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_ATTRS;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string(MockServer::VERSION);
        w.write_u32_le(7);
        w.write_bytes(&SEED[..8]);
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(255);
        w.write_u16_le(AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&SEED[8..]);
        w.write_u8(0);
        w.write_null_string(plugin);
        self.seq = 0;
        self.send(w.as_bytes());

        self.login = self.read_packet().unwrap();
        self.client_flags = u32::from_le_bytes(self.login[..4].try_into().unwrap());
    }

    /// Greeting, read the client's response, accept it.
    pub fn handshake(&mut self) {
        self.greet("mysql_native_password");
        self.send_ok(0, 0);
    }

    /// Greeting, then demand a different plugin before accepting.
    pub fn handshake_with_switch(&mut self, plugin: &str) {
        self.greet("caching_sha2_password");
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_null_string(plugin);
        w.write_bytes(&SEED);
        w.write_u8(0);
        self.send(w.as_bytes());
        let reply = self.read_packet().unwrap();
        assert_eq!(reply.len(), 20, "native scramble expected after switch");
        self.send_ok(0, 0);
    }

    /// caching_sha2_password with a cache hit.
    pub fn handshake_fast_auth(&mut self) {
        self.greet("caching_sha2_password");
        self.send(&[0x01, 0x03]);
        self.send_ok(0, 0);
    }

    pub fn handshake_rejected(&mut self) {
        self.greet("mysql_native_password");
        self.send_err(1045, "28000", "Access denied for user 'app'@'localhost'");
    }

    /// Next `COM_QUERY` text; `None` on `COM_QUIT` or a closed socket.
    pub fn expect_query(&mut self) -> Option<String> {
        let payload = self.read_packet()?;
        match payload.split_first() {
            Some((&cmd, sql)) if cmd == Command::Query as u8 => {
                Some(String::from_utf8(sql.to_vec()).unwrap())
            }
            Some((&cmd, _)) if cmd == Command::Quit as u8 => None,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    pub fn expect_ping(&mut self) {
        let payload = self.read_packet().unwrap();
        assert_eq!(payload, [Command::Ping as u8]);
        self.send_ok(0, 0);
    }

    pub fn send_ok(&mut self, affected: u64, insert_id: u64) {
        self.send_ok_with(affected, insert_id, AUTOCOMMIT, 0);
    }

    pub fn send_ok_with(&mut self, affected: u64, insert_id: u64, status: u16, warnings: u16) {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(insert_id);
        w.write_u16_le(status);
        w.write_u16_le(warnings);
        self.send(w.as_bytes());
    }

    pub fn send_err(&mut self, code: u16, state: &str, message: &str) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(message.as_bytes());
        self.send(w.as_bytes());
    }

    fn send_eof(&mut self, status: u16, warnings: u16) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        if self.deprecate_eof() {
            w.write_lenenc_int(0);
            w.write_lenenc_int(0);
            w.write_u16_le(status);
            w.write_u16_le(warnings);
        } else {
            w.write_u16_le(warnings);
            w.write_u16_le(status);
        }
        self.send(w.as_bytes());
    }

    /// Column count, definitions, rows, terminator.
    pub fn send_result(&mut self, columns: &[MockColumn], rows: &[Vec<Option<&str>>]) {
        self.send_header(columns);
        for row in rows {
            self.send_row(row);
        }
        self.send_eof(AUTOCOMMIT, 0);
    }

    /// Result set whose terminator reports `warnings`.
    pub fn send_result_with_warnings(
        &mut self,
        columns: &[MockColumn],
        rows: &[Vec<Option<&str>>],
        warnings: u16,
    ) {
        self.send_header(columns);
        for row in rows {
            self.send_row(row);
        }
        self.send_eof(AUTOCOMMIT, warnings);
    }

    pub fn send_header(&mut self, columns: &[MockColumn]) {
        let mut count = PacketWriter::new();
        count.write_lenenc_int(columns.len() as u64);
        self.send(count.as_bytes());
        for column in columns {
            let def = crate::column::column_def_payload(
                column.name,
                column.field_type,
                column.width,
                column.flags,
            );
            self.send(&def);
        }
        if !self.deprecate_eof() {
            let mut eof = PacketWriter::new();
            eof.write_u8(0xFE);
            eof.write_u16_le(0);
            eof.write_u16_le(AUTOCOMMIT);
            self.send(eof.as_bytes());
        }
    }

    pub fn send_row(&mut self, row: &[Option<&str>]) {
        let mut w = PacketWriter::new();
        for cell in row {
            match cell {
                Some(text) => w.write_lenenc_string(text),
                None => w.write_u8(0xFB),
            }
        }
        self.send(w.as_bytes());
    }

    /// Drop the connection without a reply.
    pub fn hang_up(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
