//! # Node Connection
//!
//! Purpose: One TCP stream to one node, able to write requests ahead of their
//! replies and to account for every reply still on the wire.
//!
//! ## Design Principles
//! 1. **Split Send/Receive**: `send` never reads and `read_reply` never writes,
//!    which is what makes pipelining possible.
//! 2. **In-Flight Accounting**: Each successful `send` adds one expected reply;
//!    each `read_reply` consumes one. A connection is reusable only at zero.
//! 3. **Poison on Doubt**: Any transport or framing failure marks the
//!    connection broken; the pool evicts broken connections.
//! 4. **Buffer Reuse**: Read and write buffers live on the connection.

use std::io::{self, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use shardpipe_common::{encode_command, read_response, RespValue};
use tracing::debug;

use crate::config::{ClientConfig, Credentials};
use crate::error::{PipelineError, PipelineResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything needed to open and initialize a connection.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub credentials: Credentials,
    pub database: u32,
    pub client_name: Option<String>,
}

impl ConnectSettings {
    /// Derives connection settings from the client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        ConnectSettings {
            connect_timeout: config.pool.connect_timeout(),
            io_timeout: config.pool.io_timeout(),
            credentials: config.credentials.clone(),
            database: config.database,
            client_name: config.client_name.clone(),
        }
    }

    /// Same timeouts, but no AUTH/SELECT/SETNAME handshake.
    ///
    /// Used for sentinels, which have their own credentials.
    pub fn bare(&self) -> Self {
        ConnectSettings {
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            credentials: Credentials::default(),
            database: 0,
            client_name: None,
        }
    }
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    id: u64,
    addr: String,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    in_flight: usize,
    broken: bool,
}

impl Connection {
    /// Connects to `addr` and runs the AUTH/SELECT/SETNAME handshake.
    pub fn open(addr: &str, settings: &ConnectSettings) -> PipelineResult<Self> {
        let stream = connect_stream(addr, settings.connect_timeout)?;
        stream.set_read_timeout(Some(settings.io_timeout))?;
        stream.set_write_timeout(Some(settings.io_timeout))?;
        // Disable Nagle so pipelined writes are not held back.
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.to_string(),
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            in_flight: 0,
            broken: false,
        };
        conn.handshake(settings)?;
        debug!(conn = conn.id, addr = %conn.addr, "connection opened");
        Ok(conn)
    }

    fn handshake(&mut self, settings: &ConnectSettings) -> PipelineResult<()> {
        if let Some(password) = &settings.credentials.password {
            match &settings.credentials.username {
                Some(user) => {
                    self.exec_ok(&[b"AUTH", user.as_bytes(), password.as_bytes()])?
                }
                None => self.exec_ok(&[b"AUTH", password.as_bytes()])?,
            }
        }
        if settings.database != 0 {
            let db = settings.database.to_string();
            self.exec_ok(&[b"SELECT", db.as_bytes()])?;
        }
        if let Some(name) = &settings.client_name {
            self.exec_ok(&[b"CLIENT", b"SETNAME", name.as_bytes()])?;
        }
        Ok(())
    }

    fn exec_ok(&mut self, args: &[&[u8]]) -> PipelineResult<()> {
        match self.exec(args)? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(PipelineError::from_error_reply(&message)),
            other => Err(PipelineError::ProtocolDecode(format!(
                "expected +OK during handshake, got {}",
                other.type_name()
            ))),
        }
    }

    /// Unique id, useful for logging and for asserting connection reuse.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the node this connection is bound to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of requests written whose replies have not been read.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// True once a transport or framing error has been observed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Stops the connection from being reused, e.g. after a reply that did
    /// not fit its command.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// A connection may go back to its pool only when clean and fully drained.
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.in_flight == 0
    }

    /// Writes one request without waiting for its reply.
    pub fn send(&mut self, args: &[&[u8]]) -> PipelineResult<()> {
        if self.broken {
            return Err(broken_error(&self.addr));
        }
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        let written = stream
            .write_all(&self.write_buf)
            .and_then(|_| stream.flush());
        if let Err(err) = written {
            // A partial write leaves the stream in an unknown state.
            self.broken = true;
            return Err(err.into());
        }
        self.in_flight += 1;
        Ok(())
    }

    /// Blocks until the oldest outstanding reply arrives.
    ///
    /// Error replies are returned as `RespValue::Error`; only transport and
    /// framing failures become `Err`.
    pub fn read_reply(&mut self) -> PipelineResult<RespValue> {
        if self.broken {
            return Err(broken_error(&self.addr));
        }
        if self.in_flight == 0 {
            return Err(PipelineError::ProtocolDecode(format!(
                "no reply outstanding on connection to {}",
                self.addr
            )));
        }
        match read_response(&mut self.reader, &mut self.line_buf) {
            Ok(value) => {
                self.in_flight -= 1;
                Ok(value)
            }
            Err(err) => {
                self.broken = true;
                Err(err.into())
            }
        }
    }

    /// Sends one request and waits for its reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> PipelineResult<RespValue> {
        self.send(args)?;
        self.read_reply()
    }

    /// Reads and drops every outstanding reply.
    ///
    /// Best effort: the first failure marks the connection broken and stops
    /// the pass. Returns how many replies were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.in_flight > 0 && !self.broken {
            match self.read_reply() {
                Ok(_) => discarded += 1,
                Err(err) => {
                    debug!(conn = self.id, addr = %self.addr, error = %err, "discard pass failed");
                }
            }
        }
        discarded
    }
}

fn broken_error(addr: &str) -> PipelineError {
    PipelineError::ConnectionIo(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("connection to {} is broken", addr),
    ))
}

fn connect_stream(addr: &str, timeout: Duration) -> PipelineResult<TcpStream> {
    let mut last_err = None;
    let candidates = addr.to_socket_addrs().map_err(|err| {
        PipelineError::Config(format!("cannot resolve address {}: {}", addr, err))
    })?;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => PipelineError::Config(format!("address {} resolved to nothing", addr)),
    })
}
