//! # Blocking Transports
//!
//! Purpose: Give the sync driver a byte pipe with per-call deadlines, so the
//! same driver runs over TCP, unix sockets, or an in-memory test double.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `SyncClient` only sees the `Transport` trait.
//! 2. **Deadline per Call**: Timeouts are passed on every read and write,
//!    and the socket option is only touched when the value changes.
//! 3. **No Name Resolution**: Addresses must be socket-address literals.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config::{ClientConfig, Endpoint};
use crate::error::{ClientError, ClientResult, TimeoutKind};

/// Blocking byte stream used by [`crate::SyncClient`].
///
/// A `timeout` of `None` blocks indefinitely. Implementations report an
/// elapsed deadline as `TimedOut` or `WouldBlock`.
pub trait Transport: Send {
    /// Reads available bytes into `buf`. `Ok(0)` means the peer closed.
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize>;

    /// Writes some prefix of `buf` and returns how many bytes were taken.
    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize>;

    /// Shuts the stream down. Must be idempotent.
    fn close(&mut self);
}

/// Opens a blocking transport for `endpoint` using the config's options.
pub fn connect(endpoint: &Endpoint, config: &ClientConfig) -> ClientResult<Box<dyn Transport>> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(Box::new(TcpTransport::connect(
            *addr,
            config.connect_timeout,
            config.tcp_nodelay,
        )?)),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixTransport::connect(path)?)),
    }
}

/// Socket-option cache shared by the stream transports.
#[derive(Debug, Default)]
struct Deadlines {
    read: Option<Duration>,
    write: Option<Duration>,
}

/// TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    deadlines: Deadlines,
    closed: bool,
}

impl TcpTransport {
    /// Connects to `addr`, bounded by `timeout` when set.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>, nodelay: bool) -> ClientResult<Self> {
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|err| ClientError::from_io(err, TimeoutKind::Connect))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(nodelay)?;
        debug!(%addr, nodelay, "tcp transport connected");
        Ok(TcpTransport::from_stream(stream))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        TcpTransport {
            stream,
            deadlines: Deadlines::default(),
            closed: false,
        }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.deadlines.read != timeout {
            self.stream.set_read_timeout(timeout)?;
            self.deadlines.read = timeout;
        }
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.deadlines.write != timeout {
            self.stream.set_write_timeout(timeout)?;
            self.deadlines.write = timeout;
        }
        self.stream.write(buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Unix-domain socket transport.
#[cfg(unix)]
pub struct UnixTransport {
    stream: UnixStream,
    deadlines: Deadlines,
    closed: bool,
}

#[cfg(unix)]
impl UnixTransport {
    /// Connects to the socket at `path`. Unix connects do not block on the
    /// peer, so there is no connect deadline.
    pub fn connect(path: &Path) -> ClientResult<Self> {
        let stream = UnixStream::connect(path)?;
        debug!(path = %path.display(), "unix transport connected");
        Ok(UnixTransport::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        UnixTransport {
            stream,
            deadlines: Deadlines::default(),
            closed: false,
        }
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.deadlines.read != timeout {
            self.stream.set_read_timeout(timeout)?;
            self.deadlines.read = timeout;
        }
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.deadlines.write != timeout {
            self.stream.set_write_timeout(timeout)?;
            self.deadlines.write = timeout;
        }
        self.stream.write(buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
