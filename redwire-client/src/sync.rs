//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over one RESP connection. Every
//! call runs on the caller's thread and returns once its reply has arrived,
//! its deadline has elapsed, or the connection has failed.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `SyncClient` hides the engine, the transport and
//!    the reply correlation behind plain method calls.
//! 2. **Shared Core**: Replies are decoded and routed by the same engine the
//!    async driver uses; this file only moves bytes.
//! 3. **Deadline per Call**: `command_timeout` bounds one whole call. A
//!    timeout leaves the connection usable and the late reply is absorbed.
//! 4. **Buffer Reuse**: One receive buffer lives for the whole connection.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use redwire_common::{Command, RespValue};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::info;

use crate::config::{ClientConfig, Endpoint};
use crate::engine::{subscribe_outcome, ConnectionState, Connection, ReplyHandler};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::pipeline::Pipeline;
use crate::subscription::{Handle, Listener, Topic};
use crate::transport::{self, Transport};

type ReplySlot = oneshot::Receiver<ClientResult<RespValue>>;

/// Blocking client for a single connection.
pub struct SyncClient {
    engine: Connection,
    transport: Option<Box<dyn Transport>>,
    read_buf: BytesMut,
    config: ClientConfig,
}

impl SyncClient {
    /// Creates an unconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let config = config.sanitized();
        let read_buf = BytesMut::with_capacity(config.read_buffer_size);
        SyncClient {
            engine: Connection::new(),
            transport: None,
            read_buf,
            config,
        }
    }

    /// Connects to `endpoint` with default configuration.
    pub fn open(endpoint: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig::new(endpoint))
    }

    /// Creates a client and connects it to `config.endpoint`.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let mut client = SyncClient::new(config);
        client.connect()?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to the configured endpoint.
    pub fn connect(&mut self) -> ClientResult<()> {
        let endpoint = match Endpoint::parse(&self.config.endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.engine.report(&err);
                return Err(err);
            }
        };
        self.connect_to(&endpoint)
    }

    /// Connects to `endpoint`, bounded by `connect_timeout`.
    pub fn connect_to(&mut self, endpoint: &Endpoint) -> ClientResult<()> {
        self.engine.begin_connect()?;
        match transport::connect(endpoint, &self.config) {
            Ok(transport) => {
                self.attach(transport);
                info!(endpoint = ?endpoint, "connected");
                Ok(())
            }
            Err(err) => {
                self.engine.connect_failed(&err);
                Err(err)
            }
        }
    }

    /// Uses an already open transport as the connection.
    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> ClientResult<()> {
        self.engine.begin_connect()?;
        self.attach(transport);
        Ok(())
    }

    fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.engine.connect_succeeded();
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Replaces the connection-wide error observer.
    pub fn install_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.engine.set_error_handler(Arc::new(handler));
    }

    /// Closes the connection. Later calls fail with `InvalidState`.
    pub fn disconnect(&mut self) {
        if self.engine.state() != ConnectionState::Closed {
            info!("disconnecting");
        }
        self.engine.close();
        self.drop_transport();
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Sends one command and waits for its reply.
    ///
    /// Server error replies come back as `Ok(RespValue::Error(..))`.
    pub fn command(&mut self, command: Command) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.engine.submit(&command, completion(tx));
        self.wait(rx)
    }

    /// Sends `commands` in one write; the reply is an array in the same order.
    pub fn pipelined(&mut self, commands: Vec<Command>) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.engine.submit_batch(&commands, completion(tx));
        self.wait(rx)
    }

    /// Starts a pipeline bound to this client.
    pub fn pipeline(&mut self) -> Pipeline<&mut SyncClient> {
        Pipeline::new(self)
    }

    pub fn publish(
        &mut self,
        channel: impl AsRef<[u8]>,
        message: impl AsRef<[u8]>,
    ) -> ClientResult<RespValue> {
        self.command(Command::new("PUBLISH").arg(channel).arg(message))
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    /// Subscribes to `channel` and waits for the server's acknowledgement.
    ///
    /// Messages are delivered while this client is reading, i.e. inside
    /// later calls or [`SyncClient::read_messages`].
    pub fn subscribe<F>(&mut self, channel: impl AsRef<[u8]>, on_message: F) -> ClientResult<Handle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.register(Topic::channel(channel), Listener::persistent(on_message))
    }

    /// Subscribes to a glob `pattern`.
    pub fn psubscribe<F>(&mut self, pattern: impl AsRef<[u8]>, on_message: F) -> ClientResult<Handle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.register(Topic::pattern(pattern), Listener::persistent(on_message))
    }

    /// Subscribes to `channel` for the next message only.
    pub fn single_shot_subscribe<F>(
        &mut self,
        channel: impl AsRef<[u8]>,
        on_message: F,
    ) -> ClientResult<Handle>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.register(Topic::channel(channel), Listener::single_shot(on_message))
    }

    pub fn single_shot_psubscribe<F>(
        &mut self,
        pattern: impl AsRef<[u8]>,
        on_message: F,
    ) -> ClientResult<Handle>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.register(Topic::pattern(pattern), Listener::single_shot(on_message))
    }

    /// Removes a registration. Returns the server's acknowledgement, or
    /// `Null` when other registrations keep the topic subscribed.
    pub fn unsubscribe(&mut self, handle: &Handle) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.engine.unsubscribe(handle, completion(tx));
        self.wait(rx)
    }

    /// Same as [`SyncClient::unsubscribe`]; the handle records its kind.
    pub fn punsubscribe(&mut self, handle: &Handle) -> ClientResult<RespValue> {
        self.unsubscribe(handle)
    }

    /// Reads and routes pushed messages until `timeout` elapses. Returns the
    /// number of values routed.
    pub fn read_messages(&mut self, timeout: Duration) -> ClientResult<usize> {
        let deadline = Some(Instant::now() + timeout);
        let mut routed = 0;
        loop {
            let step = if self.engine.has_outbound() {
                self.write_once(deadline).map(|_| 0)
            } else {
                self.read_once(deadline)
            };
            match step {
                Ok(count) => routed += count,
                Err(err) if err.is_timeout() => return Ok(routed),
                Err(err) => return Err(err),
            }
        }
    }

    fn register(&mut self, topic: Topic, listener: Listener) -> ClientResult<Handle> {
        let (tx, rx) = oneshot::channel();
        let handle = self.engine.register(topic, listener, completion(tx))?;
        match self.wait(rx) {
            Ok(ack) => subscribe_outcome(handle, &ack),
            Err(err) => {
                // Without the handle the caller could never unsubscribe.
                self.engine.abandon(&handle);
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // I/O
    // -------------------------------------------------------------------------

    fn wait(&mut self, mut slot: ReplySlot) -> ClientResult<RespValue> {
        let deadline = self.config.command_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match slot.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => return Err(ClientError::ConnectionClosed),
                Err(TryRecvError::Empty) => {}
            }
            let step = if self.engine.has_outbound() {
                self.write_once(deadline)
            } else {
                self.read_once(deadline).map(|_| ())
            };
            if let Err(err) = step {
                if err.is_timeout() {
                    self.engine.report(&err);
                }
                return Err(err);
            }
        }
    }

    fn write_once(&mut self, deadline: Option<Instant>) -> ClientResult<()> {
        let timeout = remaining(deadline)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(ClientError::ConnectionClosed);
        };
        let outbound = self.engine.outbound();
        match transport.write(&outbound[..], timeout) {
            Ok(0) => Err(self.fatal(io::Error::from(io::ErrorKind::WriteZero).into())),
            Ok(written) => {
                outbound.advance(written);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(self.io_failure(err)),
        }
    }

    fn read_once(&mut self, deadline: Option<Instant>) -> ClientResult<usize> {
        let timeout = remaining(deadline)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(ClientError::ConnectionClosed);
        };
        let start = self.read_buf.len();
        self.read_buf.resize(start + self.config.read_buffer_size, 0);
        let read = transport.read(&mut self.read_buf[start..], timeout);
        self.read_buf.truncate(start + read.as_ref().map_or(0, |n| *n));

        match read {
            Ok(0) => Err(self.fatal(ClientError::eof())),
            Ok(_) => self.engine.feed(&mut self.read_buf).map_err(|err| {
                self.drop_transport();
                err
            }),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(self.io_failure(err)),
        }
    }

    /// Timeouts leave the connection open; anything else closes it.
    fn io_failure(&mut self, err: io::Error) -> ClientError {
        let err = ClientError::from_io(err, TimeoutKind::Command);
        if err.is_timeout() {
            err
        } else {
            self.fatal(err)
        }
    }

    fn fatal(&mut self, err: ClientError) -> ClientError {
        self.engine.fail(err.clone());
        self.drop_transport();
        err
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.read_buf.clear();
    }
}

impl<'a> Pipeline<&'a mut SyncClient> {
    /// Sends the batch and waits for every reply.
    pub fn finish(self) -> ClientResult<RespValue> {
        let (client, commands) = self.into_parts();
        client.pipelined(commands)
    }
}

fn completion(tx: oneshot::Sender<ClientResult<RespValue>>) -> ReplyHandler {
    Box::new(move |result| {
        // The caller may have timed out and dropped the receiver.
        let _ = tx.send(result);
    })
}

fn remaining(deadline: Option<Instant>) -> ClientResult<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(ClientError::Timeout(TimeoutKind::Command))
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}
