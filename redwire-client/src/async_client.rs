//! # Asynchronous Client API
//!
//! Purpose: Drive one RESP connection from a tokio task so that any number
//! of callers, on any thread, can issue commands and subscriptions without
//! blocking each other.
//!
//! ## Design Principles
//! 1. **Actor Model**: A spawned task owns the engine and the stream. The
//!    cloneable `AsyncClient` only sends requests over a channel, so all
//!    state changes and callbacks happen on that one task.
//! 2. **Shared Core**: Decoding, correlation and pub/sub routing are the
//!    engine's; the task only moves bytes.
//! 3. **Cancel-Safe Select**: Reads, writes and new requests are multiplexed
//!    with `tokio::select!` over cancel-safe operations.
//! 4. **Transport Agnostic**: Any `AsyncRead + AsyncWrite` stream can be
//!    driven, which keeps TLS wrappers and test pipes outside the crate.

use std::sync::Arc;

use bytes::BytesMut;
use redwire_common::{Command, RespValue};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::{ClientConfig, Endpoint};
use crate::engine::{subscribe_outcome, Connection, ConnectionState, ErrorHandler, ReplyHandler};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::pipeline::Pipeline;
use crate::subscription::{Handle, Listener, Topic};

/// Byte stream the connection task can drive.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn AsyncStream>;

enum Request {
    Connect {
        endpoint: Endpoint,
        done: oneshot::Sender<ClientResult<()>>,
    },
    Command {
        command: Command,
        reply: ReplyHandler,
    },
    Batch {
        commands: Vec<Command>,
        reply: ReplyHandler,
    },
    Subscribe {
        topic: Topic,
        listener: Listener,
        reply: ReplyHandler,
        handle: oneshot::Sender<ClientResult<Handle>>,
    },
    Unsubscribe {
        handle: Handle,
        reply: ReplyHandler,
    },
    /// Subscribe whose caller gave up waiting for the ack.
    Abandon(Handle),
    /// Error seen by a caller that the error handler should also observe.
    Report(ClientError),
    ErrorHandler(ErrorHandler),
    Disconnect,
}

impl Request {
    /// Completes whatever the request carries with `err`.
    fn reject(self, err: ClientError) {
        match self {
            Request::Connect { done, .. } => {
                let _ = done.send(Err(err));
            }
            Request::Command { reply, .. }
            | Request::Batch { reply, .. }
            | Request::Unsubscribe { reply, .. } => reply(Err(err)),
            Request::Subscribe { reply, handle, .. } => {
                let _ = handle.send(Err(err.clone()));
                reply(Err(err));
            }
            Request::Abandon(_)
            | Request::Report(_)
            | Request::ErrorHandler(_)
            | Request::Disconnect => {}
        }
    }
}

/// Cloneable handle to a connection task.
///
/// Dropping every clone stops the task and closes the connection.
#[derive(Clone)]
pub struct AsyncClient {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    config: Arc<ClientConfig>,
}

impl AsyncClient {
    /// Spawns an unconnected client. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::spawn(Connection::new(), None, config)
    }

    /// Creates a client and connects it to `config.endpoint`.
    pub async fn open(config: ClientConfig) -> ClientResult<Self> {
        let client = AsyncClient::new(config);
        client.connect().await?;
        Ok(client)
    }

    /// Drives an already open stream, e.g. a TLS session or a test pipe.
    pub fn with_stream<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncStream,
    {
        let mut engine = Connection::new();
        // A fresh engine is always Unconnected.
        let _ = engine.begin_connect();
        engine.connect_succeeded();
        Self::spawn(engine, Some(Box::new(stream)), config)
    }

    fn spawn(engine: Connection, stream: Option<BoxedStream>, config: ClientConfig) -> Self {
        let config = config.sanitized();
        let (requests, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(engine.state());
        let config = Arc::new(config);
        let mut task = ConnectionTask {
            engine,
            reader: None,
            writer: None,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            config: Arc::clone(&config),
            state: state_tx,
        };
        if let Some(stream) = stream {
            task.attach(stream);
        }
        tokio::spawn(task.run(receiver));
        AsyncClient {
            requests,
            state,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to the configured endpoint.
    pub async fn connect(&self) -> ClientResult<()> {
        let endpoint = Endpoint::parse(&self.config.endpoint)?;
        self.connect_to(endpoint).await
    }

    /// Connects to `endpoint`, bounded by `connect_timeout`.
    pub async fn connect_to(&self, endpoint: Endpoint) -> ClientResult<()> {
        let (done, rx) = oneshot::channel();
        self.send(Request::Connect { endpoint, done })?;
        rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Waits until the connection reaches `target` or the task stops.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ClientResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Replaces the connection-wide error observer. The handler runs on the
    /// connection task.
    pub fn install_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        let _ = self.send(Request::ErrorHandler(Arc::new(handler)));
    }

    /// Closes the connection. Queued commands fail with `ConnectionClosed`.
    pub fn disconnect(&self) {
        let _ = self.send(Request::Disconnect);
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Sends one command and waits for its reply, bounded by
    /// `command_timeout`.
    pub async fn command(&self, command: Command) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Command {
            command,
            reply: completion(tx),
        })?;
        self.await_reply(rx).await
    }

    /// Sends one command; `handler` runs on the connection task.
    pub fn command_with<F>(&self, command: Command, handler: F)
    where
        F: FnOnce(ClientResult<RespValue>) + Send + 'static,
    {
        let _ = self.send(Request::Command {
            command,
            reply: Box::new(handler),
        });
    }

    /// Sends `commands` in one write; the reply is an array in the same order.
    pub async fn pipelined(&self, commands: Vec<Command>) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Batch {
            commands,
            reply: completion(tx),
        })?;
        self.await_reply(rx).await
    }

    /// Starts a pipeline bound to this client.
    pub fn pipeline(&self) -> Pipeline<&AsyncClient> {
        Pipeline::new(self)
    }

    pub async fn publish(
        &self,
        channel: impl AsRef<[u8]>,
        message: impl AsRef<[u8]>,
    ) -> ClientResult<RespValue> {
        self.command(Command::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    /// Subscribes to `channel` and waits for the acknowledgement.
    /// `on_message` runs on the connection task for every message.
    pub async fn subscribe<F>(&self, channel: impl AsRef<[u8]>, on_message: F) -> ClientResult<Handle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.register(Topic::channel(channel), Listener::persistent(on_message))
            .await
    }

    /// Subscribes to a glob `pattern`.
    pub async fn psubscribe<F>(&self, pattern: impl AsRef<[u8]>, on_message: F) -> ClientResult<Handle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.register(Topic::pattern(pattern), Listener::persistent(on_message))
            .await
    }

    /// Subscribes to `channel` for the next message only.
    pub async fn single_shot_subscribe<F>(
        &self,
        channel: impl AsRef<[u8]>,
        on_message: F,
    ) -> ClientResult<Handle>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.register(Topic::channel(channel), Listener::single_shot(on_message))
            .await
    }

    pub async fn single_shot_psubscribe<F>(
        &self,
        pattern: impl AsRef<[u8]>,
        on_message: F,
    ) -> ClientResult<Handle>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.register(Topic::pattern(pattern), Listener::single_shot(on_message))
            .await
    }

    /// Removes a registration. Returns the server's acknowledgement, or
    /// `Null` when other registrations keep the topic subscribed.
    pub async fn unsubscribe(&self, handle: &Handle) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Unsubscribe {
            handle: handle.clone(),
            reply: completion(tx),
        })?;
        self.await_reply(rx).await
    }

    /// Same as [`AsyncClient::unsubscribe`]; the handle records its kind.
    pub async fn punsubscribe(&self, handle: &Handle) -> ClientResult<RespValue> {
        self.unsubscribe(handle).await
    }

    async fn register(&self, topic: Topic, listener: Listener) -> ClientResult<Handle> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (handle_tx, handle_rx) = oneshot::channel();
        self.send(Request::Subscribe {
            topic,
            listener,
            reply: completion(ack_tx),
            handle: handle_tx,
        })?;
        let handle = handle_rx
            .await
            .unwrap_or(Err(ClientError::ConnectionClosed))?;
        match self.await_reply(ack_rx).await {
            Ok(ack) => subscribe_outcome(handle, &ack),
            Err(err) => {
                // Without the handle the caller could never unsubscribe.
                let _ = self.send(Request::Abandon(handle));
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn send(&self, request: Request) -> ClientResult<()> {
        self.requests.send(request).map_err(|rejected| {
            rejected.0.reject(ClientError::ConnectionClosed);
            ClientError::ConnectionClosed
        })
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<ClientResult<RespValue>>,
    ) -> ClientResult<RespValue> {
        let reply = match self.config.command_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    // The handler stays queued and absorbs the late reply.
                    debug!(?timeout, "command timed out");
                    let err = ClientError::Timeout(TimeoutKind::Command);
                    let _ = self.send(Request::Report(err.clone()));
                    return Err(err);
                }
            },
            None => rx.await,
        };
        reply.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

impl<'a> Pipeline<&'a AsyncClient> {
    /// Sends the batch and waits for every reply.
    pub async fn finish(self) -> ClientResult<RespValue> {
        let (client, commands) = self.into_parts();
        client.pipelined(commands).await
    }
}

fn completion(tx: oneshot::Sender<ClientResult<RespValue>>) -> ReplyHandler {
    Box::new(move |result| {
        let _ = tx.send(result);
    })
}

enum Event {
    Request(Option<Request>),
    Read(std::io::Result<usize>),
    Written(std::io::Result<usize>),
}

/// State owned by the spawned connection task.
struct ConnectionTask {
    engine: Connection,
    reader: Option<ReadHalf<BoxedStream>>,
    writer: Option<WriteHalf<BoxedStream>>,
    read_buf: BytesMut,
    config: Arc<ClientConfig>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionTask {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            if self.read_buf.capacity() - self.read_buf.len() < self.config.read_buffer_size / 2 {
                self.read_buf.reserve(self.config.read_buffer_size);
            }
            let has_outbound = self.engine.has_outbound();
            let event = match (self.reader.as_mut(), self.writer.as_mut()) {
                (Some(reader), Some(writer)) => {
                    tokio::select! {
                        request = requests.recv() => Event::Request(request),
                        read = reader.read_buf(&mut self.read_buf) => Event::Read(read),
                        written = writer.write_buf(self.engine.outbound()), if has_outbound => {
                            Event::Written(written)
                        }
                    }
                }
                _ => Event::Request(requests.recv().await),
            };

            match event {
                Event::Request(Some(request)) => self.handle(request).await,
                Event::Request(None) => break,
                Event::Read(read) => self.on_read(read),
                Event::Written(written) => self.on_written(written),
            }
            self.publish_state();
        }

        debug!("all client handles dropped; stopping connection task");
        self.shutdown().await;
        self.publish_state();
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Connect { endpoint, done } => {
                let result = self.connect(endpoint).await;
                let _ = done.send(result);
            }
            Request::Command { command, reply } => self.engine.submit(&command, reply),
            Request::Batch { commands, reply } => self.engine.submit_batch(&commands, reply),
            Request::Subscribe {
                topic,
                listener,
                reply,
                handle,
            } => {
                let _ = handle.send(self.engine.register(topic, listener, reply));
            }
            Request::Unsubscribe { handle, reply } => self.engine.unsubscribe(&handle, reply),
            Request::Abandon(handle) => self.engine.abandon(&handle),
            Request::Report(err) => self.engine.report(&err),
            Request::ErrorHandler(handler) => self.engine.set_error_handler(handler),
            Request::Disconnect => {
                info!("disconnecting");
                self.shutdown().await;
            }
        }
    }

    async fn connect(&mut self, endpoint: Endpoint) -> ClientResult<()> {
        self.engine.begin_connect()?;
        self.publish_state();
        match open_stream(&endpoint, &self.config).await {
            Ok(stream) => {
                self.attach(stream);
                info!(endpoint = ?endpoint, "connected");
                Ok(())
            }
            Err(err) => {
                self.engine.connect_failed(&err);
                Err(err)
            }
        }
    }

    fn attach(&mut self, stream: BoxedStream) {
        let (reader, writer) = split(stream);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.engine.connect_succeeded();
    }

    fn on_read(&mut self, read: std::io::Result<usize>) {
        match read {
            Ok(0) => self.fail(ClientError::eof()),
            Ok(_) => {
                if self.engine.feed(&mut self.read_buf).is_err() {
                    self.drop_stream();
                }
            }
            Err(err) => self.fail(ClientError::from_io(err, TimeoutKind::Command)),
        }
    }

    fn on_written(&mut self, written: std::io::Result<usize>) {
        match written {
            Ok(0) => self.fail(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
            Ok(_) => {}
            Err(err) => self.fail(ClientError::from_io(err, TimeoutKind::Command)),
        }
    }

    fn fail(&mut self, err: ClientError) {
        self.engine.fail(err);
        self.drop_stream();
    }

    async fn shutdown(&mut self) {
        self.engine.close();
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.drop_stream();
    }

    fn drop_stream(&mut self) {
        self.reader = None;
        self.writer = None;
        self.read_buf.clear();
    }

    fn publish_state(&self) {
        let current = self.engine.state();
        self.state.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}

async fn open_stream(endpoint: &Endpoint, config: &ClientConfig) -> ClientResult<BoxedStream> {
    let connecting = async {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(config.tcp_nodelay)?;
                Ok::<BoxedStream, std::io::Error>(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?) as BoxedStream),
        }
    };
    match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(TimeoutKind::Connect))?
            .map_err(|err| ClientError::from_io(err, TimeoutKind::Connect)),
        None => connecting
            .await
            .map_err(|err| ClientError::from_io(err, TimeoutKind::Connect)),
    }
}
