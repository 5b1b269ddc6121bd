//! # Connection Engine
//!
//! Purpose: Hold everything one connection knows about its protocol
//! conversation, independent of how bytes move: the state machine, the
//! FIFO of reply handlers, the subscription tables and the decoder.
//!
//! ## Design Principles
//! 1. **Sans-I/O Core**: The engine never touches a socket. Drivers move
//!    `outbound()` bytes to the wire and `feed()` received bytes back.
//! 2. **FIFO Correlation**: The server answers in order, so the oldest
//!    queued handler owns the next reply that is not a pushed message.
//! 3. **Single Owner**: Exactly one driver owns a `Connection`; handlers
//!    run on that driver's thread or task.
//! 4. **Fail Loudly, Once**: Fatal errors fail every queued handler, reach
//!    the error handler, and leave the connection `Closed`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use redwire_common::{Command, ParseResult, RespParser, RespValue};
use tracing::{debug, error, trace, warn};

use crate::error::{ClientError, ClientResult};
use crate::pipeline::BatchCollector;
use crate::subscription::{
    Handle, Listener, PushedMessage, SubscriptionKind, Subscriptions, Topic,
};

/// Completion handler for one command.
pub type ReplyHandler = Box<dyn FnOnce(ClientResult<RespValue>) + Send + 'static>;

/// Connection-wide error observer.
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync + 'static>;

/// Commands accepted while the connection has active subscriptions.
const SUBSCRIBED_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PUBLISH",
    "PING",
];

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Subscribed,
    Closed,
}

impl ConnectionState {
    /// True for states that accept commands.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "Unconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Subscribed => "Subscribed",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Logs through `tracing`; installed until the caller replaces it.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &ClientError| error!(error = %err, "redwire connection error"))
}

/// What the server's reply to a queued command means for the engine.
enum Expect {
    Reply,
    /// Subscribe ack; an error reply rolls the registration back.
    SubscribeAck(Handle),
    UnsubscribeAck,
}

/// Turns a subscribe ack into the caller's result. The engine has already
/// dropped the registration when the server rejected it.
pub(crate) fn subscribe_outcome(handle: Handle, ack: &RespValue) -> ClientResult<Handle> {
    if ack.is_error() {
        return Err(ClientError::SubscribeRejected {
            topic: handle.topic().to_string(),
            reply: ack.to_string_lossy(),
        });
    }
    Ok(handle)
}

struct Pending {
    handler: ReplyHandler,
    expect: Expect,
}

/// Protocol state for a single connection.
pub struct Connection {
    state: ConnectionState,
    pending: VecDeque<Pending>,
    subscriptions: Subscriptions,
    next_handle: u64,
    // Unsubscribe acks still owed by the server. Pushed messages may keep
    // arriving until they land, even with no local registration left.
    unsubscribes_in_flight: usize,
    error_handler: ErrorHandler,
    parser: RespParser,
    outbound: BytesMut,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            state: ConnectionState::Unconnected,
            pending: VecDeque::new(),
            subscriptions: Subscriptions::default(),
            next_handle: 1,
            unsubscribes_in_flight: 0,
            error_handler: default_error_handler(),
            parser: RespParser::new(),
            outbound: BytesMut::with_capacity(256),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Number of replies the server still owes.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Number of live subscription registrations.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Passes `err` to the installed error handler.
    pub fn report(&self, err: &ClientError) {
        (self.error_handler)(err);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// `Unconnected -> Connecting`. A closed connection is never reopened.
    pub fn begin_connect(&mut self) -> ClientResult<()> {
        if self.state != ConnectionState::Unconnected {
            let err = self.state_error("connect");
            self.report(&err);
            return Err(err);
        }
        self.transition(ConnectionState::Connecting);
        Ok(())
    }

    /// `Connecting -> Connected`.
    pub fn connect_succeeded(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionState::Connected);
        }
    }

    /// `Connecting -> Unconnected`, reporting `err`.
    pub fn connect_failed(&mut self, err: &ClientError) {
        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionState::Unconnected);
        }
        self.report(err);
    }

    /// Moves to `Closed`, failing queued handlers with `ConnectionClosed`.
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.transition(ConnectionState::Closed);
        self.drain_pending(&ClientError::ConnectionClosed);
        self.subscriptions.clear();
        self.unsubscribes_in_flight = 0;
        self.outbound.clear();
        self.parser = RespParser::new();
    }

    /// Handles a fatal error: report it, fail every queued handler with it,
    /// then close.
    pub fn fail(&mut self, err: ClientError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!(error = %err, pending = self.pending.len(), "connection failed");
        self.report(&err);
        self.drain_pending(&err);
        self.close();
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Queues one command. A state error completes `handler` right away.
    pub fn submit(&mut self, command: &Command, handler: ReplyHandler) {
        if let Err(err) = self.check_command(command) {
            self.report(&err);
            handler(Err(err));
            return;
        }
        self.enqueue(command, handler, Expect::Reply);
    }

    /// Queues a batch whose replies complete `handler` as one array.
    pub fn submit_batch(&mut self, commands: &[Command], handler: ReplyHandler) {
        let checked = if commands.is_empty() {
            self.check_state("pipeline")
        } else {
            commands.iter().try_for_each(|command| self.check_command(command))
        };
        if let Err(err) = checked {
            self.report(&err);
            handler(Err(err));
            return;
        }
        if commands.is_empty() {
            handler(Ok(RespValue::Array(Vec::new())));
            return;
        }

        let collector = BatchCollector::new(commands.len(), handler);
        for (index, command) in commands.iter().enumerate() {
            self.enqueue(command, collector.slot(index), Expect::Reply);
        }
        trace!(commands = commands.len(), "pipeline queued");
    }

    /// Bytes waiting to be written. Drivers advance the buffer as they write.
    pub fn outbound(&mut self) -> &mut BytesMut {
        &mut self.outbound
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn check_command(&self, command: &Command) -> ClientResult<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Subscribed
                if SUBSCRIBED_COMMANDS.iter().any(|name| command.is(name)) =>
            {
                Ok(())
            }
            _ => Err(self.state_error(&String::from_utf8_lossy(command.name()))),
        }
    }

    fn check_state(&self, operation: &str) -> ClientResult<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(self.state_error(operation))
        }
    }

    fn state_error(&self, operation: &str) -> ClientError {
        ClientError::InvalidState {
            operation: operation.to_string(),
            state: self.state,
        }
    }

    fn enqueue(&mut self, command: &Command, handler: ReplyHandler, expect: Expect) {
        command.encode_into(&mut self.outbound);
        self.pending.push_back(Pending { handler, expect });
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    /// Registers `listener` for `topic` and sends the subscribe command;
    /// `on_reply` receives the server's acknowledgement.
    pub fn register(
        &mut self,
        topic: Topic,
        listener: Listener,
        on_reply: ReplyHandler,
    ) -> ClientResult<Handle> {
        let command_name = topic.kind.subscribe_command();
        if let Err(err) = self.check_state(command_name) {
            self.report(&err);
            on_reply(Err(err.clone()));
            return Err(err);
        }

        let handle = Handle::new(self.next_handle, topic);
        self.next_handle += 1;
        self.subscriptions.insert(&handle, listener);
        let command = Command::new(command_name).arg(&handle.topic().name);
        self.enqueue(&command, on_reply, Expect::SubscribeAck(handle.clone()));
        debug!(id = handle.id(), topic = %handle.topic(), "subscription registered");
        self.refresh_subscribed();
        Ok(handle)
    }

    /// Persistent channel or pattern subscription.
    pub fn subscribe<F>(
        &mut self,
        kind: SubscriptionKind,
        name: &[u8],
        on_message: F,
        on_reply: ReplyHandler,
    ) -> ClientResult<Handle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let topic = Topic {
            kind,
            name: name.to_vec(),
        };
        self.register(topic, Listener::persistent(on_message), on_reply)
    }

    /// Subscription whose handler runs at most once.
    pub fn single_shot_subscribe<F>(
        &mut self,
        kind: SubscriptionKind,
        name: &[u8],
        on_message: F,
        on_reply: ReplyHandler,
    ) -> ClientResult<Handle>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        let topic = Topic {
            kind,
            name: name.to_vec(),
        };
        self.register(topic, Listener::single_shot(on_message), on_reply)
    }

    /// Drops the registration behind `handle`. The server is only told when
    /// no other registration for the topic remains; otherwise `on_reply`
    /// completes with `Null` immediately.
    pub fn unsubscribe(&mut self, handle: &Handle, on_reply: ReplyHandler) {
        let command_name = handle.kind().unsubscribe_command();
        if let Err(err) = self.check_state(command_name) {
            self.report(&err);
            on_reply(Err(err));
            return;
        }

        let removed = self.subscriptions.remove(handle);
        if removed && !self.subscriptions.contains_topic(handle.topic()) {
            self.send_unsubscribe(handle.topic(), on_reply);
        } else {
            on_reply(Ok(RespValue::Null));
        }
        debug!(id = handle.id(), removed, "subscription removed");
        self.refresh_subscribed();
    }

    fn send_unsubscribe(&mut self, topic: &Topic, on_reply: ReplyHandler) {
        let command = Command::new(topic.kind.unsubscribe_command()).arg(&topic.name);
        self.unsubscribes_in_flight += 1;
        self.enqueue(&command, on_reply, Expect::UnsubscribeAck);
    }

    /// Drops a registration whose subscribe ack the caller stopped waiting
    /// for. The server may still apply the subscribe, so the topic is
    /// unsubscribed unless another registration keeps it.
    pub fn abandon(&mut self, handle: &Handle) {
        if !self.subscriptions.remove(handle) {
            return;
        }
        if self.is_connected() && !self.subscriptions.contains_topic(handle.topic()) {
            self.send_unsubscribe(handle.topic(), Box::new(|_| {}));
        }
        debug!(id = handle.id(), topic = %handle.topic(), "subscription abandoned");
        self.refresh_subscribed();
    }

    fn refresh_subscribed(&mut self) {
        match self.state {
            ConnectionState::Connected if !self.subscriptions.is_empty() => {
                self.transition(ConnectionState::Subscribed)
            }
            ConnectionState::Subscribed if self.subscriptions.is_empty() => {
                self.transition(ConnectionState::Connected)
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Decodes and routes every complete value in `input`, consuming the
    /// bytes it used. Partial values stay buffered in the parser. Returns
    /// the number of values routed.
    pub fn feed(&mut self, input: &mut BytesMut) -> ClientResult<usize> {
        let mut routed = 0;
        while !input.is_empty() {
            if self.state == ConnectionState::Closed {
                input.clear();
                return Err(ClientError::ConnectionClosed);
            }
            let (consumed, result) = self.parser.parse(&input[..]);
            input.advance(consumed);
            match result {
                ParseResult::Completed => {
                    if let Some(value) = self.parser.take_value() {
                        self.dispatch(value);
                        routed += 1;
                    }
                }
                ParseResult::Incomplete => break,
                ParseResult::Error(err) => {
                    let err = ClientError::Protocol(err);
                    input.clear();
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(routed)
    }

    fn dispatch(&mut self, value: RespValue) {
        let value = if self.routes_pushes() {
            match PushedMessage::classify(value) {
                Ok(message) => {
                    self.deliver(message);
                    return;
                }
                Err(value) => value,
            }
        } else {
            value
        };

        match self.pending.pop_front() {
            Some(pending) => {
                match &pending.expect {
                    Expect::Reply => {}
                    Expect::SubscribeAck(handle) if value.is_error() => {
                        // Rejected, so the server holds no subscription.
                        warn!(topic = %handle.topic(), reply = %value, "subscribe rejected by server");
                        if self.subscriptions.remove(handle) {
                            self.refresh_subscribed();
                        }
                    }
                    Expect::SubscribeAck(_) => {}
                    Expect::UnsubscribeAck => {
                        self.unsubscribes_in_flight = self.unsubscribes_in_flight.saturating_sub(1);
                    }
                }
                (pending.handler)(Ok(value));
            }
            None => {
                let err = ClientError::UnexpectedReply(value.inspect());
                self.report(&err);
            }
        }
    }

    fn routes_pushes(&self) -> bool {
        !self.subscriptions.is_empty() || self.unsubscribes_in_flight > 0
    }

    fn deliver(&mut self, message: PushedMessage) {
        let delivery = self.subscriptions.deliver(&message.topic, &message.payload);
        if delivery.total() == 0 {
            debug!(topic = %message.topic, "dropping message without handlers");
            return;
        }
        trace!(topic = %message.topic, handlers = delivery.total(), "message delivered");
        if delivery.single_shot > 0 && !self.subscriptions.contains_topic(&message.topic) {
            self.send_unsubscribe(&message.topic, Box::new(|_| {}));
            self.refresh_subscribed();
        }
    }

    fn drain_pending(&mut self, err: &ClientError) {
        for pending in self.pending.drain(..) {
            (pending.handler)(Err(err.clone()));
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = %self.state, to = %next, "connection state");
        self.state = next;
    }
}
