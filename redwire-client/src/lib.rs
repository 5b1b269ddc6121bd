//! # RedWire Client
//!
//! Purpose: Talk RESP2 to a Redis-compatible server over one connection,
//! with request/reply correlation, pipelining and pub/sub, from either
//! blocking or async code.
//!
//! ## Design Principles
//! 1. **One Engine, Two Drivers**: `engine::Connection` holds all protocol
//!    state; `SyncClient` and `AsyncClient` only move bytes.
//! 2. **Replies Are Data**: Server error replies are `RespValue::Error`
//!    values, not `ClientError`s.
//! 3. **FIFO Correlation**: Replies complete commands strictly in the order
//!    they were sent; pushed messages never consume a reply slot.
//! 4. **Minimal Allocation**: Commands are framed straight into one
//!    outbound buffer and replies are decoded incrementally.

pub mod async_client;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod subscription;
pub mod sync;
pub mod transport;

pub use async_client::{AsyncClient, AsyncStream};
pub use config::{ClientConfig, Endpoint};
pub use engine::{ConnectionState, ErrorHandler, ReplyHandler};
pub use error::{ClientError, ClientResult, TimeoutKind};
pub use pipeline::Pipeline;
pub use subscription::{Handle, Listener, SubscriptionKind, Topic};
pub use sync::SyncClient;
pub use transport::{TcpTransport, Transport};

pub use redwire_common::{Command, RespValue};
