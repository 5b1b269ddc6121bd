//! # Client Configuration
//!
//! Centralized settings shared by the sync and async drivers, with defaults
//! that match a local server and no deadlines.

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, ClientResult};

/// Prefix selecting a unix-domain socket endpoint.
pub const UNIX_PREFIX: &str = "unix:";

/// Default receive chunk size in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Configuration for one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint, e.g. "127.0.0.1:6379" or "unix:/tmp/redis.sock".
    pub endpoint: String,
    /// Deadline for establishing the connection. `None` waits indefinitely.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Option<Duration>,
    /// Deadline for one command (or one pipeline) to complete.
    #[serde(rename = "command_timeout_ms", with = "duration_ms")]
    pub command_timeout: Option<Duration>,
    /// Disable Nagle on TCP connections.
    pub tcp_nodelay: bool,
    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: "127.0.0.1:6379".to_string(),
            connect_timeout: None,
            command_timeout: None,
            tcp_nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ClientConfig {
            endpoint: endpoint.into(),
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|err| ClientError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges and that the endpoint parses.
    pub fn validate(&self) -> ClientResult<()> {
        if self.read_buffer_size == 0 {
            return Err(ClientError::Config(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        Endpoint::parse(&self.endpoint).map(|_| ())
    }

    /// Replaces values the drivers cannot run with by their defaults.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.read_buffer_size == 0 {
            warn!(
                default = DEFAULT_READ_BUFFER_SIZE,
                "read_buffer_size of zero replaced by default"
            );
            self.read_buffer_size = DEFAULT_READ_BUFFER_SIZE;
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

/// Parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// Parses `host:port` literals and `unix:<path>`. No name resolution.
    pub fn parse(raw: &str) -> ClientResult<Self> {
        if let Some(path) = raw.strip_prefix(UNIX_PREFIX) {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(ClientError::InvalidAddress(raw.to_string()));
                }
                return Ok(Endpoint::Unix(PathBuf::from(path)));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(ClientError::InvalidAddress(raw.to_string()));
            }
        }
        raw.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|_| ClientError::InvalidAddress(raw.to_string()))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
