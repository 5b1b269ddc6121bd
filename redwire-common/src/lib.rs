// redwire-common - Value model and wire codec for the RedWire client
//
// This crate knows nothing about sockets: it frames commands, decodes replies
// incrementally, and defines the reply value type shared by both drivers.

pub mod command;
pub mod encoder;
pub mod error;
pub mod parser;
pub mod value;

// Re-export for convenience
pub use command::Command;
pub use encoder::{encode, encode_command, encode_reply, encode_simple};
pub use error::{ProtocolError, ProtocolResult};
pub use parser::{ParseResult, RespParser, MAX_BULK_LEN, MAX_LINE_LEN};
pub use value::RespValue;
