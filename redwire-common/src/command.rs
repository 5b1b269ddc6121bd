//! # Commands
//!
//! An ordered argument list whose first element is the command name.

use bytes::BufMut;

use crate::encoder::encode_command;

/// Command ready to be framed onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            args: vec![name.as_ref().to_vec()],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Appends every argument yielded by `args`.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_vec()));
        self
    }

    /// Builds a command from a full argument vector (name first).
    ///
    /// Returns `None` for an empty vector: a command needs a name.
    pub fn from_args(args: Vec<Vec<u8>>) -> Option<Self> {
        if args.is_empty() {
            None
        } else {
            Some(Command { args })
        }
    }

    /// Command name as sent.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// ASCII case-insensitive comparison of the command name.
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// All arguments including the name.
    pub fn as_args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Frames the command into `out`.
    pub fn encode_into<B: BufMut>(&self, out: &mut B) {
        encode_command(&self.args, out);
    }
}
