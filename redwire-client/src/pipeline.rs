//! # Pipelining
//!
//! Purpose: Send many commands in one write and hand back their replies as
//! a single array in submission order.
//!
//! ## Design Principles
//! 1. **Builder Pattern**: `Pipeline` accumulates commands until `finish()`.
//! 2. **One Entry per Command**: Each command keeps its own slot in the
//!    reply queue, so FIFO correlation is the same as for single commands.
//! 3. **All-or-Nothing**: The first failure completes the whole batch with
//!    that error; later replies for the batch are absorbed.

use std::sync::{Arc, Mutex, PoisonError};

use redwire_common::{Command, RespValue};

use crate::engine::ReplyHandler;
use crate::error::ClientResult;

/// Commands waiting to be sent as one batch.
///
/// `C` is the client the batch is bound to; each driver provides `finish()`.
pub struct Pipeline<C> {
    client: C,
    commands: Vec<Command>,
}

impl<C> Pipeline<C> {
    pub(crate) fn new(client: C) -> Self {
        Pipeline {
            client,
            commands: Vec::new(),
        }
    }

    /// Appends a command to the batch.
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn into_parts(self) -> (C, Vec<Command>) {
        (self.client, self.commands)
    }
}

struct BatchState {
    replies: Vec<RespValue>,
    received: usize,
    done: Option<ReplyHandler>,
}

/// Joins per-command replies into one array reply.
pub(crate) struct BatchCollector {
    state: Arc<Mutex<BatchState>>,
}

impl BatchCollector {
    pub fn new(len: usize, done: ReplyHandler) -> Self {
        BatchCollector {
            state: Arc::new(Mutex::new(BatchState {
                replies: vec![RespValue::Null; len],
                received: 0,
                done: Some(done),
            })),
        }
    }

    /// Reply handler for the command at `index`.
    pub fn slot(&self, index: usize) -> ReplyHandler {
        let state = Arc::clone(&self.state);
        Box::new(move |result: ClientResult<RespValue>| {
            let completion = {
                let mut batch = state.lock().unwrap_or_else(PoisonError::into_inner);
                batch.record(index, result)
            };
            // Run the caller's handler without holding the lock.
            if let Some((done, result)) = completion {
                done(result);
            }
        })
    }
}

impl BatchState {
    fn record(
        &mut self,
        index: usize,
        result: ClientResult<RespValue>,
    ) -> Option<(ReplyHandler, ClientResult<RespValue>)> {
        // Already failed.
        self.done.as_ref()?;
        match result {
            Err(err) => self.done.take().map(|done| (done, Err(err))),
            Ok(value) => {
                if let Some(slot) = self.replies.get_mut(index) {
                    *slot = value;
                }
                self.received += 1;
                if self.received < self.replies.len() {
                    return None;
                }
                let replies = std::mem::take(&mut self.replies);
                self.done
                    .take()
                    .map(|done| (done, Ok(RespValue::Array(replies))))
            }
        }
    }
}
