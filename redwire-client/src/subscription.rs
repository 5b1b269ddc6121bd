//! # Subscription Registry
//!
//! Purpose: Track message handlers per channel or pattern, and recognise
//! pushed `message`/`pmessage` arrays arriving on a subscribed connection.
//!
//! ## Design Principles
//! 1. **Registry Pattern**: Handlers live in tables keyed by topic; callers
//!    only ever hold an opaque `Handle`.
//! 2. **Explicit Lifetime**: Persistent handlers stay until unsubscribed,
//!    single-shot handlers are removed the moment they run.
//! 3. **Topic Identity**: A channel and a pattern with the same text are
//!    different topics.

use std::collections::HashMap;
use std::fmt;

use redwire_common::RespValue;

/// Handler for a persistent subscription; receives the raw payload.
pub type MessageHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Handler for a single-shot subscription.
pub type SingleShotHandler = Box<dyn FnOnce(&[u8]) + Send + 'static>;

/// Channel (exact name) or pattern (glob) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// A channel or pattern name tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: SubscriptionKind,
    pub name: Vec<u8>,
}

impl Topic {
    pub fn channel(name: impl AsRef<[u8]>) -> Self {
        Topic {
            kind: SubscriptionKind::Channel,
            name: name.as_ref().to_vec(),
        }
    }

    pub fn pattern(name: impl AsRef<[u8]>) -> Self {
        Topic {
            kind: SubscriptionKind::Pattern,
            name: name.as_ref().to_vec(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            SubscriptionKind::Channel => "channel",
            SubscriptionKind::Pattern => "pattern",
        };
        write!(f, "{} {}", prefix, String::from_utf8_lossy(&self.name))
    }
}

/// Opaque token for one registration. Ids are unique per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u64,
    topic: Topic,
}

impl Handle {
    pub(crate) fn new(id: u64, topic: Topic) -> Self {
        Handle { id, topic }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.topic.kind
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

/// Handler attached to a registration.
pub enum Listener {
    Persistent(MessageHandler),
    SingleShot(SingleShotHandler),
}

impl Listener {
    pub fn persistent<F>(handler: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        Listener::Persistent(Box::new(handler))
    }

    pub fn single_shot<F>(handler: F) -> Self
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        Listener::SingleShot(Box::new(handler))
    }
}

/// A pushed message split out of its reply array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedMessage {
    /// Registration key: the channel for `message`, the pattern for `pmessage`.
    pub topic: Topic,
    /// Channel the message was published to.
    pub channel: Vec<u8>,
    pub payload: Vec<u8>,
}

impl PushedMessage {
    /// Recognises `["message", channel, payload]` and
    /// `["pmessage", pattern, channel, payload]`. Any other value is
    /// handed back untouched.
    pub fn classify(value: RespValue) -> Result<PushedMessage, RespValue> {
        let is_push = match &value {
            RespValue::Array(items) => match items.first() {
                Some(RespValue::Bytes(kind)) if kind.as_slice() == b"message" => {
                    items.len() == 3 && items[1..].iter().all(RespValue::is_bytes)
                }
                Some(RespValue::Bytes(kind)) if kind.as_slice() == b"pmessage" => {
                    items.len() == 4 && items[1..].iter().all(RespValue::is_bytes)
                }
                _ => false,
            },
            _ => false,
        };
        if !is_push {
            return Err(value);
        }

        let mut parts = value.into_array().into_iter().map(|item| item.to_bytes());
        let kind = parts.next().unwrap_or_default();
        let mut next = || parts.next().unwrap_or_default();
        if kind.as_slice() == b"message" {
            let channel = next();
            let payload = next();
            Ok(PushedMessage {
                topic: Topic::channel(&channel),
                channel,
                payload,
            })
        } else {
            let pattern = next();
            let channel = next();
            let payload = next();
            Ok(PushedMessage {
                topic: Topic::pattern(pattern),
                channel,
                payload,
            })
        }
    }
}

/// Outcome of routing one pushed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub persistent: usize,
    pub single_shot: usize,
}

impl Delivery {
    pub fn total(&self) -> usize {
        self.persistent + self.single_shot
    }
}

/// Persistent and single-shot handler tables.
#[derive(Default)]
pub(crate) struct Subscriptions {
    persistent: HashMap<Topic, Vec<(u64, MessageHandler)>>,
    single_shot: HashMap<Topic, Vec<(u64, SingleShotHandler)>>,
}

impl Subscriptions {
    pub fn insert(&mut self, handle: &Handle, listener: Listener) {
        match listener {
            Listener::Persistent(handler) => self
                .persistent
                .entry(handle.topic.clone())
                .or_default()
                .push((handle.id, handler)),
            Listener::SingleShot(handler) => self
                .single_shot
                .entry(handle.topic.clone())
                .or_default()
                .push((handle.id, handler)),
        }
    }

    /// Removes the registration behind `handle`. Returns false when unknown.
    pub fn remove(&mut self, handle: &Handle) -> bool {
        remove_from(&mut self.persistent, handle) || remove_from(&mut self.single_shot, handle)
    }

    /// True while any registration of either kind exists for `topic`.
    pub fn contains_topic(&self, topic: &Topic) -> bool {
        self.persistent.contains_key(topic) || self.single_shot.contains_key(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.single_shot.is_empty()
    }

    pub fn len(&self) -> usize {
        self.persistent.values().map(Vec::len).sum::<usize>()
            + self.single_shot.values().map(Vec::len).sum::<usize>()
    }

    /// Runs every persistent handler for `topic`, then consumes every
    /// single-shot handler for it.
    pub fn deliver(&mut self, topic: &Topic, payload: &[u8]) -> Delivery {
        let mut delivery = Delivery::default();
        if let Some(handlers) = self.persistent.get_mut(topic) {
            for (_, handler) in handlers.iter_mut() {
                handler(payload);
                delivery.persistent += 1;
            }
        }
        if let Some(handlers) = self.single_shot.remove(topic) {
            for (_, handler) in handlers {
                handler(payload);
                delivery.single_shot += 1;
            }
        }
        delivery
    }

    pub fn clear(&mut self) {
        self.persistent.clear();
        self.single_shot.clear();
    }
}

fn remove_from<H>(table: &mut HashMap<Topic, Vec<(u64, H)>>, handle: &Handle) -> bool {
    let Some(handlers) = table.get_mut(&handle.topic) else {
        return false;
    };
    let before = handlers.len();
    handlers.retain(|(id, _)| *id != handle.id);
    let removed = handlers.len() != before;
    if handlers.is_empty() {
        table.remove(&handle.topic);
    }
    removed
}
