//! # Message Bus Module
//!
//! The boundary between the RPC runtime and a publish/subscribe transport.
//!
//! The runtime needs four things from a bus:
//!
//! - **queue subscriptions**: a subject plus a competing-consumer group,
//!   yielding a channel of [`Message`]s where each message reaches exactly one
//!   member of the group
//! - **unsubscribe**: closes that channel once buffered messages are drained
//! - **publish**: fire-and-forget delivery to every matching subscription
//! - **request**: publish with a private reply address and wait, bounded by a
//!   timeout, for the first response
//!
//! [`MemoryBus`] is the in-process implementation used by tests and
//! single-process deployments. A broker-backed bus implements the same trait
//! and is handed to the [`Dispatcher`](crate::Dispatcher) as
//! `Arc<dyn MessageBus>`.

pub mod memory;
pub mod subject;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use may::sync::mpmc;

use crate::error::{Result, RpcError};

pub use memory::MemoryBus;

/// Reply address of an inbound message.
pub trait Respond: Send + Sync {
    /// Deliver a response. Only the first call reaches the requester.
    fn respond(&self, data: Vec<u8>) -> Result<()>;
}

/// One delivered message.
pub struct Message {
    pub subject: String,
    pub data: Vec<u8>,
    reply: Option<Arc<dyn Respond>>,
}

impl Message {
    /// A message without a reply address.
    pub fn new(subject: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            data,
            reply: None,
        }
    }

    /// A message whose responses go to `reply`.
    pub fn with_reply(subject: impl Into<String>, data: Vec<u8>, reply: Arc<dyn Respond>) -> Self {
        Self {
            subject: subject.into(),
            data,
            reply: Some(reply),
        }
    }

    #[must_use]
    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Publish `data` to this message's reply address.
    pub fn respond(&self, data: Vec<u8>) -> Result<()> {
        match &self.reply {
            Some(reply) => reply.respond(data),
            None => Err(RpcError::Transport(format!(
                "message on '{}' has no reply address",
                self.subject
            ))),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("len", &self.data.len())
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

/// Bus-assigned identity of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live subscription and its delivery channel.
///
/// The receiver is multi-consumer: each worker holds its own clone and every
/// message is taken by exactly one of them. Receivers report disconnection once
/// the bus has dropped the sending side and every buffered message has been
/// taken.
pub struct Subscription {
    pub id: SubscriptionId,
    pub subject: String,
    pub group: String,
    pub receiver: mpmc::Receiver<Message>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe transport.
pub trait MessageBus: Send + Sync + 'static {
    /// Subscribe under a queue group. An empty group makes every subscriber
    /// receive its own copy.
    fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription>;

    /// Cancel a subscription; its channel closes after buffered messages drain.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Deliver without waiting for a reply.
    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()>;

    /// Deliver with a reply address and wait up to `timeout` for one response.
    fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;
}
