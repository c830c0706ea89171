//! In-process [`MessageBus`].
//!
//! Delivery rules follow the usual subject-based broker model:
//!
//! - every subscription whose pattern matches the published subject is a
//!   candidate
//! - candidates sharing a non-empty queue group (and pattern) compete; one of
//!   them receives the message, chosen round-robin
//! - candidates with an empty group each receive a copy
//! - a request nobody answers waits out its timeout
//!
//! Delivery channels are unbounded multi-consumer `may` channels, so publishing never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SendError};
use std::sync::Arc;
use std::time::Duration;

use may::sync::{mpmc, mpsc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::subject;
use super::{Message, MessageBus, Respond, Subscription, SubscriptionId};
use crate::error::{Result, RpcError};

struct Entry {
    id: SubscriptionId,
    pattern: String,
    group: String,
    sender: mpmc::Sender<Message>,
}

#[derive(Default)]
struct State {
    closed: bool,
    entries: Vec<Entry>,
    // Round-robin position per (pattern, group)
    cursors: HashMap<(String, String), usize>,
}

/// Bus that lives entirely in this process. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscription and refuse further traffic.
    ///
    /// Subscribers see their channels close once buffered messages drain.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.entries.len();
        state.entries.clear();
        state.cursors.clear();
        info!(subscriptions = dropped, "Memory bus closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Live subscriptions registered on exactly `pattern`.
    #[must_use]
    pub fn subscription_count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.pattern == pattern)
            .count()
    }

    /// Queue groups currently holding round-robin state.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    fn deliver(&self, subject: &str, data: &[u8], reply: Option<&Arc<dyn Respond>>) -> Result<usize> {
        subject::validate_literal(subject)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(RpcError::Transport("bus is closed".to_string()));
        }

        let make = || match reply {
            Some(reply) => Message::with_reply(subject, data.to_vec(), Arc::clone(reply)),
            None => Message::new(subject, data.to_vec()),
        };

        let mut delivered = 0;
        let mut groups: Vec<(String, String)> = Vec::new();

        for entry in &state.entries {
            if !subject::matches(&entry.pattern, subject) {
                continue;
            }
            if entry.group.is_empty() {
                if entry.sender.send(make()).is_ok() {
                    delivered += 1;
                }
            } else {
                let key = (entry.pattern.clone(), entry.group.clone());
                if !groups.contains(&key) {
                    groups.push(key);
                }
            }
        }

        for key in groups {
            let members: Vec<&Entry> = state
                .entries
                .iter()
                .filter(|e| e.pattern == key.0 && e.group == key.1)
                .collect();
            let cursor = state.cursors.entry(key).or_insert(0);
            let start = *cursor % members.len();

            // A member whose receiver is gone is skipped in favour of the next.
            let mut message = make();
            for offset in 0..members.len() {
                let idx = (start + offset) % members.len();
                match members[idx].sender.send(message) {
                    Ok(()) => {
                        *cursor = idx + 1;
                        delivered += 1;
                        break;
                    }
                    Err(SendError(returned)) => message = returned,
                }
            }
        }

        Ok(delivered)
    }
}

impl MessageBus for MemoryBus {
    fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        subject::validate_pattern(subject)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::Subscribe {
                subject: subject.to_string(),
                reason: "bus is closed".to_string(),
            });
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpmc::channel();
        state.entries.push(Entry {
            id,
            pattern: subject.to_string(),
            group: group.to_string(),
            sender: tx,
        });

        debug!(subject = %subject, group = %group, subscription = %id, "Subscribed");

        Ok(Subscription {
            id,
            subject: subject.to_string(),
            group: group.to_string(),
            receiver: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        match state.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = state.entries.remove(pos);
                let group_empty = !state
                    .entries
                    .iter()
                    .any(|e| e.pattern == entry.pattern && e.group == entry.group);
                if group_empty {
                    state
                        .cursors
                        .remove(&(entry.pattern.clone(), entry.group.clone()));
                }
                debug!(subject = %entry.pattern, group = %entry.group, subscription = %id, "Unsubscribed");
                Ok(())
            }
            None => Err(RpcError::Unsubscribe {
                subject: id.to_string(),
                reason: "unknown subscription".to_string(),
            }),
        }
    }

    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()> {
        self.deliver(subject, &data, None).map(|_| ())
    }

    fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        subject::validate_literal(subject)?;
        if timeout.is_zero() {
            return Err(RpcError::Timeout {
                subject: subject.to_string(),
                timeout,
            });
        }

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        // Held until we stop waiting, so an unanswered request runs out its
        // timeout instead of seeing a disconnected channel.
        let _waiting = tx.clone();
        let responder: Arc<dyn Respond> = Arc::new(ChannelResponder {
            answered: AtomicBool::new(false),
            sender: Mutex::new(tx),
        });

        self.deliver(subject, &data, Some(&responder))?;
        drop(responder);

        match rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Transport(format!(
                "reply channel for '{subject}' closed"
            ))),
        }
    }
}

struct ChannelResponder {
    answered: AtomicBool,
    sender: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl Respond for ChannelResponder {
    fn respond(&self, data: Vec<u8>) -> Result<()> {
        if self.answered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // A requester that already timed out drops late replies silently.
        let _ = self.sender.lock().send(data);
        Ok(())
    }
}
