//! Reuse pool for [`ReplyEnvelope`]s.
//!
//! Every handled request and every client call borrows one envelope for the
//! few microseconds it takes to fill and serialize it. The pool keeps those
//! envelopes (and their buffers) around instead of allocating per message.
//!
//! [`ReplyPool::acquire`] hands out a [`PooledReply`] guard. The guard is the
//! only handle to its envelope, so an acquisition is exclusive by construction.
//! Dropping the guard (or calling [`PooledReply::release`]) resets the envelope
//! and returns it, which covers every exit path including panics.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::reply::ReplyEnvelope;

/// Counters for pool behaviour.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Envelopes handed out
    pub acquired: AtomicU64,
    /// Envelopes returned
    pub released: AtomicU64,
    /// Acquisitions that had to allocate
    pub allocated: AtomicU64,
    /// Returns dropped because the idle list was full
    pub discarded: AtomicU64,
}

/// Thread-safe pool of reply envelopes.
#[derive(Debug)]
pub struct ReplyPool {
    idle: Mutex<Vec<ReplyEnvelope>>,
    max_idle: usize,
    metrics: PoolMetrics,
}

impl ReplyPool {
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            metrics: PoolMetrics::default(),
        }
    }

    /// Borrow a zeroed envelope, reusing an idle one when available.
    pub fn acquire(&self) -> PooledReply<'_> {
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        let reused = self.idle.lock().pop();
        let envelope = reused.unwrap_or_else(|| {
            self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
            ReplyEnvelope::new()
        });
        PooledReply {
            envelope,
            pool: self,
        }
    }

    fn put(&self, mut envelope: ReplyEnvelope) {
        envelope.reset();
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(envelope);
        } else {
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Envelopes currently waiting for reuse.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    #[must_use]
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

impl Default for ReplyPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Exclusive loan of one envelope; returns it to the pool on drop.
#[derive(Debug)]
pub struct PooledReply<'a> {
    envelope: ReplyEnvelope,
    pool: &'a ReplyPool,
}

impl PooledReply<'_> {
    /// Return the envelope now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledReply<'_> {
    type Target = ReplyEnvelope;

    fn deref(&self) -> &Self::Target {
        &self.envelope
    }
}

impl DerefMut for PooledReply<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.envelope
    }
}

impl Drop for PooledReply<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.envelope));
    }
}
