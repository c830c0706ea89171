//! # Runner Module
//!
//! A [`Runner`] owns one queue subscription and a fixed pool of worker
//! coroutines draining it.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start──▶ Running ──shutdown / cancel──▶ ShuttingDown ──join──▶ Stopped
//! ```
//!
//! - **start** subscribes under the queue group and spawns exactly
//!   `concurrency` workers, each owning a clone of the subscription's
//!   multi-consumer receiver
//! - **shutdown** unsubscribes; the channel closes once buffered messages are
//!   drained, every worker exits, and the call returns after joining them
//! - **cancel** (through the dispatcher's [`CancelSignal`]) unsubscribes too, but
//!   workers drop anything still buffered instead of handling it
//!
//! In-flight handlers are never interrupted. Calling [`Runner::shutdown`] from
//! inside one of the runner's own handlers would join the calling worker and
//! never return.
//!
//! ## Configuration
//!
//! - `BUSRPC_HANDLER_WORKERS`: default worker count (see [`RuntimeConfig`](crate::RuntimeConfig))
//! - `BUSRPC_STACK_SIZE`: worker coroutine stack size

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use may::coroutine::JoinHandle;
use may::sync::mpmc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{Message, MessageBus, SubscriptionId};
use crate::cancel::{CancelSignal, ListenerKey};
use crate::error::{Result, RpcError};

/// Message handler invoked by a worker. Panics are caught per message.
pub type RawHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunnerState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl RunnerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunnerState::Created,
            1 => RunnerState::Running,
            2 => RunnerState::ShuttingDown,
            _ => RunnerState::Stopped,
        }
    }
}

/// Settings for one runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Subject (or wildcard pattern) to subscribe to
    pub subject: String,
    /// Competing-consumer group
    pub group: String,
    /// Number of worker coroutines
    pub concurrency: usize,
    /// Stack size for each worker coroutine
    pub stack_size: usize,
}

impl RunnerConfig {
    pub fn new(subject: impl Into<String>, group: impl Into<String>, concurrency: usize) -> Self {
        Self {
            subject: subject.into(),
            group: group.into(),
            concurrency,
            stack_size: 0x10000, // 64KB
        }
    }

    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

/// Metrics for a runner
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    /// Messages picked up by a worker
    pub delivered: AtomicU64,
    /// Handler invocations that returned (normally or by panic)
    pub completed: AtomicU64,
    /// Handler invocations that panicked
    pub panicked: AtomicU64,
    /// Handlers currently executing
    pub in_flight: AtomicUsize,
    /// Highest observed `in_flight`
    pub peak_in_flight: AtomicUsize,
    /// Worker coroutines currently alive
    pub active_workers: AtomicUsize,
}

impl RunnerMetrics {
    /// Record a message handed to a handler
    pub fn record_dispatch(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    /// Record a handler returning
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a handler panic
    pub fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn get_peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn get_active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }
}

struct RunnerShared {
    bus: Arc<dyn MessageBus>,
    subject: String,
    group: String,
    subscription_id: SubscriptionId,
    state: AtomicU8,
    cancel: CancelSignal,
    metrics: Arc<RunnerMetrics>,
}

impl RunnerShared {
    fn state(&self) -> RunnerState {
        RunnerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move Running → ShuttingDown and unsubscribe. Returns false when the
    /// runner was not running.
    fn begin_shutdown(&self) -> Result<bool> {
        if self
            .state
            .compare_exchange(
                RunnerState::Running as u8,
                RunnerState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        if let Err(e) = self.bus.unsubscribe(self.subscription_id) {
            // Still subscribed, so still running.
            self.state
                .store(RunnerState::Running as u8, Ordering::Release);
            return Err(e);
        }

        info!(
            subject = %self.subject,
            group = %self.group,
            in_flight = self.metrics.get_in_flight(),
            "Runner shutting down"
        );
        Ok(true)
    }
}

/// One subscription plus its worker pool.
pub struct Runner {
    shared: Arc<RunnerShared>,
    concurrency: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel_key: Mutex<Option<ListenerKey>>,
}

impl Runner {
    /// Subscribe and spawn the workers.
    ///
    /// Fails with [`RpcError::InvalidConfig`] for zero concurrency,
    /// [`RpcError::Subscribe`] when the bus rejects the subscription, and
    /// [`RpcError::Spawn`] when a worker cannot be started. Nothing stays
    /// subscribed after a failure.
    pub fn start(
        bus: Arc<dyn MessageBus>,
        config: RunnerConfig,
        cancel: CancelSignal,
        handler: RawHandler,
    ) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(RpcError::InvalidConfig(format!(
                "concurrency for '{}' must be at least 1",
                config.subject
            )));
        }

        let subscription = bus.queue_subscribe(&config.subject, &config.group)?;
        let receiver = subscription.receiver;

        let shared = Arc::new(RunnerShared {
            bus,
            subject: config.subject.clone(),
            group: config.group.clone(),
            subscription_id: subscription.id,
            state: AtomicU8::new(RunnerState::Created as u8),
            cancel,
            metrics: Arc::new(RunnerMetrics::default()),
        });

        let mut workers = Vec::with_capacity(config.concurrency);
        for worker_id in 0..config.concurrency {
            let rx = receiver.clone();
            let handler = Arc::clone(&handler);
            let shared_worker = Arc::clone(&shared);

            // SAFETY: the worker only touches values it owns (Arc clones and its
            // own receiver); no thread-local state crosses the coroutine.
            let spawned = unsafe {
                may::coroutine::Builder::new()
                    .name(format!("{}#{worker_id}", config.subject))
                    .stack_size(config.stack_size)
                    .spawn(move || worker_loop(worker_id, &shared_worker, &rx, &handler))
            };

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(
                        subject = %config.subject,
                        worker_id = worker_id,
                        error = %e,
                        "Failed to spawn worker coroutine"
                    );
                    // Closing the subscription lets already spawned workers exit.
                    if let Err(unsub) = shared.bus.unsubscribe(shared.subscription_id) {
                        warn!(subject = %config.subject, error = %unsub, "Rollback unsubscribe failed");
                    }
                    return Err(RpcError::Spawn(e.to_string()));
                }
            }
        }

        // Only the workers' clones may keep the channel open.
        drop(receiver);

        shared
            .state
            .store(RunnerState::Running as u8, Ordering::Release);

        let weak: Weak<RunnerShared> = Arc::downgrade(&shared);
        let cancel_key = shared.cancel.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                if let Err(e) = shared.begin_shutdown() {
                    warn!(subject = %shared.subject, error = %e, "Unsubscribe on cancel failed");
                }
            }
        });

        info!(
            subject = %config.subject,
            group = %config.group,
            concurrency = config.concurrency,
            stack_size = config.stack_size,
            "Runner started"
        );

        Ok(Self {
            shared,
            concurrency: config.concurrency,
            workers: Mutex::new(workers),
            cancel_key: Mutex::new(cancel_key),
        })
    }

    fn forget_cancel_listener(&self) {
        if let Some(key) = self.cancel_key.lock().take() {
            self.shared.cancel.remove_listener(key);
        }
    }

    /// Unsubscribe, let workers drain buffered messages, and join them.
    ///
    /// Idempotent. A failed unsubscribe is returned and leaves the runner running.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.begin_shutdown()?;
        self.forget_cancel_listener();

        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return Ok(());
        }
        for handle in handles {
            if let Err(panic) = handle.join() {
                error!(
                    subject = %self.shared.subject,
                    panic_message = ?panic,
                    "Worker coroutine terminated abnormally"
                );
            }
        }
        self.shared
            .state
            .store(RunnerState::Stopped as u8, Ordering::Release);

        info!(
            subject = %self.shared.subject,
            group = %self.shared.group,
            completed = self.shared.metrics.get_completed(),
            "Runner stopped"
        );
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RunnerMetrics> {
        &self.shared.metrics
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.shared.group
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.shared.subscription_id
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("subject", &self.shared.subject)
            .field("group", &self.shared.group)
            .field("concurrency", &self.concurrency)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        // Workers are left to exit on their own once the channel closes.
        self.forget_cancel_listener();
        if let Err(e) = self.shared.begin_shutdown() {
            warn!(subject = %self.shared.subject, error = %e, "Unsubscribe on drop failed");
        }
    }
}

fn worker_loop(
    worker_id: usize,
    shared: &RunnerShared,
    rx: &mpmc::Receiver<Message>,
    handler: &RawHandler,
) {
    let metrics = &shared.metrics;
    metrics.active_workers.fetch_add(1, Ordering::AcqRel);
    debug!(
        subject = %shared.subject,
        worker_id = worker_id,
        "Worker coroutine started"
    );

    while !shared.cancel.is_cancelled() {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            // Channel closed: unsubscribed and drained
            Err(_) => break,
        };

        if shared.cancel.is_cancelled() {
            debug!(
                subject = %shared.subject,
                worker_id = worker_id,
                "Dropping message picked up after cancellation"
            );
            continue;
        }

        metrics.record_dispatch();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(msg)));
        if let Err(panic) = outcome {
            metrics.record_panic();
            error!(
                subject = %shared.subject,
                worker_id = worker_id,
                panic_message = ?panic,
                "Handler panicked"
            );
        }
        metrics.record_completion();
    }

    metrics.active_workers.fetch_sub(1, Ordering::AcqRel);
    debug!(
        subject = %shared.subject,
        worker_id = worker_id,
        "Worker coroutine exiting"
    );
}
