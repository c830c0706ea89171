//! Cooperative cancellation shared between a dispatcher, its runners and
//! in-flight handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener = Box<dyn FnOnce() + Send>;

/// Handle for a registered listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

#[derive(Default)]
struct Listeners {
    next: u64,
    entries: Vec<(u64, Listener)>,
}

struct Inner {
    cancelled: AtomicBool,
    listeners: Mutex<Listeners>,
    /// Set for children: the parent and the key of the listener forwarding to us.
    parent: Option<(Weak<Inner>, ListenerKey)>,
}

impl Inner {
    fn new(parent: Option<(Weak<Inner>, ListenerKey)>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            listeners: Mutex::new(Listeners::default()),
            parent,
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut self.listeners.lock().entries);
        for (_, listener) in entries {
            listener();
        }
    }

    fn remove(&self, key: ListenerKey) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.entries.iter().position(|(k, _)| *k == key.0) {
            Some(index) => {
                drop(listeners.entries.swap_remove(index));
                true
            }
            None => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((parent, key)) = self.parent.take() {
            if let Some(parent) = parent.upgrade() {
                parent.remove(key);
            }
        }
    }
}

/// Cloneable cancellation flag with callbacks.
///
/// Cancelling is one-way. Listeners run once, on the thread that calls
/// [`CancelSignal::cancel`], or immediately if registered afterwards.
/// Listeners can be removed with the key [`CancelSignal::on_cancel`] returns,
/// and a [`child`](CancelSignal::child) unregisters itself from its parent
/// when its last clone is dropped.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Run `f` when this signal is cancelled.
    ///
    /// Returns `None` when the signal was already cancelled, in which case `f`
    /// has run before this returns.
    pub fn on_cancel<F>(&self, f: F) -> Option<ListenerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.inner.listeners.lock();
            // Checked under the lock so a concurrent cancel cannot miss us.
            if !self.is_cancelled() {
                let key = listeners.next;
                listeners.next += 1;
                listeners.entries.push((key, Box::new(f)));
                return Some(ListenerKey(key));
            }
        }
        f();
        None
    }

    /// Drop a listener that has not run yet. Returns false if it already ran
    /// or was removed before.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.inner.remove(key)
    }

    /// Listeners still waiting for cancellation
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }

    /// A signal cancelled together with this one, but cancellable on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let forward = Weak::clone(weak);
            let key = self.on_cancel(move || {
                if let Some(inner) = forward.upgrade() {
                    inner.cancel();
                }
            });
            let child = Inner::new(key.map(|key| (Arc::downgrade(&self.inner), key)));
            if key.is_none() {
                child.cancelled.store(true, Ordering::Release);
            }
            child
        });
        Self { inner }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
