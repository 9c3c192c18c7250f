// Session state observers

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::types::SessionState;

/// Callback invoked with a snapshot on every session change
pub type Listener = Arc<dyn Fn(&SessionState) + Send + Sync>;

/// Registry of session listeners
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    /// Snapshots awaiting delivery, in the order the changes happened
    pending: Mutex<VecDeque<SessionState>>,
    /// Held by the one thread currently delivering `pending`
    delivering: Mutex<()>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `listener`, then invoke it once with the state returned by
    /// `current`. Registering first means a change racing with the
    /// subscription is delivered rather than lost.
    pub fn add<F>(self: &Arc<Self>, listener: Listener, current: F) -> Subscription
    where
        F: FnOnce() -> SessionState,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener.clone()));
        listener(&current());

        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Queue `state` for delivery. Call it while still holding the lock that
    /// ordered the change, then call `flush` once that lock is released.
    pub fn enqueue(&self, state: SessionState) {
        self.pending.lock().push_back(state);
    }

    /// Deliver queued snapshots in order. Only one thread delivers at a
    /// time; a caller that finds delivery in progress leaves its snapshot to
    /// that thread, so listeners never see an older state after a newer one.
    pub fn flush(&self) {
        loop {
            let Some(_delivering) = self.delivering.try_lock() else {
                return;
            };
            loop {
                let next = self.pending.lock().pop_front();
                let Some(state) = next else { break };
                self.notify(&state);
            }
            drop(_delivering);

            // a snapshot queued while we were finishing up
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    /// Invoke every listener with `state`. The lock is not held during calls,
    /// so listeners may subscribe, unsubscribe or read the session.
    pub fn notify(&self, state: &SessionState) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(state);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

/// Handle returned by `SessionManager::subscribe`
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    /// Stop receiving updates. Calling this more than once does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                tracing::debug!(listener = self.id, "Listener removed");
            }
        }
    }
}
