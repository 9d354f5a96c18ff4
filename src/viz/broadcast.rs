//! "State changed, re-render" fan-out between sibling panels.
//!
//! A registry is created once and handed to every panel at construction.
//! Entries are keyed: registering a key that is already present replaces its
//! callback in place, so a panel that remounts before its old guard is dropped
//! never ends up registered twice.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error};

pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    key: &'static str,
    generation: u64,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct BroadcastRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for BroadcastRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&'static str> = lock(&self.inner).entries.iter().map(|e| e.key).collect();
        f.debug_struct("BroadcastRegistry").field("keys", &keys).finish()
    }
}

/// Outcome of one [`BroadcastRegistry::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: &'static str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Callback = Arc::new(callback);
        let mut inner = lock(&self.inner);
        inner.next_generation += 1;
        let generation = inner.next_generation;
        match inner.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                debug!(key, "broadcast callback replaced");
                entry.generation = generation;
                entry.callback = callback;
            }
            None => inner.entries.push(Entry {
                key,
                generation,
                callback,
            }),
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key,
            generation,
        }
    }

    /// Removes `key` whatever its generation. Returns whether it was present.
    pub fn deregister(&self, key: &str) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.entries.len();
        inner.entries.retain(|e| e.key != key);
        inner.entries.len() != before
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner).entries.iter().any(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered callback in registration order.
    ///
    /// Each callback runs in its own panic boundary; a failing one is logged
    /// and the rest still run. The registry lock is not held while callbacks
    /// run, so a callback may register or deregister.
    pub fn dispatch(&self) -> DispatchReport {
        let snapshot: Vec<(&'static str, Callback)> = lock(&self.inner)
            .entries
            .iter()
            .map(|e| (e.key, Arc::clone(&e.callback)))
            .collect();
        let mut report = DispatchReport::default();
        for (key, callback) in snapshot {
            report.invoked += 1;
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                report.failed += 1;
                error!(key, "broadcast callback panicked");
            }
        }
        report
    }
}

/// Registration guard. Dropping it removes the entry, unless the key has since
/// been registered again.
#[derive(Debug)]
#[must_use = "dropping the subscription deregisters the callback"]
pub struct Subscription {
    registry: Weak<Mutex<Inner>>,
    key: &'static str,
    generation: u64,
}

impl Subscription {
    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = lock(&inner);
        inner
            .entries
            .retain(|e| !(e.key == self.key && e.generation == self.generation));
    }
}
