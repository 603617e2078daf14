//! Keyed single-flight: at most one creator per key runs at a time, everyone
//! else waits for its completion broadcast and re-checks the target table.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

/// Transient table of in-flight creations.
///
/// The leader holds a [`FlightGuard`]; dropping it removes the key and wakes
/// every waiter, so the entry is released on every exit path, including
/// failed creations. Waiters must re-check their target table after waking:
/// the wakeup only means the leader finished, not that it succeeded.
pub struct SingleFlight<K: Eq + Hash + Clone> {
    inflight: Arc<DashMap<K, Arc<Notify>>>,
}

/// Outcome of contending for a key.
pub enum Flight<K: Eq + Hash + Clone> {
    /// This caller won the race and must perform the creation.
    Leader(FlightGuard<K>),
    /// Another caller is creating; await [`Waiter::wait`].
    Follower(Waiter<K>),
}

/// Held by the leader for the duration of the creation.
pub struct FlightGuard<K: Eq + Hash + Clone> {
    inflight: Arc<DashMap<K, Arc<Notify>>>,
    key: K,
    notify: Arc<Notify>,
}

/// Held by a follower until the leader finishes.
pub struct Waiter<K: Eq + Hash + Clone> {
    inflight: Arc<DashMap<K, Arc<Notify>>>,
    key: K,
    notify: Arc<Notify>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn begin(&self, key: K) -> Flight<K> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Flight::Follower(Waiter {
                inflight: self.inflight.clone(),
                key,
                notify: entry.get().clone(),
            }),
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                Flight::Leader(FlightGuard {
                    inflight: self.inflight.clone(),
                    key,
                    notify,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
        self.notify.notify_waiters();
    }
}

impl<K: Eq + Hash + Clone> Waiter<K> {
    /// Wait until the leader for this key finishes; returns immediately if it
    /// already has.
    pub async fn wait(self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking, so a broadcast between the check and the
        // await is not lost.
        notified.as_mut().enable();
        let in_flight = match self.inflight.get(&self.key) {
            Some(current) => Arc::ptr_eq(current.value(), &self.notify),
            None => false,
        };
        if !in_flight {
            return;
        }
        notified.await;
    }
}
