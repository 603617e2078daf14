//! Live-connection registry: insertion-ordered set of closable flow handles
//! with token-based removal and bulk close on shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::proxy::PacketConn;

/// A handle that can be closed from any task; close is idempotent.
pub trait Closable: Send + Sync {
    fn close(&self);
}

/// Opaque removal token returned by [`ConnectionRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

/// Ordered set of live flow handles. Duplicates are allowed; order is
/// insertion order.
pub struct ConnectionRegistry {
    entries: Mutex<BTreeMap<u64, Arc<dyn Closable>>>,
    next: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, handle: Arc<dyn Closable>) -> Token {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, handle);
        Token(id)
    }

    pub fn remove(&self, token: Token) -> Option<Arc<dyn Closable>> {
        self.entries.lock().remove(&token.0)
    }

    /// Close every registered handle exactly once. Entries are drained under
    /// the lock and closed outside it, so no handle can be both closed and
    /// re-inserted.
    pub fn close_all(&self) {
        let drained: Vec<Arc<dyn Closable>> = {
            let mut entries = self.entries.lock();
            std::mem::take(&mut *entries).into_values().collect()
        };
        debug!("closing {} live connections", drained.len());
        for handle in drained {
            handle.close();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry adapter for packet connections.
pub(crate) struct ConnHandle(pub(crate) Arc<dyn PacketConn>);

impl Closable for ConnHandle {
    fn close(&self) {
        self.0.close();
    }
}

/// Closable flag with a wakeup, used as the registry handle for stream flows:
/// closing it interrupts the flow's copy task.
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the signal fires; returns immediately if already closed.
    pub async fn wait(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl Closable for CloseSignal {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
