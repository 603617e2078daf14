//! UDP/ping NAT table: source-side flow identity mapped to the live outbound
//! packet connection carrying that flow.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::proxy::PacketConn;

/// FlowKey → PacketConn. A key is present iff its connection is live and
/// registered; only the single-flight creator inserts, only the reverse pump
/// removes.
pub struct NatTable {
    entries: DashMap<String, Arc<dyn PacketConn>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Send `payload` through the entry for `key`, if any. A write error
    /// closes the connection but still counts as handled: the flow observed
    /// a failure and its reverse pump tears the entry down.
    pub async fn try_send(&self, key: &str, payload: &[u8], dest: SocketAddr) -> bool {
        let conn = match self.entries.get(key) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        if let Err(err) = conn.write_to(payload, dest).await {
            debug!("write on {} failed: {}", key, err);
            conn.close();
        }
        true
    }

    pub fn insert(&self, key: String, conn: Arc<dyn PacketConn>) {
        self.entries.insert(key, conn);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        self.entries.remove(key).map(|(_, conn)| conn)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingConn {
        sent: AtomicUsize,
        fail_writes: bool,
        closed: AtomicBool,
    }

    impl RecordingConn {
        fn new(fail_writes: bool) -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail_writes,
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PacketConn for RecordingConn {
        async fn read_from(&self) -> io::Result<(Bytes, Option<SocketAddr>)> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        async fn write_to(&self, payload: &[u8], _dest: SocketAddr) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.sent.fetch_add(payload.len(), Ordering::SeqCst);
            Ok(payload.len())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn dest() -> SocketAddr {
        "8.8.8.8:53".parse().unwrap()
    }

    #[tokio::test]
    async fn try_send_misses_without_entry() {
        let nat = NatTable::new();
        assert!(!nat.try_send("10.0.0.1:5000", b"x", dest()).await);
    }

    #[tokio::test]
    async fn try_send_delivers_through_entry() {
        let nat = NatTable::new();
        let conn = Arc::new(RecordingConn::new(false));
        nat.insert("10.0.0.1:5000".into(), conn.clone());

        assert!(nat.try_send("10.0.0.1:5000", b"abcd", dest()).await);
        assert_eq!(conn.sent.load(Ordering::SeqCst), 4);
        assert!(!conn.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_error_closes_but_counts_as_handled() {
        let nat = NatTable::new();
        let conn = Arc::new(RecordingConn::new(true));
        nat.insert("k".into(), conn.clone());

        assert!(nat.try_send("k", b"abcd", dest()).await);
        assert!(conn.closed.load(Ordering::SeqCst));
        // The entry itself is left for the reverse pump to remove.
        assert!(nat.get("k").is_some());
    }
}
