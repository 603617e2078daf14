//! Per-app traffic accounting: aggregated counters keyed by uid, with
//! single-flight creation and byte-counting connection decorators.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::proxy::PacketConn;
use crate::singleflight::{Flight, SingleFlight};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Aggregated counters for one uid. Every field is an atomic; readers never
/// take a lock.
#[derive(Debug, Default)]
pub struct AppStats {
    uplink: AtomicU64,
    downlink: AtomicU64,
    tcp_conn: AtomicI32,
    udp_conn: AtomicI32,
    tcp_conn_total: AtomicU32,
    udp_conn_total: AtomicU32,
    /// Unix seconds when the last live connection dropped to zero, else 0.
    deactivate_at: AtomicI64,
}

impl AppStats {
    pub fn add_uplink(&self, bytes: u64) {
        self.uplink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, bytes: u64) {
        self.downlink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }

    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }

    pub fn tcp_conn(&self) -> i32 {
        self.tcp_conn.load(Ordering::Relaxed)
    }

    pub fn udp_conn(&self) -> i32 {
        self.udp_conn.load(Ordering::Relaxed)
    }

    pub fn tcp_conn_total(&self) -> u32 {
        self.tcp_conn_total.load(Ordering::Relaxed)
    }

    pub fn udp_conn_total(&self) -> u32 {
        self.udp_conn_total.load(Ordering::Relaxed)
    }

    pub fn deactivate_at(&self) -> i64 {
        self.deactivate_at.load(Ordering::Relaxed)
    }

    pub fn open_tcp(&self) {
        self.tcp_conn.fetch_add(1, Ordering::Relaxed);
        self.tcp_conn_total.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::Relaxed);
    }

    pub fn close_tcp(&self) {
        let live = self.tcp_conn.fetch_sub(1, Ordering::Relaxed) - 1;
        if live + self.udp_conn.load(Ordering::Relaxed) == 0 {
            self.deactivate_at.store(unix_now(), Ordering::Relaxed);
        }
    }

    pub fn open_udp(&self) {
        self.udp_conn.fetch_add(1, Ordering::Relaxed);
        self.udp_conn_total.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::Relaxed);
    }

    pub fn close_udp(&self) {
        let live = self.udp_conn.fetch_sub(1, Ordering::Relaxed) - 1;
        if live + self.tcp_conn.load(Ordering::Relaxed) == 0 {
            self.deactivate_at.store(unix_now(), Ordering::Relaxed);
        }
    }
}

/// Per-uid stats registry with single-flight creation: a concurrent burst of
/// lookups for a fresh uid installs exactly one [`AppStats`].
pub struct AppStatsRegistry {
    stats: DashMap<u32, Arc<AppStats>>,
    flights: SingleFlight<u32>,
}

impl AppStatsRegistry {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
            flights: SingleFlight::new(),
        }
    }

    pub async fn get_or_create(&self, uid: u32) -> Arc<AppStats> {
        loop {
            if let Some(stats) = self.stats.get(&uid) {
                return stats.value().clone();
            }
            match self.flights.begin(uid) {
                Flight::Leader(guard) => {
                    let stats = Arc::new(AppStats::default());
                    self.stats.insert(uid, stats.clone());
                    drop(guard);
                    return stats;
                }
                // Re-check the table on the next loop turn; the wakeup alone
                // proves nothing.
                Flight::Follower(waiter) => waiter.wait().await,
            }
        }
    }

    pub fn get(&self, uid: u32) -> Option<Arc<AppStats>> {
        self.stats.get(&uid).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

impl Default for AppStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pin_project! {
    /// Byte-counting stream decorator: writes through it count as uplink,
    /// reads as downlink.
    pub struct CountedStream<S> {
        #[pin]
        inner: S,
        stats: Arc<AppStats>,
    }
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, stats: Arc<AppStats>) -> Self {
        Self { inner, stats }
    }
}

impl<S: AsyncRead> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.stats
                    .add_downlink((buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.stats.add_uplink(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Byte-counting decorator over a packet connection, same direction mapping
/// as [`CountedStream`].
pub struct CountedPacketConn {
    inner: Arc<dyn PacketConn>,
    stats: Arc<AppStats>,
}

impl CountedPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, stats: Arc<AppStats>) -> Self {
        Self { inner, stats }
    }
}

#[async_trait]
impl PacketConn for CountedPacketConn {
    async fn read_from(&self) -> io::Result<(Bytes, Option<SocketAddr>)> {
        let (payload, addr) = self.inner.read_from().await?;
        self.stats.add_downlink(payload.len() as u64);
        Ok((payload, addr))
    }

    async fn write_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let written = self.inner.write_to(payload, dest).await?;
        self.stats.add_uplink(written as u64);
        Ok(written)
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn concurrent_get_or_create_installs_one_instance() {
        let registry = Arc::new(AppStatsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create(10042).await },
            ));
        }
        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        let first = &instances[0];
        assert!(instances.iter().all(|stats| Arc::ptr_eq(stats, first)));
    }

    #[test]
    fn deactivate_tracks_live_connection_count() {
        let stats = AppStats::default();
        assert_eq!(stats.deactivate_at(), 0);

        stats.open_tcp();
        stats.open_udp();
        assert_eq!(stats.tcp_conn(), 1);
        assert_eq!(stats.udp_conn(), 1);
        assert_eq!(stats.deactivate_at(), 0);

        stats.close_tcp();
        // One UDP connection still live.
        assert_eq!(stats.deactivate_at(), 0);

        stats.close_udp();
        assert!(stats.deactivate_at() > 0);
        assert_eq!(stats.tcp_conn_total(), 1);
        assert_eq!(stats.udp_conn_total(), 1);

        // A new connection clears the stamp again.
        stats.open_tcp();
        assert_eq!(stats.deactivate_at(), 0);
    }

    #[tokio::test]
    async fn counted_stream_attributes_directions() {
        let stats = Arc::new(AppStats::default());
        let (near, mut far) = tokio::io::duplex(1024);
        let mut counted = CountedStream::new(near, stats.clone());

        counted.write_all(b"hello").await.unwrap();
        assert_eq!(stats.uplink(), 5);

        far.write_all(b"world!!").await.unwrap();
        let mut buf = [0u8; 16];
        let read = counted.read(&mut buf).await.unwrap();
        assert_eq!(read, 7);
        assert_eq!(stats.downlink(), 7);
    }
}
