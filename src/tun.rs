//! TUN adapter collaborator interface: the device handle, its provider and
//! the flow callbacks the adapter invokes on the dispatcher.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::proxy::{ErrorHandler, StreamConn};
use crate::registry::Closable;

/// Which TUN adapter implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunImplementation {
    /// User-space IP stack.
    Userspace,
    /// Kernel-assisted variant.
    Kernel,
}

impl TunImplementation {
    /// Decode the numeric selector used across the FFI boundary.
    pub fn from_i32(value: i32) -> Self {
        if value == 1 {
            TunImplementation::Kernel
        } else {
            TunImplementation::Userspace
        }
    }
}

/// Options handed to the TUN provider when the device is opened. Ownership of
/// the file descriptor transfers to the adapter.
pub struct TunOptions {
    pub fd: i32,
    pub mtu: u32,
    pub ipv6_mode: i32,
    pub implementation: TunImplementation,
    /// Capture file; set only for the user-space implementation when pcap is
    /// enabled.
    pub pcap: Option<File>,
    /// Async error sink; consumed only by the kernel-assisted implementation.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

/// Handle to a running TUN adapter.
pub trait Tun: Send + Sync {
    fn close(&self);
}

/// Factory for TUN adapters; both implementations are provided externally and
/// are opaque to the dispatcher.
pub trait TunProvider: Send + Sync {
    fn open(&self, options: TunOptions, handler: Arc<dyn FlowHandler>) -> Result<Box<dyn Tun>>;
}

/// Write-back for UDP: deliver a datagram into the TUN, optionally rewriting
/// the reported source to `addr`.
pub type UdpWriteBack = Arc<dyn Fn(&[u8], Option<SocketAddr>) -> io::Result<usize> + Send + Sync>;

/// Write-back for ICMP Echo replies.
pub type PingWriteBack = Arc<dyn Fn(&[u8]) -> io::Result<()> + Send + Sync>;

/// Flow callbacks invoked by the TUN adapter.
///
/// Callbacks may arrive concurrently from arbitrary tasks. `new_connection`
/// and `new_packet` run for the life of the flow, so adapters are expected to
/// spawn them; `new_ping_packet` returns as soon as the echo is accepted or
/// declined.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    /// A new TCP flow with its bidirectional stream.
    async fn new_connection(
        &self,
        source: Endpoint,
        destination: Endpoint,
        conn: Box<dyn StreamConn>,
    );

    /// One UDP datagram; `closer` releases adapter-side per-flow resources.
    async fn new_packet(
        &self,
        source: Endpoint,
        destination: Endpoint,
        payload: Bytes,
        write_back: UdpWriteBack,
        closer: Arc<dyn Closable>,
    );

    /// One ICMP Echo request. Returning false declines it and the adapter
    /// answers with an ICMP error.
    async fn new_ping_packet(
        &self,
        source: Endpoint,
        destination: Endpoint,
        message: Bytes,
        write_back: PingWriteBack,
    ) -> bool;
}
