//! Interfaces of the external collaborators: the proxy dispatch core, its
//! outbound handlers, the uid lookup service and the platform DNS resolver.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::session::{Link, SessionContext};

/// Alias for bidirectional byte streams handed across the bridge boundary.
pub trait StreamConn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamConn for T {}

/// Datagram-oriented connection produced by the dispatch core or the dialer.
///
/// `write_to` must accept concurrent callers; `read_from` is only ever driven
/// from a single reverse-pump task. `close` is idempotent and fails any
/// pending or future reads.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn read_from(&self) -> io::Result<(Bytes, Option<SocketAddr>)>;
    async fn write_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize>;
    fn close(&self);
}

/// Named outbound handler owned by the dispatch core.
pub trait OutboundHandle: Send + Sync {
    fn tag(&self) -> &str;

    /// Whether this outbound is a WireGuard endpoint, the only kind eligible
    /// as the fallback ping route.
    fn is_wireguard(&self) -> bool {
        false
    }
}

/// Application info for a resolved uid; used only for logging.
#[derive(Debug, Clone)]
pub struct UidInfo {
    pub label: String,
    pub package_name: String,
}

/// Socket-owner attribution service.
#[async_trait]
pub trait UidDumper: Send + Sync {
    async fn dump_uid(
        &self,
        ipv6: bool,
        udp: bool,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
    ) -> Result<u32>;

    async fn uid_info(&self, uid: u32) -> Result<UidInfo>;
}

/// Platform resolver speaking the OS DNS. Success is a comma-separated IP
/// list; failure is an error string that may carry an `"rcode <n>"` prefix.
pub trait LocalResolver: Send + Sync {
    fn lookup_ip(&self, network: &str, domain: &str) -> std::result::Result<String, String>;
}

/// Async error sink, consumed by the kernel-assisted TUN variant.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, message: &str);
}

/// Name resolution strategy injected into the protected dialer.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

/// Socket options applied to an outbound socket before connect.
#[derive(Debug, Clone, Default)]
pub struct SockOpts {
    pub bind_interface: Option<String>,
    pub fwmark: Option<u32>,
    pub tcp_keep_alive: Option<Duration>,
}

/// Connection produced by a system dialer.
pub enum DialedConn {
    Stream(tokio::net::TcpStream),
    Packet(Arc<dyn PacketConn>),
}

/// Outbound socket factory installed process-wide on the dispatch core.
#[async_trait]
pub trait SystemDialer: Send + Sync {
    async fn dial(
        &self,
        source: Option<&Endpoint>,
        destination: &Endpoint,
        opts: Option<&SockOpts>,
    ) -> Result<DialedConn>;
}

/// Local-DNS lookup hook installed on the dispatch core.
pub type LocalDnsLookup = Arc<dyn Fn(&str, &str) -> Result<Vec<IpAddr>> + Send + Sync>;

/// Raw-fd control hook applied to ping sockets before use.
pub type SocketControl = Arc<dyn Fn(i32) + Send + Sync>;

/// Factory for the process resolver's bootstrap DNS transport.
pub type BootstrapDnsDial =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn PacketConn>>> + Send + Sync>;

/// The proxy dispatch core: binds inbound contexts to outbound handlers and
/// produces bidirectional links.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Bind a TCP session context to an outbound and relay over `link` until
    /// either side ends.
    async fn dispatch_link(
        &self,
        ctx: SessionContext,
        destination: Endpoint,
        link: Link,
    ) -> Result<()>;

    /// Open an outbound UDP session with the given idle timeout.
    async fn dial_udp(
        &self,
        ctx: SessionContext,
        destination: Endpoint,
        idle_timeout: Duration,
    ) -> Result<Arc<dyn PacketConn>>;

    /// Open an outbound stream through full dispatch (bootstrap DNS glue).
    async fn dial_stream(
        &self,
        ctx: SessionContext,
        destination: Endpoint,
    ) -> Result<Box<dyn StreamConn>>;

    /// Pick an outbound tag for the context.
    fn pick_route(&self, ctx: &SessionContext) -> Result<String>;

    fn outbound(&self, tag: &str) -> Option<Arc<dyn OutboundHandle>>;

    fn default_outbound(&self) -> Option<Arc<dyn OutboundHandle>>;

    /// Open an ICMP-Echo pseudo session on a specific outbound handler.
    async fn dial_ping(
        &self,
        ctx: SessionContext,
        outbound: Arc<dyn OutboundHandle>,
        destination: Endpoint,
        idle_timeout: Duration,
    ) -> Result<Arc<dyn PacketConn>>;

    /// Resolve a domain through the configured upstream DNS.
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>>;

    /// Resolve a domain through the local OS DNS path.
    async fn lookup_ip_local(&self, domain: &str) -> Result<Vec<IpAddr>>;

    // Process-wide hook installation; passing None uninstalls the hook.

    fn install_system_dialer(&self, dialer: Option<Arc<dyn SystemDialer>>);
    fn install_dns_dialer(&self, dialer: Option<Arc<dyn SystemDialer>>);
    fn install_local_dns_lookup(&self, hook: Option<LocalDnsLookup>);
    fn install_ping_socket_control(&self, hook: Option<SocketControl>);
    fn install_bootstrap_dns_dial(&self, hook: Option<BootstrapDnsDial>);
}
