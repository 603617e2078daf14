//! Protected dialer: raw socket construction with the fd-protect hook run
//! before connect, so outbound sockets bypass the TUN re-routing loop.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::endpoint::{Address, Endpoint, Network};
use crate::error::{BridgeError, Result};
use crate::protect::Protector;
use crate::proxy::{DialedConn, NameResolver, PacketConn, SockOpts, SystemDialer};

/// Upper bound on a single outbound connect attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_DATAGRAM: usize = 65535;

/// Dialer that creates raw sockets, runs the fd-protect hook and applies
/// socket options before connecting.
pub struct ProtectedDialer {
    protector: Arc<dyn Protector>,
    resolver: Arc<dyn NameResolver>,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn Protector>, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            protector,
            resolver,
        }
    }

    /// Dial `destination`, resolving a domain address through the injected
    /// resolver and trying candidate IPs in resolver order.
    pub async fn dial(
        &self,
        destination: &Endpoint,
        opts: Option<&SockOpts>,
    ) -> Result<DialedConn> {
        if !destination.is_valid() {
            warn!("connect to invalid destination: {}", destination);
            return Err(BridgeError::InvalidDestination);
        }

        let ips = match &destination.address {
            Address::Domain(domain) => {
                let ips = self.resolver.lookup_ip(domain).await?;
                if ips.is_empty() {
                    return Err(BridgeError::EmptyDnsResponse);
                }
                ips
            }
            Address::Ip(ip) => vec![*ip],
        };

        let mut last_err = None;
        for ip in ips {
            if let Some(err) = &last_err {
                warn!("dial system failed: {}", err);
                debug!("trying next address: {}", ip);
            }
            match self
                .dial_ip(ip, destination.port, destination.network, opts)
                .await
            {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(BridgeError::EmptyDnsResponse))
    }

    async fn dial_ip(
        &self,
        ip: IpAddr,
        port: u16,
        network: Network,
        opts: Option<&SockOpts>,
    ) -> Result<DialedConn> {
        match timeout(DIAL_TIMEOUT, self.connect(ip, port, network, opts)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Connect(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }

    async fn connect(
        &self,
        ip: IpAddr,
        port: u16,
        network: Network,
        opts: Option<&SockOpts>,
    ) -> Result<DialedConn> {
        let domain = if ip.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = match network {
            Network::Tcp => Socket::new(domain, Type::STREAM, Some(Protocol::TCP)),
            Network::Udp => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)),
            Network::Unix => Socket::new(domain, Type::STREAM, None),
            Network::Ping | Network::Unknown => return Err(BridgeError::InvalidDestination),
        }
        .map_err(BridgeError::SocketCreate)?;

        if !self.protector.protect(socket.as_raw_fd() as i32) {
            return Err(BridgeError::ProtectFailed);
        }
        if let Some(opts) = opts {
            apply_sockopts(&socket, network, opts)?;
        }

        socket.set_nonblocking(true).map_err(BridgeError::Connect)?;
        let addr = SocketAddr::new(ip, port);
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(BridgeError::Connect(err)),
        }

        match network {
            Network::Udp => {
                // connect(2) on a datagram socket only pins the peer.
                let std_socket: std::net::UdpSocket = socket.into();
                let socket =
                    tokio::net::UdpSocket::from_std(std_socket).map_err(BridgeError::Connect)?;
                Ok(DialedConn::Packet(Arc::new(FixedRemoteUdp::new(
                    socket, addr,
                ))))
            }
            _ => {
                let std_stream: std::net::TcpStream = socket.into();
                let stream =
                    tokio::net::TcpStream::from_std(std_stream).map_err(BridgeError::Connect)?;
                stream.writable().await.map_err(BridgeError::Connect)?;
                if let Some(err) = stream.take_error().map_err(BridgeError::Connect)? {
                    return Err(BridgeError::Connect(err));
                }
                Ok(DialedConn::Stream(stream))
            }
        }
    }
}

fn apply_sockopts(socket: &Socket, network: Network, opts: &SockOpts) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Some(device) = &opts.bind_interface {
            socket
                .bind_device(Some(device.as_bytes()))
                .map_err(BridgeError::Connect)?;
        }
        if let Some(mark) = opts.fwmark {
            socket.set_mark(mark).map_err(BridgeError::Connect)?;
        }
    }
    if network == Network::Tcp {
        if let Some(interval) = opts.tcp_keep_alive {
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            socket
                .set_tcp_keepalive(&keepalive)
                .map_err(BridgeError::Connect)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SystemDialer for ProtectedDialer {
    async fn dial(
        &self,
        _source: Option<&Endpoint>,
        destination: &Endpoint,
        opts: Option<&SockOpts>,
    ) -> Result<DialedConn> {
        ProtectedDialer::dial(self, destination, opts).await
    }
}

/// Connected UDP socket exposed as a packet conn with a fixed remote: writes
/// ignore the requested destination, reads report the peer.
pub struct FixedRemoteUdp {
    socket: tokio::net::UdpSocket,
    remote: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
}

impl FixedRemoteUdp {
    pub fn new(socket: tokio::net::UdpSocket, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
    }
}

#[async_trait]
impl PacketConn for FixedRemoteUdp {
    async fn read_from(&self) -> io::Result<(Bytes, Option<SocketAddr>)> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_err());
        }
        tokio::select! {
            _ = notified => Err(Self::closed_err()),
            received = async {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let read = self.socket.recv(&mut buf).await?;
                buf.truncate(read);
                Ok::<_, io::Error>(buf)
            } => {
                let buf = received?;
                Ok((Bytes::from(buf), Some(self.remote)))
            }
        }
    }

    async fn write_to(&self, payload: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_err());
        }
        self.socket.send(payload).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}
