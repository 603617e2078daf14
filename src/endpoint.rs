//! Flow endpoint model: an (address, port, network) triple where the address
//! may be a literal IP or a still-unresolved domain.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport network of a flow endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
    Ping,
    Unknown,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
            Network::Ping => "ping",
            Network::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Destination address: a literal IP or a domain to be resolved downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Domain(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Address::Domain(domain) if domain.is_empty())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => f.write_str(domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// A flow endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Endpoint {
    pub fn new(network: Network, address: Address, port: u16) -> Self {
        Self {
            network,
            address,
            port,
        }
    }

    pub fn ip(network: Network, ip: IpAddr, port: u16) -> Self {
        Self::new(network, Address::Ip(ip), port)
    }

    pub fn domain<S: Into<String>>(network: Network, domain: S, port: u16) -> Self {
        Self::new(network, Address::Domain(domain.into()), port)
    }

    /// A destination is dialable only with a known network and a non-empty
    /// address.
    pub fn is_valid(&self) -> bool {
        self.network != Network::Unknown && !self.address.is_empty()
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.address, Address::Ip(IpAddr::V6(_)))
    }

    /// Canonical `host:port` rendering; IPv6 hosts are bracketed.
    pub fn net_addr(&self) -> String {
        match &self.address {
            Address::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            other => format!("{}:{}", other, self.port),
        }
    }

    /// The socket address, when the endpoint carries a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.net_addr())
    }
}
