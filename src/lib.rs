//! Userspace TUN-to-proxy flow bridge.
//!
//! `tunbridge` receives flow callbacks from a TUN adapter, reconstructs
//! per-flow TCP, UDP and ICMP-Echo sessions, and forwards each flow's payload
//! into a pluggable proxy dispatch core:
//!
//! - per-flow TCP termination with byte relay into the dispatch pipe
//! - a UDP NAT table keyed by source endpoint with single-flight creation
//! - an ICMP-Echo pseudo-flow table with routing-driven handler selection
//! - per-app traffic attribution with aggregated counters
//! - a live-connection registry for bulk teardown
//! - a socket-protecting dialer so outbound sockets escape TUN re-routing
//!
//! The TUN adapters (user-space IP stack or kernel-assisted), the proxy
//! dispatch core, DNS services and the uid lookup service are external
//! collaborators injected through the traits in [`proxy`] and [`tun`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunbridge::{BridgeConfig, TunBridge};
//! use tunbridge::tun::TunImplementation;
//!
//! let bridge = TunBridge::new(BridgeConfig {
//!     fd: tun_fd,
//!     protect: true,
//!     protector: Some(protector),
//!     mtu: 1500,
//!     engine,
//!     gateway4: "172.19.0.2".into(),
//!     gateway6: "fdfe:dcba:9876::2".into(),
//!     bind_upstream: None,
//!     upstream_interface: Some("wlan0".into()),
//!     ipv6_mode: 0,
//!     implementation: TunImplementation::Userspace,
//!     sniffing: true,
//!     override_destination: false,
//!     debug: false,
//!     dump_uid: false,
//!     traffic_stats: true,
//!     pcap: false,
//!     assets_path: assets.into(),
//!     error_handler: None,
//!     local_resolver: Some(local_resolver),
//!     uid_dumper: Some(uid_dumper),
//!     tun_provider,
//! })?;
//! // ... run until the VPN service stops ...
//! bridge.close();
//! ```

pub mod archive;
pub mod bridge;
pub mod dialer;
pub mod dns;
pub mod endpoint;
pub mod error;
mod logging;
pub mod nat;
mod ping;
pub mod protect;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod singleflight;
pub mod stats;
mod tcp;
#[cfg(test)]
mod tests;
pub mod tun;
mod udp;

pub use bridge::{BridgeConfig, TunBridge};
pub use endpoint::{Address, Endpoint, Network};
pub use error::{BridgeError, Result};
pub use proxy::{
    DialedConn, ErrorHandler, LocalResolver, NameResolver, OutboundHandle, PacketConn,
    ProxyEngine, SockOpts, StreamConn, SystemDialer, UidDumper, UidInfo,
};
pub use session::{set_network_type, set_wifi_ssid, Inbound, Link, SessionContext, SniffingRequest};
