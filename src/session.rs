//! Session annotations attached to every flow handed to the dispatch core,
//! and the process-wide ambient network state stamped into them.

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;

/// Inbound tag for flows originating inside the TUN.
pub const TAG_TUN: &str = "tun";
/// Inbound tag for DNS-destined flows, routed through the DNS inbound.
pub const TAG_DNS_IN: &str = "dns-in";

static NETWORK_TYPE: RwLock<Option<String>> = RwLock::new(None);
static WIFI_SSID: RwLock<Option<String>> = RwLock::new(None);

/// Record the ambient network type ("wifi", "cellular", ...) reported by the
/// platform layer.
pub fn set_network_type(value: Option<String>) {
    *NETWORK_TYPE.write() = value;
}

/// Record the ambient Wi-Fi SSID reported by the platform layer.
pub fn set_wifi_ssid(value: Option<String>) {
    *WIFI_SSID.write() = value;
}

pub(crate) fn network_type() -> Option<String> {
    NETWORK_TYPE.read().clone()
}

pub(crate) fn wifi_ssid() -> Option<String> {
    WIFI_SSID.read().clone()
}

/// Ingress-leg annotation of a session.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: Option<Endpoint>,
    pub tag: &'static str,
    pub uid: Option<u32>,
    pub network_type: Option<String>,
    pub wifi_ssid: Option<String>,
}

impl Inbound {
    /// Inbound for a flow terminated from the TUN, stamped with the ambient
    /// network state.
    pub fn tun(source: Endpoint) -> Self {
        Self {
            source: Some(source),
            tag: TAG_TUN,
            uid: None,
            network_type: network_type(),
            wifi_ssid: wifi_ssid(),
        }
    }

    /// Source-less inbound carrying only a tag (bootstrap DNS sessions).
    pub fn tagged(tag: &'static str) -> Self {
        Self {
            source: None,
            tag,
            uid: None,
            network_type: None,
            wifi_ssid: None,
        }
    }
}

/// First-bytes protocol sniffing request.
#[derive(Debug, Clone)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub protocols: Vec<&'static str>,
    /// Use the sniffed hostname for routing only, without rewriting the
    /// destination.
    pub route_only: bool,
}

/// Session context handed to the dispatch core with every operation.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub inbound: Inbound,
    pub sniffing: Option<SniffingRequest>,
    pub protocol: Option<&'static str>,
    pub outbound_target: Option<Endpoint>,
}

impl SessionContext {
    pub fn new(inbound: Inbound) -> Self {
        Self {
            inbound,
            sniffing: None,
            protocol: None,
            outbound_target: None,
        }
    }

    pub fn with_sniffing(mut self, request: SniffingRequest) -> Self {
        self.sniffing = Some(request);
        self
    }

    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_outbound_target(mut self, target: Endpoint) -> Self {
        self.outbound_target = Some(target);
        self
    }
}

/// One dispatched TCP flow's link: the core reads the flow's upload bytes
/// from `reader` and writes responses into `writer`.
pub struct Link {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}
