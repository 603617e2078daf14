//! The flow dispatcher: owns the TUN device handle, the NAT and stats tables
//! and the live-connection registry, and implements the flow callbacks the
//! TUN adapter invokes.

use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::dialer::ProtectedDialer;
use crate::dns::{parse_local_response, StreamPacketConn};
use crate::endpoint::{Address, Endpoint, Network};
use crate::error::{BridgeError, Result};
use crate::nat::NatTable;
use crate::protect::{bind_to_upstream, set_upstream_interface, NoopProtector, Protector};
use crate::proxy::{
    ErrorHandler, LocalDnsLookup, LocalResolver, NameResolver, OutboundHandle, PacketConn,
    ProxyEngine, SocketControl, StreamConn, UidDumper,
};
use crate::registry::{Closable, ConnectionRegistry};
use crate::session::{Inbound, SessionContext, SniffingRequest, TAG_DNS_IN};
use crate::singleflight::SingleFlight;
use crate::stats::{AppStats, AppStatsRegistry};
use crate::tun::{
    FlowHandler, PingWriteBack, Tun, TunImplementation, TunOptions, TunProvider, UdpWriteBack,
};

/// Dispatcher configuration: the recognized keys plus the injected
/// collaborators. Ownership of `fd` transfers to the TUN adapter.
pub struct BridgeConfig {
    pub fd: i32,
    pub protect: bool,
    pub protector: Option<Arc<dyn Protector>>,
    pub mtu: u32,
    pub engine: Arc<dyn ProxyEngine>,
    pub gateway4: String,
    pub gateway6: String,
    pub bind_upstream: Option<Arc<dyn Protector>>,
    /// Name of the upstream network interface; ping sockets are bound to it
    /// when `bind_upstream` is not set.
    pub upstream_interface: Option<String>,
    pub ipv6_mode: i32,
    pub implementation: TunImplementation,
    pub sniffing: bool,
    pub override_destination: bool,
    pub debug: bool,
    pub dump_uid: bool,
    pub traffic_stats: bool,
    pub pcap: bool,
    pub assets_path: PathBuf,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    pub local_resolver: Option<Arc<dyn LocalResolver>>,
    pub uid_dumper: Option<Arc<dyn UidDumper>>,
    pub tun_provider: Arc<dyn TunProvider>,
}

/// The flow dispatcher.
pub struct TunBridge {
    pub(crate) engine: Arc<dyn ProxyEngine>,
    pub(crate) router: String,
    pub(crate) sniffing: bool,
    pub(crate) override_destination: bool,
    pub(crate) debug: bool,
    pub(crate) dump_uid: bool,
    pub(crate) traffic_stats: bool,
    pub(crate) uid_dumper: Option<Arc<dyn UidDumper>>,
    pub(crate) self_uid: u32,
    pub(crate) nat: Arc<NatTable>,
    pub(crate) stats: Arc<AppStatsRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) flights: SingleFlight<String>,
    pub(crate) default_ping_outbound: Option<Arc<dyn OutboundHandle>>,
    device: Mutex<Option<Box<dyn Tun>>>,
}

impl TunBridge {
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>> {
        crate::logging::init(config.debug);

        let protector: Arc<dyn Protector> = if config.protect {
            config
                .protector
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProtector))
        } else {
            Arc::new(NoopProtector)
        };

        let pcap = if config.pcap && config.implementation == TunImplementation::Userspace {
            Some(create_pcap_file(&config.assets_path)?)
        } else {
            None
        };

        let default_ping_outbound = config
            .engine
            .default_outbound()
            .filter(|outbound| outbound.is_wireguard());

        let bridge = Arc::new(Self {
            engine: config.engine.clone(),
            router: config.gateway4.clone(),
            sniffing: config.sniffing,
            override_destination: config.override_destination,
            debug: config.debug,
            dump_uid: config.dump_uid,
            traffic_stats: config.traffic_stats,
            uid_dumper: config.uid_dumper.clone(),
            self_uid: process_uid(),
            nat: Arc::new(NatTable::new()),
            stats: Arc::new(AppStatsRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            flights: SingleFlight::new(),
            default_ping_outbound,
            device: Mutex::new(None),
        });

        let handler: Arc<dyn FlowHandler> = bridge.clone();
        let device = config.tun_provider.open(
            TunOptions {
                fd: config.fd,
                mtu: config.mtu,
                ipv6_mode: config.ipv6_mode,
                implementation: config.implementation,
                pcap,
                error_handler: config.error_handler.clone(),
            },
            handler,
        )?;
        *bridge.device.lock() = Some(device);

        set_upstream_interface(config.upstream_interface.clone());
        bridge.install_hooks(&config, protector);

        Ok(bridge)
    }

    fn install_hooks(&self, config: &BridgeConfig, protector: Arc<dyn Protector>) {
        let engine = &self.engine;

        engine.install_system_dialer(Some(Arc::new(ProtectedDialer::new(
            protector.clone(),
            Arc::new(UpstreamResolver(engine.clone())),
        ))));

        engine.install_dns_dialer(Some(Arc::new(ProtectedDialer::new(
            protector.clone(),
            Arc::new(LocalDnsResolver(engine.clone())),
        ))));

        let control: SocketControl = match &config.bind_upstream {
            Some(bind) => {
                let bind = bind.clone();
                Arc::new(move |fd| {
                    bind.protect(fd);
                })
            }
            None => {
                let protector = protector.clone();
                Arc::new(move |fd| {
                    protector.protect(fd);
                    bind_to_upstream(fd);
                })
            }
        };
        engine.install_ping_socket_control(Some(control));

        match (config.protect, config.local_resolver.clone()) {
            (true, Some(resolver)) => {
                let hook: LocalDnsLookup = Arc::new(move |network: &str, domain: &str| {
                    parse_local_response(resolver.lookup_ip(network, domain))
                });
                engine.install_local_dns_lookup(Some(hook));
            }
            _ => engine.install_local_dns_lookup(None),
        }

        let dial_engine = engine.clone();
        let router = self.router.clone();
        engine.install_bootstrap_dns_dial(Some(Arc::new(
            move || -> BoxFuture<'static, Result<Arc<dyn PacketConn>>> {
                let engine = dial_engine.clone();
                let router = router.clone();
                Box::pin(async move { dial_dns(engine, router).await })
            },
        )));
    }

    /// Tear down: uninstall every installed hook, close the TUN device, then
    /// bulk-close the registry.
    pub fn close(&self) {
        self.engine.install_bootstrap_dns_dial(None);
        self.engine.install_ping_socket_control(None);
        self.engine.install_local_dns_lookup(None);
        self.engine.install_dns_dialer(None);
        self.engine.install_system_dialer(None);

        if let Some(device) = self.device.lock().take() {
            device.close();
        }
        self.connections.close_all();
    }

    /// Number of live registered flow handles.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live NAT entries.
    pub fn nat_count(&self) -> usize {
        self.nat.len()
    }

    /// Aggregated stats for a uid, when traffic accounting has created them.
    pub fn app_stats(&self, uid: u32) -> Option<Arc<AppStats>> {
        self.stats.get(uid)
    }

    pub(crate) fn is_dns(&self, destination: &Endpoint) -> bool {
        destination.address.to_string() == self.router
    }

    /// Resolve the owning uid of a flow; collapses system uids into the
    /// shared bucket and logs the owning app when debug logging is on.
    pub(crate) async fn attribute_flow(
        &self,
        udp: bool,
        is_dns: bool,
        source: &Endpoint,
        destination: &Endpoint,
    ) -> Option<FlowAttribution> {
        if !(self.dump_uid || self.traffic_stats) {
            return None;
        }
        let dumper = self.uid_dumper.as_ref()?;

        let ipv6 = if udp {
            source.is_ipv6()
        } else {
            destination.is_ipv6()
        };
        let raw = match dumper
            .dump_uid(
                ipv6,
                udp,
                &source.address.to_string(),
                source.port,
                &destination.address.to_string(),
                destination.port,
            )
            .await
        {
            Ok(uid) => uid,
            Err(err) => {
                debug!("uid lookup failed: {}", err);
                return None;
            }
        };

        let is_self = raw > 0 && raw == self.self_uid;
        if self.debug && !is_self && raw >= 10000 {
            let tag = match (udp, is_dns) {
                (true, true) => "DNS",
                (true, false) => "UDP",
                (false, _) => "TCP",
            };
            match dumper.uid_info(raw).await {
                Ok(app) => info!(
                    "[{}][{} ({}/{})] {} ==> {}",
                    tag,
                    app.label,
                    raw,
                    app.package_name,
                    source.net_addr(),
                    destination.net_addr()
                ),
                Err(_) => info!("[{}] {} ==> {}", tag, source.net_addr(), destination.net_addr()),
            }
        }

        let uid = if raw < 10000 { 1000 } else { raw };
        Some(FlowAttribution { uid, is_self })
    }

    /// Session context for a TUN-originated flow, with sniffing attached when
    /// enabled and the flow is not DNS.
    pub(crate) fn flow_context(
        &self,
        source: &Endpoint,
        is_dns: bool,
        uid: Option<u32>,
        protocols: &[&'static str],
    ) -> SessionContext {
        let mut inbound = Inbound::tun(source.clone());
        if is_dns {
            inbound.tag = TAG_DNS_IN;
        }
        inbound.uid = uid;

        let mut ctx = SessionContext::new(inbound);
        if self.sniffing && !is_dns {
            ctx = ctx.with_sniffing(SniffingRequest {
                enabled: true,
                protocols: protocols.to_vec(),
                route_only: !self.override_destination,
            });
        }
        ctx
    }
}

/// Uid and self-ness resolved for one flow.
pub(crate) struct FlowAttribution {
    pub(crate) uid: u32,
    pub(crate) is_self: bool,
}

#[async_trait]
impl FlowHandler for TunBridge {
    async fn new_connection(
        &self,
        source: Endpoint,
        destination: Endpoint,
        conn: Box<dyn StreamConn>,
    ) {
        self.handle_tcp(source, destination, conn).await;
    }

    async fn new_packet(
        &self,
        source: Endpoint,
        destination: Endpoint,
        payload: Bytes,
        write_back: UdpWriteBack,
        closer: Arc<dyn Closable>,
    ) {
        self.handle_udp(source, destination, payload, write_back, closer)
            .await;
    }

    async fn new_ping_packet(
        &self,
        source: Endpoint,
        destination: Endpoint,
        message: Bytes,
        write_back: PingWriteBack,
    ) -> bool {
        self.handle_ping(source, destination, message, write_back)
            .await
    }
}

/// Open the bootstrap DNS transport: a UDP session to `<router>:53` through
/// the dispatch core, adapted stream→packet.
async fn dial_dns(engine: Arc<dyn ProxyEngine>, router: String) -> Result<Arc<dyn PacketConn>> {
    let address = match router.parse::<IpAddr>() {
        Ok(ip) => Address::Ip(ip),
        Err(_) => Address::Domain(router),
    };
    let destination = Endpoint::new(Network::Udp, address, 53);
    let remote = destination
        .socket_addr()
        .ok_or(BridgeError::InvalidDestination)?;

    let ctx = SessionContext::new(Inbound::tagged(TAG_DNS_IN));
    let stream = engine.dial_stream(ctx, destination).await?;
    Ok(Arc::new(StreamPacketConn::new(stream, remote)))
}

fn create_pcap_file(assets: &Path) -> Result<File> {
    let dir = assets.join("pcap");
    std::fs::create_dir_all(&dir).map_err(BridgeError::PcapSetup)?;
    let name = format!("{}.pcap", Utc::now().format("%Y-%m-%d %H.%M.%S%.3f UTC"));
    File::create(dir.join(name)).map_err(BridgeError::PcapSetup)
}

#[cfg(unix)]
fn process_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn process_uid() -> u32 {
    0
}

/// Resolver backed by the engine's configured upstream DNS.
struct UpstreamResolver(Arc<dyn ProxyEngine>);

#[async_trait]
impl NameResolver for UpstreamResolver {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.0.lookup_ip(domain).await
    }
}

/// Resolver backed by the engine's local OS DNS path.
struct LocalDnsResolver(Arc<dyn ProxyEngine>);

#[async_trait]
impl NameResolver for LocalDnsResolver {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.0.lookup_ip_local(domain).await
    }
}
