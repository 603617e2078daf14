//! Per-flow UDP termination: NAT fast path, single-flight creation of the
//! outbound session, and the reverse-path pump feeding replies back into the
//! TUN.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use crate::bridge::TunBridge;
use crate::endpoint::Endpoint;
use crate::proxy::PacketConn;
use crate::registry::{Closable, ConnHandle};
use crate::singleflight::Flight;
use crate::stats::CountedPacketConn;
use crate::tun::UdpWriteBack;

/// Idle timeout passed to the proxy core for UDP sessions.
const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

impl TunBridge {
    pub(crate) async fn handle_udp(
        &self,
        source: Endpoint,
        destination: Endpoint,
        payload: Bytes,
        write_back: UdpWriteBack,
        closer: Arc<dyn Closable>,
    ) {
        let nat_key = source.net_addr();
        let Some(dest_addr) = destination.socket_addr() else {
            closer.close();
            return;
        };

        if self.nat.try_send(&nat_key, &payload, dest_addr).await {
            closer.close();
            return;
        }

        let guard = match self.flights.begin(nat_key.clone()) {
            Flight::Follower(waiter) => {
                waiter.wait().await;
                self.nat.try_send(&nat_key, &payload, dest_addr).await;
                closer.close();
                return;
            }
            Flight::Leader(guard) => guard,
        };

        let is_dns = self.is_dns(&destination);
        let attribution = self.attribute_flow(true, is_dns, &source, &destination).await;
        let uid = attribution.as_ref().map(|a| a.uid);
        let is_self = attribution.as_ref().map(|a| a.is_self).unwrap_or(false);

        let ctx = self.flow_context(&source, is_dns, uid, &["quic"]);

        let conn = match self
            .engine
            .dial_udp(ctx, destination.clone(), UDP_SESSION_TIMEOUT)
            .await
        {
            Ok(conn) => conn,
            Err(err) => {
                error!("[UDP] dial failed: {}", err);
                closer.close();
                drop(guard);
                return;
            }
        };

        let stats = if self.traffic_stats && !is_self && !is_dns {
            Some(self.stats.get_or_create(uid.unwrap_or(0)).await)
        } else {
            None
        };
        let conn: Arc<dyn PacketConn> = match &stats {
            Some(stats) => Arc::new(CountedPacketConn::new(conn, stats.clone())),
            None => conn,
        };
        if let Some(stats) = &stats {
            stats.open_udp();
        }

        let token = self.connections.insert(Arc::new(ConnHandle(conn.clone())));
        self.nat.insert(nat_key.clone(), conn.clone());

        // The initial send goes through the table off-task; waiters racing in
        // behind it retry the same way.
        {
            let nat = self.nat.clone();
            let key = nat_key.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                nat.try_send(&key, &payload, dest_addr).await;
            });
        }

        drop(guard);

        loop {
            let (buffer, addr) = match conn.read_from().await {
                Ok(received) => received,
                Err(err) => {
                    debug!("[UDP] session {} ended: {}", nat_key, err);
                    break;
                }
            };
            let reply_addr = if is_dns { None } else { addr };
            if let Err(err) = write_back(&buffer, reply_addr) {
                debug!("[UDP] write back for {} failed: {}", nat_key, err);
                break;
            }
        }

        conn.close();
        closer.close();
        self.nat.remove(&nat_key);
        self.connections.remove(token);
        if let Some(stats) = &stats {
            stats.close_udp();
        }
    }
}
