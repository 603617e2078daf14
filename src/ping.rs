//! ICMP-Echo pseudo-flows: routing-driven handler selection, NAT-backed
//! request fan-in and a background reverse-path pump for replies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::bridge::TunBridge;
use crate::endpoint::Endpoint;
use crate::registry::ConnHandle;
use crate::session::{Inbound, SessionContext};
use crate::singleflight::Flight;
use crate::tun::PingWriteBack;

/// Idle timeout passed to the proxy core for ping sessions.
const PING_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

impl TunBridge {
    /// Returns true when the bridge takes responsibility for replying; false
    /// tells the TUN adapter to answer with an ICMP error.
    pub(crate) async fn handle_ping(
        &self,
        source: Endpoint,
        destination: Endpoint,
        message: Bytes,
        write_back: PingWriteBack,
    ) -> bool {
        let nat_key = format!("{}-{}", source.address, destination.address);
        let Some(dest_addr) = destination.socket_addr() else {
            return false;
        };

        if self.nat.try_send(&nat_key, &message, dest_addr).await {
            return true;
        }

        let guard = match self.flights.begin(nat_key.clone()) {
            Flight::Follower(waiter) => {
                waiter.wait().await;
                self.nat.try_send(&nat_key, &message, dest_addr).await;
                return true;
            }
            Flight::Leader(guard) => guard,
        };

        let ctx = SessionContext::new(Inbound::tun(source))
            .with_outbound_target(destination.clone())
            .with_protocol("ping");

        let outbound = match self.engine.pick_route(&ctx) {
            Ok(tag) => match self.engine.outbound(&tag) {
                Some(handler) => {
                    debug!("taking detour [{}] for [{}]", tag, destination.address);
                    handler
                }
                None => {
                    warn!("non existing outbound tag: {}", tag);
                    return false;
                }
            },
            Err(_) => match &self.default_ping_outbound {
                Some(handler) => {
                    warn!("default route for {}", destination.address);
                    handler.clone()
                }
                None => return false,
            },
        };

        let conn = match self
            .engine
            .dial_ping(ctx, outbound, destination.clone(), PING_SESSION_TIMEOUT)
            .await
        {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    "failed to open ping session for {}: {}",
                    destination.address, err
                );
                return false;
            }
        };

        let token = self.connections.insert(Arc::new(ConnHandle(conn.clone())));
        self.nat.insert(nat_key.clone(), conn.clone());

        {
            let nat = self.nat.clone();
            let key = nat_key.clone();
            let message = message.clone();
            tokio::spawn(async move {
                nat.try_send(&key, &message, dest_addr).await;
            });
        }

        drop(guard);

        let nat = self.nat.clone();
        let connections = self.connections.clone();
        let destination_addr = destination.address.clone();
        tokio::spawn(async move {
            loop {
                let buffer = match conn.read_from().await {
                    Ok((buffer, _)) => buffer,
                    Err(err) => {
                        debug!(
                            "failed to read ping response from {}: {}",
                            destination_addr, err
                        );
                        break;
                    }
                };
                if let Err(err) = write_back(&buffer) {
                    debug!("failed to write ping response back: {}", err);
                    break;
                }
            }
            conn.close();
            nat.remove(&nat_key);
            connections.remove(token);
        });

        true
    }
}
