//! Per-flow TCP termination: attribute the flow, dispatch it through the
//! proxy core and copy upload bytes into the dispatch pipe until either side
//! ends.

use std::sync::Arc;

use tokio::io::{copy, duplex, split};
use tracing::{debug, warn};

use crate::bridge::TunBridge;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::proxy::StreamConn;
use crate::registry::CloseSignal;
use crate::session::{Link, SessionContext};
use crate::stats::CountedStream;

/// Capacity of the dispatch pipe between a TUN flow and the proxy core.
const PIPE_CAPACITY: usize = 64 * 1024;

impl TunBridge {
    pub(crate) async fn handle_tcp(
        &self,
        source: Endpoint,
        destination: Endpoint,
        conn: Box<dyn StreamConn>,
    ) {
        let is_dns = self.is_dns(&destination);
        let attribution = self.attribute_flow(false, is_dns, &source, &destination).await;
        let uid = attribution.as_ref().map(|a| a.uid);
        let is_self = attribution.as_ref().map(|a| a.is_self).unwrap_or(false);

        let ctx = self.flow_context(&source, is_dns, uid, &["http", "tls"]);

        let stats = if self.traffic_stats && !is_self && !is_dns {
            Some(self.stats.get_or_create(uid.unwrap_or(0)).await)
        } else {
            None
        };
        if let Some(stats) = &stats {
            stats.open_tcp();
        }

        let signal = Arc::new(CloseSignal::new());
        let token = self.connections.insert(signal.clone());

        let result = match &stats {
            Some(stats) => {
                self.run_tcp_flow(
                    ctx,
                    destination,
                    CountedStream::new(conn, stats.clone()),
                    signal,
                )
                .await
            }
            None => self.run_tcp_flow(ctx, destination, conn, signal).await,
        };
        if let Err(err) = result {
            warn!("[TCP] dispatch failed: {}", err);
        }

        self.connections.remove(token);
        if let Some(stats) = &stats {
            stats.close_tcp();
        }
    }

    async fn run_tcp_flow<S: StreamConn + 'static>(
        &self,
        ctx: SessionContext,
        destination: Endpoint,
        conn: S,
        signal: Arc<CloseSignal>,
    ) -> Result<()> {
        let (mut read_half, write_half) = split(conn);
        let (engine_side, mut pipe) = duplex(PIPE_CAPACITY);

        let link = Link {
            reader: Box::new(engine_side),
            writer: Box::new(write_half),
        };
        self.engine.dispatch_link(ctx, destination, link).await?;

        // The copy ending, either way, is the flow's normal termination
        // signal; dropping our pipe half ends the core's side too.
        tokio::select! {
            _ = signal.wait() => debug!("connection closed by shutdown"),
            copied = copy(&mut read_half, &mut pipe) => match copied {
                Ok(bytes) => debug!("connection finished, {} bytes uploaded", bytes),
                Err(err) => debug!("connection finished: {}", err),
            },
        }
        Ok(())
    }
}
