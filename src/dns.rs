//! DNS glue: parsing the platform resolver's textual responses and adapting
//! a dispatched stream into the packet conn the bootstrap resolver expects.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::error::{BridgeError, Result};
use crate::proxy::{PacketConn, StreamConn};

/// Parse a platform resolver response: a comma-separated IP list on success,
/// an error string that may carry an `"rcode <n>"` prefix on failure.
pub(crate) fn parse_local_response(
    response: std::result::Result<String, String>,
) -> Result<Vec<IpAddr>> {
    let response = match response {
        Ok(response) => response,
        Err(message) => {
            if let Some(rest) = message.strip_prefix("rcode ") {
                let code = rest
                    .split_whitespace()
                    .next()
                    .and_then(|token| token.parse::<i32>().ok());
                if let Some(code) = code {
                    return Err(BridgeError::Rcode(code));
                }
            }
            return Err(BridgeError::Resolver(message));
        }
    };

    let ips: Vec<IpAddr> = response
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if ips.is_empty() {
        return Err(BridgeError::EmptyDnsResponse);
    }
    Ok(ips)
}

const READ_BUFFER: usize = 4096;

/// Adapter making a dispatched stream behave as a packet conn: reads report
/// the fixed remote, writes ignore the requested destination.
pub struct StreamPacketConn {
    reader: Mutex<ReadHalf<Box<dyn StreamConn>>>,
    writer: Mutex<WriteHalf<Box<dyn StreamConn>>>,
    remote: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
}

impl StreamPacketConn {
    pub fn new(stream: Box<dyn StreamConn>, remote: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
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
impl PacketConn for StreamPacketConn {
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
                let mut reader = self.reader.lock().await;
                let mut buf = vec![0u8; READ_BUFFER];
                let read = reader.read(&mut buf).await?;
                buf.truncate(read);
                Ok::<_, io::Error>(buf)
            } => {
                let buf = received?;
                if buf.is_empty() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok((Bytes::from(buf), Some(self.remote)))
            }
        }
    }

    async fn write_to(&self, payload: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_err());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        Ok(payload.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}
