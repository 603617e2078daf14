use std::io;

use thiserror::Error;

/// Bridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connect to invalid destination")]
    InvalidDestination,

    #[error("empty DNS response")]
    EmptyDnsResponse,

    #[error("DNS server responded with rcode {0}")]
    Rcode(i32),

    #[error("socket protect failed")]
    ProtectFailed,

    #[error("socket create failed: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("pcap setup failed: {0}")]
    PcapSetup(#[source] io::Error),

    #[error("uid lookup failed: {0}")]
    UidLookup(String),

    #[error("local resolver error: {0}")]
    Resolver(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Wrap an arbitrary engine failure as a dispatch error.
    pub fn dispatch<E: std::fmt::Display>(err: E) -> Self {
        Self::Dispatch(err.to_string())
    }
}
