//! Error types for the proxy core.

use std::io;
use std::net::SocketAddr;

use cairn_id::{ListenerId, ServerId};
use thiserror::Error;

use crate::persistence::StoreError;
use crate::proxy::codec::ProtocolError;
use crate::proxy::ProxyKind;

/// Errors surfaced by proxy instances and the manager.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy on {addr} is already running")]
    AlreadyRunning { addr: SocketAddr },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("port {0} already has a proxy instance")]
    PortInUse(u16),

    #[error("no proxy instance on port {0}")]
    PortNotFound(u16),

    #[error("port {port} is served by a {existing} proxy, not {requested}")]
    KindMismatch {
        port: u16,
        existing: ProxyKind,
        requested: ProxyKind,
    },

    #[error("unknown proxy protocol '{0}'")]
    UnknownProtocol(String),

    #[error("listener {0} not found")]
    ListenerNotFound(ListenerId),

    #[error("server {0} not found")]
    ServerNotFound(ServerId),

    #[error("no free proxy port in {start}..={end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("cannot resolve container {container} on network {network}: {reason}")]
    Resolve {
        container: String,
        network: String,
        reason: String,
    },

    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
