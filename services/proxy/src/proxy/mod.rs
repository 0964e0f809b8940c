//! Multi-protocol proxy instances.
//!
//! This module provides:
//! - The handshake codec for the game protocol
//! - Per-instance route tables
//! - Four proxy variants behind one [`ProxyInstance`] contract
//! - Backend dialing and bidirectional forwarding
//!
//! ## Architecture
//!
//! ```text
//!                  +-- Tcp       (single backend, raw bytes)
//! Client -> port --+-- Udp       (single backend, per-client sessions)
//!                  +-- Http      (Host header -> backend, WebSocket takeover)
//!                  +-- Minecraft (handshake hostname -> backend, rewritten handshake)
//! ```
//!
//! Each instance owns its listening socket, its [`RouteTable`] and a
//! cancellation token. The manager picks the variant from a protocol tag
//! once, at construction; nothing dispatches on the forwarding path.

pub mod codec;
mod forward;
mod handshake;
mod http;
mod instance;
mod router;
mod tcp;
mod udp;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub use codec::{Handshake, ProtocolError};
pub use forward::{dial, pipe, DEFAULT_CONNECT_TIMEOUT};
pub use handshake::HandshakeProxy;
pub use http::HttpProxy;
pub use instance::ProxyInstance;
pub use router::{normalize_key, Route, RouteTable, SharedRouteTable, SENTINEL_KEY};
pub use tcp::TcpProxy;
pub use udp::{SessionInfo, UdpProxy};

/// Protocol variant of a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Tcp,
    Udp,
    Http,
    /// Handshake-aware virtual hosting for the game protocol.
    Minecraft,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Udp => "udp",
            ProxyKind::Http => "http",
            ProxyKind::Minecraft => "minecraft",
        }
    }

    /// Whether routes on this kind are keyed by hostname.
    pub fn is_virtual_hosted(&self) -> bool {
        matches!(self, ProxyKind::Http | ProxyKind::Minecraft)
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = ProxyError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProxyKind::Tcp),
            "udp" => Ok(ProxyKind::Udp),
            "http" | "ws" | "websocket" => Ok(ProxyKind::Http),
            "minecraft" | "mc" => Ok(ProxyKind::Minecraft),
            _ => Err(ProxyError::UnknownProtocol(tag.to_string())),
        }
    }
}

/// Timeouts applied by proxy instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimeouts {
    /// Backend dial timeout.
    pub connect: Duration,
    /// Deadline for reading the client's handshake.
    pub handshake_read: Duration,
    /// Deadline for reading the first HTTP request head.
    pub header_read: Duration,
    /// UDP sessions idle longer than this are reaped.
    pub udp_session_idle: Duration,
    /// How often the UDP reaper runs.
    pub udp_sweep_interval: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            handshake_read: Duration::from_secs(10),
            header_read: Duration::from_secs(10),
            udp_session_idle: Duration::from_secs(5 * 60),
            udp_sweep_interval: Duration::from_secs(30),
        }
    }
}
