//! Handshake-aware virtual-hosted forwarder.
//!
//! Many game servers share one port. The client's first packet names the
//! hostname it dialed, which selects the backend:
//!
//! 1. Read one handshake frame under the handshake deadline
//! 2. Route on the hostname (text before the first `\0`)
//! 3. No route: close without writing anything
//! 4. Dial the backend, send it the handshake rewritten to `localhost` and
//!    the backend port, keeping any compatibility marker
//! 5. Forward bytes both ways until either side closes
//!
//! The deadline covers step 1 only. Forwarding has no idle timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::codec::Handshake;
use super::forward::{dial, pipe};
use super::instance::{spawn_tcp_listener, Lifecycle};
use super::router::{normalize_key, Route, RouteTable, SharedRouteTable};
use super::{ProxyKind, ProxyTimeouts};
use crate::error::{ProxyError, Result};

/// Hostname-routed game protocol proxy.
pub struct HandshakeProxy {
    lifecycle: Lifecycle,
    routes: SharedRouteTable,
    timeouts: ProxyTimeouts,
}

impl HandshakeProxy {
    pub fn new(bind_addr: SocketAddr, timeouts: ProxyTimeouts) -> Self {
        Self {
            lifecycle: Lifecycle::new(bind_addr),
            routes: Arc::new(RouteTable::virtual_hosted()),
            timeouts,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn get_routes(&self) -> HashMap<String, Route> {
        self.routes.routes()
    }

    pub async fn start(&self) -> Result<()> {
        let routes = Arc::clone(&self.routes);
        let timeouts = self.timeouts;
        let bind_addr = self.lifecycle.bind_addr();

        self.lifecycle
            .start(|cancel| {
                spawn_tcp_listener(
                    bind_addr,
                    ProxyKind::Minecraft,
                    cancel,
                    move |client, _peer| route_connection(Arc::clone(&routes), timeouts, client),
                )
            })
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr().await
    }
}

async fn route_connection(
    routes: SharedRouteTable,
    timeouts: ProxyTimeouts,
    mut client: TcpStream,
) -> Result<()> {
    let handshake = timeout(timeouts.handshake_read, Handshake::read_from(&mut client))
        .await
        .map_err(|_| ProxyError::Timeout("handshake"))??;

    let hostname = normalize_key(handshake.hostname());
    debug!(
        hostname = %hostname,
        protocol_version = handshake.protocol_version,
        next_state = handshake.next_state,
        has_marker = handshake.compat_marker().is_some(),
        "Handshake received"
    );

    // Unknown hosts get a bare close; status pings see a reset, not a
    // "server unreachable" response.
    let Some(route) = routes.lookup(&hostname) else {
        debug!(hostname = %hostname, "No route for hostname, dropping connection");
        return Ok(());
    };

    let mut backend = dial(&route, timeouts.connect).await?;
    let rewritten = handshake.rewritten_for_backend(route.backend_port);
    backend.write_all(&rewritten.encode_frame()).await?;
    let _ = client.set_nodelay(true);

    let (to_backend, from_backend) = pipe(client, backend).await;
    debug!(
        hostname = %hostname,
        backend = %route.backend_addr(),
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Connection closed"
    );
    Ok(())
}
