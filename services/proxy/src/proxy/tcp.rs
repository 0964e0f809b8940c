//! Raw TCP forwarder.
//!
//! No inspection: every accepted connection goes to the single configured
//! backend. Connections arriving before a backend is configured are dropped
//! without a response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::forward::{dial, pipe};
use super::instance::{spawn_tcp_listener, Lifecycle};
use super::router::{Route, RouteTable, SharedRouteTable, SENTINEL_KEY};
use super::{ProxyKind, ProxyTimeouts};
use crate::error::Result;

/// Single-backend TCP proxy.
pub struct TcpProxy {
    lifecycle: Lifecycle,
    routes: SharedRouteTable,
    timeouts: ProxyTimeouts,
}

impl TcpProxy {
    pub fn new(bind_addr: SocketAddr, timeouts: ProxyTimeouts) -> Self {
        Self {
            lifecycle: Lifecycle::new(bind_addr),
            routes: Arc::new(RouteTable::single_backend()),
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
        let connect_timeout = self.timeouts.connect;
        let bind_addr = self.lifecycle.bind_addr();

        self.lifecycle
            .start(|cancel| {
                spawn_tcp_listener(bind_addr, ProxyKind::Tcp, cancel, move |client, _peer| {
                    forward_connection(Arc::clone(&routes), connect_timeout, client)
                })
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

async fn forward_connection(
    routes: SharedRouteTable,
    connect_timeout: Duration,
    client: TcpStream,
) -> Result<()> {
    let Some(route) = routes.lookup(SENTINEL_KEY) else {
        debug!("No backend configured, dropping connection");
        return Ok(());
    };

    let backend = dial(&route, connect_timeout).await?;
    let _ = client.set_nodelay(true);

    let (to_backend, from_backend) = pipe(client, backend).await;
    debug!(
        backend = %route.backend_addr(),
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Connection closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forwards_to_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let proxy = TcpProxy::new("127.0.0.1:0".parse().unwrap(), ProxyTimeouts::default());
        proxy.routes().add_route("mod_a", "ignored", "127.0.0.1", backend_port);
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_without_backend() {
        let proxy = TcpProxy::new("127.0.0.1:0".parse().unwrap(), ProxyTimeouts::default());
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        proxy.stop().await.unwrap();
    }
}
