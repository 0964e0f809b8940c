//! Proxy instance lifecycle and the variant dispatch.
//!
//! An instance moves between two states:
//!
//! ```text
//!   Stopped --start()--> Running --stop()--> Stopped
//!      ^                    |
//!      +---- stop() --------+   (stop on Stopped is a no-op)
//! ```
//!
//! `start()` on a running instance fails with `AlreadyRunning`. `stop()`
//! cancels the instance token, waits for the accept loop to exit and so
//! closes the listening socket. Connections already handed to their own
//! task are left to finish on their own.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handshake::HandshakeProxy;
use super::http::HttpProxy;
use super::router::{Route, RouteTable};
use super::tcp::TcpProxy;
use super::udp::UdpProxy;
use super::{ProxyKind, ProxyTimeouts};
use crate::error::{ProxyError, Result};

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Running/stopped state shared by every variant.
pub(crate) struct Lifecycle {
    bind_addr: SocketAddr,
    state: Mutex<Option<Running>>,
}

impl Lifecycle {
    pub(crate) fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            state: Mutex::new(None),
        }
    }

    pub(crate) fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Runs `launch` with a fresh token unless the instance is already up.
    ///
    /// `launch` binds the socket and spawns the serving task; the lifecycle
    /// lock is held throughout so concurrent starts cannot both bind.
    pub(crate) async fn start<F, Fut>(&self, launch: F) -> Result<SocketAddr>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(SocketAddr, JoinHandle<()>)>>,
    {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            if !running.task.is_finished() {
                return Err(ProxyError::AlreadyRunning {
                    addr: running.local_addr,
                });
            }
        }

        let cancel = CancellationToken::new();
        let (local_addr, task) = launch(cancel.clone()).await?;
        *state = Some(Running {
            cancel,
            local_addr,
            task,
        });
        Ok(local_addr)
    }

    /// Cancels the serving task and waits for it to release its socket.
    pub(crate) async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(addr = %running.local_addr, error = %e, "Proxy task ended abnormally");
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub(crate) async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|running| running.local_addr)
    }
}

/// Binds a TCP listener and spawns its accept loop.
///
/// Each accepted connection gets its own task running `handler`, wrapped in a
/// `connection` span. The loop exits when `cancel` fires and drops the
/// listener on the way out.
pub(crate) async fn spawn_tcp_listener<H, Fut>(
    bind_addr: SocketAddr,
    kind: ProxyKind,
    cancel: CancellationToken,
    handler: H,
) -> Result<(SocketAddr, JoinHandle<()>)>
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: bind_addr,
            source,
        })?;
    let local_addr = listener.local_addr()?;
    info!(bind_addr = %local_addr, %kind, "Listener started");

    let task = tokio::spawn(accept_loop(listener, local_addr, kind, cancel, handler));
    Ok((local_addr, task))
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    local_addr: SocketAddr,
    kind: ProxyKind,
    cancel: CancellationToken,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let connection = handler(stream, peer_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = connection.await {
                                debug!(error = %e, "Connection closed with error");
                            }
                        }
                        .instrument(info_span!(
                            "connection",
                            peer = %peer_addr,
                            port = local_addr.port(),
                            %kind
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Avoid a tight loop on persistent errors (e.g. EMFILE)
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!(bind_addr = %local_addr, %kind, "Listener stopped");
}

/// One listening port and the protocol variant serving it.
pub enum ProxyInstance {
    Tcp(TcpProxy),
    Udp(UdpProxy),
    Http(HttpProxy),
    Minecraft(HandshakeProxy),
}

impl ProxyInstance {
    /// Builds the variant for `kind`. Nothing is bound until `start()`.
    pub fn new(kind: ProxyKind, bind_addr: SocketAddr, timeouts: ProxyTimeouts) -> Self {
        match kind {
            ProxyKind::Tcp => ProxyInstance::Tcp(TcpProxy::new(bind_addr, timeouts)),
            ProxyKind::Udp => ProxyInstance::Udp(UdpProxy::new(bind_addr, timeouts)),
            ProxyKind::Http => ProxyInstance::Http(HttpProxy::new(bind_addr, timeouts)),
            ProxyKind::Minecraft => {
                ProxyInstance::Minecraft(HandshakeProxy::new(bind_addr, timeouts))
            }
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyInstance::Tcp(_) => ProxyKind::Tcp,
            ProxyInstance::Udp(_) => ProxyKind::Udp,
            ProxyInstance::Http(_) => ProxyKind::Http,
            ProxyInstance::Minecraft(_) => ProxyKind::Minecraft,
        }
    }

    fn table(&self) -> &RouteTable {
        match self {
            ProxyInstance::Tcp(p) => p.routes(),
            ProxyInstance::Udp(p) => p.routes(),
            ProxyInstance::Http(p) => p.routes(),
            ProxyInstance::Minecraft(p) => p.routes(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            ProxyInstance::Tcp(p) => p.start().await,
            ProxyInstance::Udp(p) => p.start().await,
            ProxyInstance::Http(p) => p.start().await,
            ProxyInstance::Minecraft(p) => p.start().await,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self {
            ProxyInstance::Tcp(p) => p.stop().await,
            ProxyInstance::Udp(p) => p.stop().await,
            ProxyInstance::Http(p) => p.stop().await,
            ProxyInstance::Minecraft(p) => p.stop().await,
        }
    }

    pub async fn is_running(&self) -> bool {
        match self {
            ProxyInstance::Tcp(p) => p.is_running().await,
            ProxyInstance::Udp(p) => p.is_running().await,
            ProxyInstance::Http(p) => p.is_running().await,
            ProxyInstance::Minecraft(p) => p.is_running().await,
        }
    }

    /// Bound address while running. Differs from the configured address
    /// when the instance was created on port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ProxyInstance::Tcp(p) => p.local_addr().await,
            ProxyInstance::Udp(p) => p.local_addr().await,
            ProxyInstance::Http(p) => p.local_addr().await,
            ProxyInstance::Minecraft(p) => p.local_addr().await,
        }
    }

    pub fn add_route(
        &self,
        owner_id: &str,
        routing_key: &str,
        backend_host: &str,
        backend_port: u16,
    ) {
        self.table()
            .add_route(owner_id, routing_key, backend_host, backend_port);
    }

    pub fn remove_route(&self, routing_key: &str) -> Option<Route> {
        self.table().remove_route(routing_key)
    }

    pub fn update_route(&self, routing_key: &str, backend_host: &str, backend_port: u16) -> bool {
        self.table()
            .update_route(routing_key, backend_host, backend_port)
    }

    pub fn remove_owner(&self, owner_id: &str) -> Vec<String> {
        self.table().remove_owner(owner_id)
    }

    pub fn clear_routes(&self) {
        self.table().clear();
    }

    pub fn get_routes(&self) -> HashMap<String, Route> {
        self.table().routes()
    }

    pub fn route_count(&self) -> usize {
        self.table().len()
    }
}
