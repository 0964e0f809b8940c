//! UDP session-multiplexing forwarder.
//!
//! UDP has no connections, so the proxy keeps one session per client
//! address. Each session owns an outbound socket connected to the backend
//! and a relay task sending backend replies back to that client:
//!
//! ```text
//! client A --+                      +-- session A socket <-> backend
//!            +-- listening socket --+
//! client B --+                      +-- session B socket <-> backend
//! ```
//!
//! Sessions close exactly once, under the session table lock, by whichever
//! comes first: the idle sweep, a backend socket error, or `stop()`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::instance::Lifecycle;
use super::router::{Route, RouteTable, SharedRouteTable, SENTINEL_KEY};
use super::{ProxyKind, ProxyTimeouts};
use crate::error::{ProxyError, Result};

/// Largest datagram we relay.
const MAX_DATAGRAM: usize = 65_535;

struct UdpSession {
    id: u64,
    client_addr: SocketAddr,
    backend_addr: SocketAddr,
    socket: UdpSocket,
    /// Milliseconds since the table epoch.
    last_active: AtomicU64,
    cancel: CancellationToken,
}

impl UdpSession {
    fn touch(&self, epoch: Instant) {
        self.last_active
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant) -> Duration {
        let now = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_active.load(Ordering::Relaxed)))
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique per session object; a recreated session gets a new id.
    pub id: u64,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub idle: Duration,
}

struct SessionTable {
    sessions: Mutex<HashMap<SocketAddr, Arc<UdpSession>>>,
    next_id: AtomicU64,
    epoch: Instant,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    async fn get(&self, client_addr: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.lock().await.get(client_addr).cloned()
    }

    /// Opens a session for `client_addr` with its own backend socket.
    async fn open(
        &self,
        client_addr: SocketAddr,
        route: &Route,
        parent: &CancellationToken,
    ) -> Result<Arc<UdpSession>> {
        let backend_addr = resolve_backend(route).await?;
        let local: SocketAddr = match backend_addr.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(backend_addr)
            .await
            .map_err(|source| ProxyError::Dial {
                addr: backend_addr.to_string(),
                source,
            })?;

        let session = Arc::new(UdpSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client_addr,
            backend_addr,
            socket,
            last_active: AtomicU64::new(0),
            cancel: parent.child_token(),
        });
        session.touch(self.epoch);

        let replaced = self
            .sessions
            .lock()
            .await
            .insert(client_addr, Arc::clone(&session));
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        debug!(
            session_id = session.id,
            client = %client_addr,
            backend = %backend_addr,
            "UDP session opened"
        );
        Ok(session)
    }

    /// Closes the session for `client_addr` if it is still `session_id`.
    async fn close(&self, client_addr: SocketAddr, session_id: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&client_addr).is_some_and(|s| s.id == session_id) {
            if let Some(session) = sessions.remove(&client_addr) {
                session.cancel.cancel();
                debug!(session_id, client = %client_addr, "UDP session closed");
            }
        }
    }

    async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.cancel.cancel();
        }
        count
    }

    /// Closes every session idle for longer than `idle_timeout`.
    async fn sweep(&self, idle_timeout: Duration) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            let keep = session.idle_for(self.epoch) <= idle_timeout;
            if !keep {
                session.cancel.cancel();
            }
            keep
        });
        before - sessions.len()
    }

    async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                client_addr: s.client_addr,
                backend_addr: s.backend_addr,
                idle: s.idle_for(self.epoch),
            })
            .collect()
    }
}

async fn resolve_backend(route: &Route) -> Result<SocketAddr> {
    let addr = route.backend_addr();
    let lookup = tokio::net::lookup_host(addr.clone()).await;
    let resolved = match lookup {
        Ok(mut addrs) => addrs.next(),
        Err(source) => return Err(ProxyError::Dial { addr, source }),
    };
    resolved.ok_or_else(|| ProxyError::Dial {
        addr,
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
    })
}

/// Single-backend UDP proxy with per-client sessions.
pub struct UdpProxy {
    lifecycle: Lifecycle,
    routes: SharedRouteTable,
    sessions: Arc<SessionTable>,
    timeouts: ProxyTimeouts,
}

impl UdpProxy {
    pub fn new(bind_addr: SocketAddr, timeouts: ProxyTimeouts) -> Self {
        Self {
            lifecycle: Lifecycle::new(bind_addr),
            routes: Arc::new(RouteTable::single_backend()),
            sessions: Arc::new(SessionTable::new()),
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
        let bind_addr = self.lifecycle.bind_addr();
        let routes = Arc::clone(&self.routes);
        let sessions = Arc::clone(&self.sessions);
        let timeouts = self.timeouts;

        self.lifecycle
            .start(|cancel| async move {
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .map_err(|source| ProxyError::Bind {
                        addr: bind_addr,
                        source,
                    })?;
                let local_addr = socket.local_addr()?;
                info!(bind_addr = %local_addr, kind = %ProxyKind::Udp, "Listener started");

                let task: JoinHandle<()> = tokio::spawn(receive_loop(
                    Arc::new(socket),
                    local_addr,
                    routes,
                    sessions,
                    timeouts,
                    cancel,
                ));
                Ok((local_addr, task))
            })
            .await?;
        Ok(())
    }

    /// Closes every session, then the listening socket.
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await;
        // The receive loop already drained the table; this covers a loop that
        // died before observing the cancellation.
        self.sessions.close_all().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr().await
    }

    /// Live sessions, in no particular order.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot().await
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    routes: SharedRouteTable,
    sessions: Arc<SessionTable>,
    timeouts: ProxyTimeouts,
    cancel: CancellationToken,
) {
    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&sessions),
        timeouts.udp_session_idle,
        timeouts.udp_sweep_interval,
        cancel.clone(),
    ));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, client_addr)) => {
                    if let Err(e) = forward_datagram(
                        &socket,
                        &routes,
                        &sessions,
                        &cancel,
                        client_addr,
                        &buf[..n],
                    )
                    .await
                    {
                        debug!(client = %client_addr, error = %e, "Dropping datagram");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "UDP receive error");
                }
            }
        }
    }

    let closed = sessions.close_all().await;
    if let Err(e) = sweeper.await {
        warn!(error = %e, "UDP sweeper ended abnormally");
    }
    info!(bind_addr = %local_addr, sessions_closed = closed, "Listener stopped");
}

async fn forward_datagram(
    listener: &Arc<UdpSocket>,
    routes: &RouteTable,
    sessions: &Arc<SessionTable>,
    cancel: &CancellationToken,
    client_addr: SocketAddr,
    datagram: &[u8],
) -> Result<()> {
    let session = match sessions.get(&client_addr).await {
        Some(session) => session,
        None => {
            let Some(route) = routes.lookup(SENTINEL_KEY) else {
                debug!(client = %client_addr, "No backend configured, dropping datagram");
                return Ok(());
            };
            let session = sessions.open(client_addr, &route, cancel).await?;
            tokio::spawn(
                relay_responses(
                    Arc::clone(listener),
                    Arc::clone(&session),
                    Arc::clone(sessions),
                )
                .instrument(tracing::info_span!(
                    "udp_session",
                    session_id = session.id,
                    client = %client_addr
                )),
            );
            session
        }
    };

    session.touch(sessions.epoch);
    session.socket.send(datagram).await?;
    Ok(())
}

async fn relay_responses(
    listener: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    sessions: Arc<SessionTable>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            received = session.socket.recv(&mut buf) => match received {
                Ok(n) => {
                    session.touch(sessions.epoch);
                    if let Err(e) = listener.send_to(&buf[..n], session.client_addr).await {
                        debug!(error = %e, "Failed to relay datagram to client");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Backend socket error, closing session");
                    sessions.close(session.client_addr, session.id).await;
                    break;
                }
            }
        }
    }
}

async fn sweep_loop(
    sessions: Arc<SessionTable>,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = sessions.sweep(idle_timeout).await;
                if reaped > 0 {
                    debug!(reaped, "Reaped idle UDP sessions");
                }
            }
        }
    }
}
