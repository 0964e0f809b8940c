//! HTTP Host-header forwarder.
//!
//! The first request head on each connection is read raw and inspected:
//! - `Upgrade: websocket`: the connection is taken over. The buffered
//!   request is replayed verbatim to the backend and bytes are piped both
//!   ways, as for raw TCP.
//! - Anything else: the connection is served by hyper and every request is
//!   relayed to the backend selected by its `Host` header.
//!
//! A missing route answers 502 without contacting any backend. A WebSocket
//! upgrade arriving later on a keep-alive connection is relayed with its
//! upgrade headers intact; once the backend answers 101 both upgraded
//! connections are piped raw.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::forward::{dial, pipe};
use super::instance::{spawn_tcp_listener, Lifecycle};
use super::router::{Route, RouteTable, SharedRouteTable};
use super::{ProxyKind, ProxyTimeouts};
use crate::error::{ProxyError, Result};

/// Largest request head accepted before giving up on the connection.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

const BAD_GATEWAY_RAW: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 11\r\nconnection: close\r\n\r\nBad Gateway";

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

struct HttpContext {
    routes: SharedRouteTable,
    client: Client<HttpConnector, Incoming>,
    timeouts: ProxyTimeouts,
}

/// Host-header routed HTTP proxy.
pub struct HttpProxy {
    lifecycle: Lifecycle,
    ctx: Arc<HttpContext>,
}

impl HttpProxy {
    pub fn new(bind_addr: SocketAddr, timeouts: ProxyTimeouts) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeouts.connect));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            lifecycle: Lifecycle::new(bind_addr),
            ctx: Arc::new(HttpContext {
                routes: Arc::new(RouteTable::virtual_hosted()),
                client,
                timeouts,
            }),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.ctx.routes
    }

    pub fn get_routes(&self) -> HashMap<String, Route> {
        self.ctx.routes.routes()
    }

    pub async fn start(&self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let bind_addr = self.lifecycle.bind_addr();

        self.lifecycle
            .start(|cancel| {
                spawn_tcp_listener(bind_addr, ProxyKind::Http, cancel, move |client, peer| {
                    handle_connection(Arc::clone(&ctx), client, peer)
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

/// What the first request head tells us.
#[derive(Debug, Default, PartialEq, Eq)]
struct HeadInfo {
    host: Option<String>,
    websocket: bool,
}

fn parse_head(buf: &[u8]) -> Result<Option<HeadInfo>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let mut info = HeadInfo::default();
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("host") {
            info.host = std::str::from_utf8(h.value).ok().map(str::to_string);
        } else if h.name.eq_ignore_ascii_case("upgrade") {
            info.websocket = names_websocket(h.value);
        }
    }
    Ok(Some(info))
}

fn names_websocket(upgrade: &[u8]) -> bool {
    std::str::from_utf8(upgrade)
        .map(|v| {
            v.split(',')
                .any(|p| p.trim().eq_ignore_ascii_case("websocket"))
        })
        .unwrap_or(false)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .any(|v| names_websocket(v.as_bytes()))
}

/// Reads until one full request head is buffered. `None` if the client
/// closed before sending anything.
async fn read_head(client: &mut TcpStream, buf: &mut BytesMut) -> Result<Option<HeadInfo>> {
    loop {
        let n = client.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedRequest(
                "connection closed mid-request".into(),
            ));
        }
        if let Some(info) = parse_head(buf)? {
            return Ok(Some(info));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::MalformedRequest("request head too large".into()));
        }
    }
}

async fn handle_connection(
    ctx: Arc<HttpContext>,
    mut client: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let head = timeout(ctx.timeouts.header_read, read_head(&mut client, &mut buf))
        .await
        .map_err(|_| ProxyError::Timeout("request head"))??;
    let Some(head) = head else {
        return Ok(());
    };

    if head.websocket {
        return take_over_websocket(&ctx, client, head, buf.freeze()).await;
    }

    let io = TokioIo::new(Rewind::new(buf.freeze(), client));
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(forward_request(&ctx, req, peer).await) }
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(error = %e, "HTTP connection ended with error");
    }
    Ok(())
}

async fn take_over_websocket(
    ctx: &HttpContext,
    mut client: TcpStream,
    head: HeadInfo,
    buffered: Bytes,
) -> Result<()> {
    let route = head.host.as_deref().and_then(|host| ctx.routes.lookup(host));
    let Some(route) = route else {
        debug!(host = ?head.host, "No route for WebSocket upgrade");
        client.write_all(BAD_GATEWAY_RAW).await?;
        let _ = client.shutdown().await;
        return Ok(());
    };

    let mut backend = match dial(&route, ctx.timeouts.connect).await {
        Ok(backend) => backend,
        Err(e) => {
            let _ = client.write_all(BAD_GATEWAY_RAW).await;
            return Err(e);
        }
    };
    backend.write_all(&buffered).await?;

    let (to_backend, from_backend) = pipe(client, backend).await;
    debug!(
        backend = %route.backend_addr(),
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "WebSocket connection closed"
    );
    Ok(())
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

async fn forward_request(
    ctx: &HttpContext,
    mut req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<ProxyBody> {
    let Some(host) = request_host(&req) else {
        debug!("Request without Host header");
        return bad_gateway();
    };
    let Some(route) = ctx.routes.lookup(&host) else {
        debug!(host = %host, "No route for host");
        return bad_gateway();
    };

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{}{}", route.backend_addr(), path).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(error = %e, backend = %route.backend_addr(), "Invalid backend URI");
            return bad_gateway();
        }
    };
    *req.uri_mut() = uri;

    let client_upgrade = if is_websocket_upgrade(req.headers()) {
        Some(hyper::upgrade::on(&mut req))
    } else {
        None
    };

    let headers = req.headers_mut();
    if client_upgrade.is_some() {
        strip_hop_by_hop_keeping_upgrade(headers);
    } else {
        strip_hop_by_hop(headers);
    }
    if let Ok(value) = HeaderValue::from_str(&host) {
        // The backend must see the virtual host, not its own address.
        headers.insert(header::HOST, value.clone());
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    append_forwarded_for(headers, peer);

    match ctx.client.request(req).await {
        Ok(mut resp) => {
            if let Some(client_upgrade) = client_upgrade {
                if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                    let backend_upgrade = hyper::upgrade::on(&mut resp);
                    tokio::spawn(tunnel_upgraded(
                        client_upgrade,
                        backend_upgrade,
                        route.backend_addr(),
                    ));
                    strip_hop_by_hop_keeping_upgrade(resp.headers_mut());
                    return resp.map(|body| body.boxed());
                }
            }
            let (mut parts, body) = resp.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            warn!(error = %e, backend = %route.backend_addr(), "Backend request failed");
            bad_gateway()
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Like [`strip_hop_by_hop`], but keeps the upgrade negotiation.
fn strip_hop_by_hop_keeping_upgrade(headers: &mut HeaderMap) {
    let upgrade = headers.get(header::UPGRADE).cloned();
    strip_hop_by_hop(headers);
    if let Some(upgrade) = upgrade {
        headers.insert(header::UPGRADE, upgrade);
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

/// Pipes a client connection upgraded mid keep-alive to the backend's.
async fn tunnel_upgraded(client: OnUpgrade, backend: OnUpgrade, backend_addr: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, backend = %backend_addr, "Connection upgrade failed");
            return;
        }
    };
    let (to_backend, from_backend) = pipe(TokioIo::new(client), TokioIo::new(backend)).await;
    debug!(
        backend = %backend_addr,
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Upgraded connection closed"
    );
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let name = HeaderName::from_static("x-forwarded-for");
    let client_ip = peer.ip().to_string();
    let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

/// A stream that yields already-read bytes before reading the socket again.
struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
