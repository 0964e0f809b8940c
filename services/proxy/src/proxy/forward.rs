//! Backend dialing and byte forwarding shared by the stream-based variants.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;
use crate::proxy::router::Route;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const COPY_BUF_SIZE: usize = 8192;

/// Connect to a route's backend, giving up after `connect_timeout`.
pub async fn dial(route: &Route, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addr = route.backend_addr();
    debug!(backend_addr = %addr, "Connecting to backend");

    let connect = TcpStream::connect((route.backend_host.as_str(), route.backend_port));
    let stream = match timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(ProxyError::Dial { addr, source }),
        Err(_) => {
            return Err(ProxyError::Dial {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
            })
        }
    };
    // Game traffic is latency sensitive and already framed by the protocol.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Forward bytes in both directions until either side closes or errors.
///
/// Each direction writes every chunk as soon as it is read. When one side
/// finishes, the other direction's writer is shut down so the peer sees EOF.
/// Returns (bytes a->b, bytes b->a); a direction that errored counts 0.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = copy_then_shutdown(&mut a_read, &mut b_write);
    let b_to_a = copy_then_shutdown(&mut b_read, &mut a_write);

    let (a_result, b_result) = tokio::join!(a_to_b, b_to_a);
    if let Err(e) = &a_result {
        debug!(error = %e, "Forwarding to backend ended with error");
    }
    if let Err(e) = &b_result {
        debug!(error = %e, "Forwarding to client ended with error");
    }

    (a_result.unwrap_or(0), b_result.unwrap_or(0))
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}
