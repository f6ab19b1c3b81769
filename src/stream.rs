//! Adapter that lets an accepted SSH channel stand in for an ordinary
//! accepted network connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Identity of one authenticated SSH transport connection, shared by all of
/// its channels.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Random per-connection id for correlating log lines.
    pub conn_id: Vec<u8>,
    pub username: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl ConnectionInfo {
    /// Connection id as unpadded base64, for log fields.
    pub fn conn_id_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.conn_id)
    }
}

/// Remote address of a tunneled stream: the tunnel principal plus the
/// transport address it connected from. Displays as `user@ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    pub username: String,
    pub addr: SocketAddr,
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.addr)
    }
}

/// Contract for connections handed out by a [`crate::listener::Listener`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    type Addr: fmt::Display + Clone + Send + Sync + 'static;

    /// Whether the connection enforces read/write deadlines. Consumers of
    /// connections that return `false` must bring their own timeouts.
    const SUPPORTS_DEADLINES: bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Self::Addr;
}

/// One accepted SSH channel wrapped with the identity of its parent
/// connection.
///
/// Reads and writes go straight to the channel. Shutting the stream down
/// closes only this channel; the parent connection and its other channels
/// are unaffected.
pub struct TunnelStream<S> {
    inner: S,
    conn: Arc<ConnectionInfo>,
}

impl<S> TunnelStream<S> {
    pub fn new(inner: S, conn: Arc<ConnectionInfo>) -> Self {
        Self { inner, conn }
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.conn
    }
}

impl<S> fmt::Debug for TunnelStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn_id", &self.conn.conn_id_b64())
            .field("remote_addr", &self.conn.remote_addr)
            .field("username", &self.conn.username)
            .finish()
    }
}

impl<S> Connection for TunnelStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Addr = TunnelAddr;

    const SUPPORTS_DEADLINES: bool = false;

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.local_addr)
    }

    fn remote_addr(&self) -> TunnelAddr {
        TunnelAddr {
            username: self.conn.username.clone(),
            addr: self.conn.remote_addr,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelStream<S> {
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

/// Plain TCP connections, used by the auxiliary HTTP servers.
impl Connection for tokio::net::TcpStream {
    type Addr = SocketAddr;

    const SUPPORTS_DEADLINES: bool = false;

    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> SocketAddr {
        // Only reachable on a socket whose peer has already gone away.
        self.peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

#[cfg(test)]
pub(crate) fn test_conn(username: &str) -> Arc<ConnectionInfo> {
    Arc::new(ConnectionInfo {
        conn_id: vec![1, 2, 3, 4],
        username: username.to_string(),
        local_addr: "10.0.0.1:2222".parse().unwrap(),
        remote_addr: "203.0.113.9:51000".parse().unwrap(),
    })
}
