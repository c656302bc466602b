//! TCP transport: framed peer sessions over tokio streams.
//!
//! The core is transport-agnostic — sessions run over any `AsyncRead` /
//! `AsyncWrite` pair — and this module supplies the plain-TCP reference
//! implementation plus the accept loop that turns inbound connections into
//! sessions.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::session::{run_session, SessionContext};

/// A source of framed peer byte streams. Implementations own length framing
/// at the socket level only in the sense of delivering ordered bytes; the
/// protocol framing lives in [`crate::framing`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Reader: tokio::io::AsyncRead + Unpin + Send + 'static;
    type Writer: tokio::io::AsyncWrite + Unpin + Send + 'static;

    /// Wait for an inbound connection.
    async fn accept(&self) -> io::Result<(Self::Reader, Self::Writer, SocketAddr)>;

    /// Dial a peer by endpoint url.
    async fn connect(&self, url: &str) -> io::Result<(Self::Reader, Self::Writer, SocketAddr)>;
}

pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn accept(&self) -> io::Result<(Self::Reader, Self::Writer, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok((reader, writer, remote))
    }

    async fn connect(&self, url: &str) -> io::Result<(Self::Reader, Self::Writer, SocketAddr)> {
        let addr = dial_addr(url).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("undialable url {url}"))
        })?;
        let stream = TcpStream::connect(&addr).await?;
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok((reader, writer, remote))
    }
}

/// Extract the dialable `host:port` part of a `cnode://id@host:port` url.
pub fn dial_addr(url: &str) -> Option<String> {
    let rest = url.strip_prefix("cnode://")?;
    let (_, host) = rest.split_once('@')?;
    Some(host.to_string())
}

/// Accept connections forever, running one session per peer.
pub async fn serve<T: Transport>(transport: T, ctx: SessionContext) {
    loop {
        match transport.accept().await {
            Ok((reader, writer, remote)) => {
                debug!(%remote, "inbound connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = run_session(ctx, reader, writer).await {
                        debug!(%remote, %err, "inbound session ended");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_addr_extracts_host_and_port() {
        assert_eq!(
            dial_addr("cnode://aabb@127.0.0.1:8500"),
            Some("127.0.0.1:8500".to_string())
        );
        assert_eq!(dial_addr("tcp://127.0.0.1:8500"), None);
        assert_eq!(dial_addr("cnode://no-at-sign"), None);
    }
}
