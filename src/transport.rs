//! Stream transports for bridge links.
//!
//! A link runs over any byte stream; this module provides the two real
//! ones (TCP and Unix sockets) plus the endpoint handoff a parent uses to
//! tell a spawned peer where to connect: [`EndpointInfo`] serializes as
//! JSON through the `TERMPORT_ENDPOINT` environment variable.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Environment variable carrying the serialized [`EndpointInfo`].
pub const ENDPOINT_ENV: &str = "TERMPORT_ENDPOINT";

/// Where a peer should connect to reach this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointInfo {
    Tcp { addr: SocketAddr },
    Unix { path: PathBuf },
}

impl EndpointInfo {
    /// JSON payload for the environment handoff.
    pub fn to_env_value(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn parse(raw: &str) -> io::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Reads the endpoint the parent exported, from the child side.
    pub fn from_env() -> io::Result<Self> {
        let raw = std::env::var(ENDPOINT_ENV).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not set", ENDPOINT_ENV),
            )
        })?;
        Self::parse(&raw)
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Listening endpoint for inbound bridge connections.
pub struct BridgeListener {
    inner: ListenerKind,
    info: EndpointInfo,
    /// Socket directory to remove on drop, when this listener created it.
    cleanup_dir: Option<PathBuf>,
}

impl BridgeListener {
    /// Binds a TCP listener; pass port 0 for an ephemeral port.
    pub async fn bind_tcp(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        tracing::debug!(addr = %bound, "bound tcp endpoint");
        Ok(Self {
            inner: ListenerKind::Tcp(listener),
            info: EndpointInfo::Tcp { addr: bound },
            cleanup_dir: None,
        })
    }

    /// Binds a Unix socket at an explicit path, replacing a stale file.
    #[cfg(unix)]
    pub async fn bind_unix(path: PathBuf) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "bound unix endpoint");
        Ok(Self {
            inner: ListenerKind::Unix(listener),
            info: EndpointInfo::Unix { path },
            cleanup_dir: None,
        })
    }

    /// Binds a Unix socket under `{temp_dir}/termport-{pid}/`, owning the
    /// directory for cleanup.
    #[cfg(unix)]
    pub async fn bind_unix_auto() -> io::Result<Self> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);

        let dir = std::env::temp_dir().join(format!("termport-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("link-{}.sock", SEQ.fetch_add(1, Ordering::Relaxed)));
        let mut listener = Self::bind_unix(path).await?;
        listener.cleanup_dir = Some(dir);
        Ok(listener)
    }

    pub fn endpoint(&self) -> &EndpointInfo {
        &self.info
    }

    /// Accepts one inbound connection.
    pub async fn accept(&self) -> io::Result<BridgeStream> {
        match &self.inner {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, "accepted tcp connection");
                Ok(BridgeStream::Tcp(stream))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("accepted unix connection");
                Ok(BridgeStream::Unix(stream))
            }
        }
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        if let Some(dir) = self.cleanup_dir.take()
            && let Err(error) = std::fs::remove_dir_all(&dir)
        {
            tracing::warn!(%error, dir = %dir.display(), "failed to clean socket directory");
        }
    }
}

/// Connected byte stream, either flavor; implements AsyncRead/AsyncWrite.
pub enum BridgeStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl BridgeStream {
    pub async fn connect(info: &EndpointInfo) -> io::Result<Self> {
        match info {
            EndpointInfo::Tcp { addr } => {
                tracing::debug!(%addr, "connecting tcp");
                Ok(Self::Tcp(TcpStream::connect(addr).await?))
            }
            #[cfg(unix)]
            EndpointInfo::Unix { path } => {
                tracing::debug!(path = %path.display(), "connecting unix");
                Ok(Self::Unix(UnixStream::connect(path).await?))
            }
            #[cfg(not(unix))]
            EndpointInfo::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix endpoints are not available on this platform",
            )),
        }
    }
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_info_roundtrips() {
        let info = EndpointInfo::Tcp {
            addr: "127.0.0.1:4369".parse().unwrap(),
        };
        let parsed = EndpointInfo::parse(&info.to_env_value().unwrap()).unwrap();
        match parsed {
            EndpointInfo::Tcp { addr } => assert_eq!(addr.port(), 4369),
            _ => panic!("wrong variant"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn unix_endpoint_info_roundtrips() {
        let info = EndpointInfo::Unix {
            path: PathBuf::from("/tmp/termport-1/link-0.sock"),
        };
        let parsed = EndpointInfo::parse(&info.to_env_value().unwrap()).unwrap();
        match parsed {
            EndpointInfo::Unix { path } => {
                assert_eq!(path, PathBuf::from("/tmp/termport-1/link-0.sock"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(EndpointInfo::parse("not json").is_err());
    }
}
