//! Uniform bind/accept/connect over Unix-domain and TCP stream sockets.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::{io_err, DaemonError};

/// Upper bound on the liveness check against an existing socket file.
const LIVENESS_CHECK_TIMEOUT: Duration = Duration::from_millis(250);

/// A concrete, connectable socket address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Address {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
}

impl Address {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix { path: path.into() }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix { path } => write!(f, "unix:{}", path.display()),
            Address::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Where to bind. TCP binds try `start..=end` in order; an explicit port is
/// a one-port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Unix(PathBuf),
    Tcp { host: String, start: u16, end: u16 },
}

impl BindTarget {
    pub fn tcp_port(host: impl Into<String>, port: u16) -> Self {
        BindTarget::Tcp {
            host: host.into(),
            start: port,
            end: port,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Object-safe bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// One accepted or connected stream, independent of the socket family.
pub struct Connection {
    stream: Box<dyn Stream>,
    peer: String,
}

impl Connection {
    /// Wrap any stream; used for in-memory pipes in tests as well.
    pub fn from_stream(stream: impl Stream + 'static, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Unix { inner: UnixListener, path: PathBuf },
    Tcp { inner: TcpListener, address: Address },
}

impl Listener {
    /// The address clients should connect to.
    pub fn local_address(&self) -> Address {
        match self {
            Listener::Unix { path, .. } => Address::unix(path.clone()),
            Listener::Tcp { address, .. } => address.clone(),
        }
    }

    /// The socket file this listener created, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Unix { path, .. } => Some(path),
            Listener::Tcp { .. } => None,
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> std::io::Result<Connection> {
        match self {
            Listener::Unix { inner, path } => {
                let (stream, _) = inner.accept().await?;
                Ok(Connection::from_stream(
                    stream,
                    format!("unix:{}", path.display()),
                ))
            }
            Listener::Tcp { inner, .. } => {
                let (stream, peer) = inner.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::from_stream(stream, format!("tcp:{peer}")))
            }
        }
    }
}

/// Bind a listener. Unix paths have stale socket files removed first; TCP
/// targets scan their port range sequentially.
pub async fn bind(target: &BindTarget) -> Result<Listener, DaemonError> {
    match target {
        BindTarget::Unix(path) => {
            prepare_socket_for_bind(path).await?;
            let inner = UnixListener::bind(path).map_err(|e| io_err(path, e))?;
            set_socket_permissions(path).await?;
            Ok(Listener::Unix {
                inner,
                path: path.clone(),
            })
        }
        BindTarget::Tcp { host, start, end } => bind_tcp_range(host, *start, *end).await,
    }
}

async fn bind_tcp_range(host: &str, start: u16, end: u16) -> Result<Listener, DaemonError> {
    for port in start..=end {
        match TcpListener::bind((host, port)).await {
            Ok(inner) => {
                return Ok(Listener::Tcp {
                    inner,
                    address: Address::tcp(host, port),
                })
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::AddrInUse | ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(host, port, error = %err, "port unavailable, trying next");
            }
            Err(err) => return Err(io_err(format!("{host}:{port}"), err)),
        }
    }

    Err(DaemonError::NoPortAvailable {
        host: host.to_string(),
        start,
        end,
    })
}

/// Connect with an upper bound on how long the caller may block.
pub async fn connect(address: &Address, timeout: Duration) -> Result<Connection, DaemonError> {
    let attempt = async {
        match address {
            Address::Unix { path } => UnixStream::connect(path)
                .await
                .map(|s| Connection::from_stream(s, address.to_string())),
            Address::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).await.map(|s| {
                    let _ = s.set_nodelay(true);
                    Connection::from_stream(s, address.to_string())
                })
            }
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(err)) => Err(classify_connect_error(address, err)),
        Err(_) => Err(DaemonError::ConnectTimeout {
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn classify_connect_error(address: &Address, err: std::io::Error) -> DaemonError {
    if matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    ) {
        DaemonError::ConnectionRefused {
            address: address.to_string(),
        }
    } else {
        io_err(address.to_string(), err)
    }
}

async fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !tokio::fs::try_exists(socket).await.unwrap_or(false) {
        return Ok(());
    }

    match tokio::time::timeout(LIVENESS_CHECK_TIMEOUT, UnixStream::connect(socket)).await {
        Ok(Ok(_)) => {
            return Err(DaemonError::Protocol(format!(
                "socket already in use: {}",
                socket.display()
            )));
        }
        Ok(Err(err)) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale socket before bind",
            );
        }
        Err(_) => {
            tracing::warn!(
                socket = %socket.display(),
                "socket did not answer, removing before bind",
            );
        }
    }

    match tokio::fs::remove_file(socket).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| io_err(path, e))
}
