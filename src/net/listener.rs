//! Client-facing listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured TCP address or Unix socket path
//! - Accept incoming connections as [`BoxedConnection`]s
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::{ListenerConfig, Transport};
use crate::net::connection::BoxedConnection;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
    /// The connection semaphore was closed.
    Closed,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::Closed => write!(f, "Listener closed"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Where a client connection came from.
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix => write!(f, "unix"),
        }
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
}

/// A bounded listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: Inner,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let inner = match config.transport {
            Transport::Tcp => {
                let addr: SocketAddr = config.address.parse().map_err(|e| {
                    ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
                })?;
                Inner::Tcp(TcpListener::bind(addr).await.map_err(ListenerError::Bind)?)
            }
            #[cfg(unix)]
            Transport::Unix => {
                let path = std::path::PathBuf::from(&config.address);
                // A socket file left behind by a previous run blocks bind().
                if path.exists() {
                    std::fs::remove_file(&path).map_err(ListenerError::Bind)?;
                }
                let listener =
                    tokio::net::UnixListener::bind(&path).map_err(ListenerError::Bind)?;
                Inner::Unix { listener, path }
            }
            #[cfg(not(unix))]
            Transport::Unix => {
                return Err(ListenerError::Bind(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };

        Ok(Self::with_limit(inner, config.max_connections))
    }

    /// Wrap an already bound TCP listener.
    pub fn from_tcp(listener: TcpListener, max_connections: usize) -> Self {
        Self::with_limit(Inner::Tcp(listener), max_connections)
    }

    fn with_limit(inner: Inner, max_connections: usize) -> Self {
        let listener = Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        };
        tracing::info!(
            address = %listener.describe(),
            max_connections,
            "Listener bound"
        );
        listener
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(
        &self,
    ) -> Result<(BoxedConnection, PeerAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer): (BoxedConnection, PeerAddr) = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ListenerError::Accept)?;
                // Small interactive writes (exec, attach) must not wait on Nagle.
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                (Box::new(stream), PeerAddr::Tcp(addr))
            }
            #[cfg(unix)]
            Inner::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Box::new(stream), PeerAddr::Unix)
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Get the local TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Inner::Unix { .. } => None,
        }
    }

    /// Human readable listening address.
    pub fn describe(&self) -> String {
        match &self.inner {
            Inner::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            Inner::Unix { path, .. } => path.display().to_string(),
        }
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Inner::Unix { path, .. } = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
