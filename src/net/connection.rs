//! Connection capabilities and lifecycle tracking.
//!
//! # Responsibilities
//! - Define the [`Connection`] trait every proxied byte stream satisfies
//! - Expose half-close: independent closure of the read and write directions
//! - Generate unique connection IDs for tracing
//! - Track live client connections for graceful shutdown
//!
//! # Half-close
//! A connection that supports half-close splits into a [`HalfCloseStream`]:
//! a read half and a write half with independent owners. Shutting down the
//! write half sends end-of-stream to the peer while the read half keeps
//! receiving; dropping the read half closes the read direction. Connections
//! that cannot do this hand themselves back from
//! [`Connection::into_half_close`], and callers must refuse to continue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

use crate::net::listener::ConnectionPermit;

/// Boxed read direction of a half-closable connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write direction of a half-closable connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A type-erased proxied connection, client or backend side.
pub type BoxedConnection = Box<dyn Connection>;

/// A raw bidirectional byte stream usable by the proxy.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Split into independently closable halves.
    ///
    /// Returns the connection unchanged if the transport cannot close one
    /// direction without closing the other.
    fn into_half_close(self: Box<Self>) -> Result<HalfCloseStream, BoxedConnection>;
}

/// The two directions of a half-close capable connection.
pub struct HalfCloseStream {
    /// Bytes arriving from the peer. Dropping it closes the read side.
    pub reader: BoxedReader,
    /// Bytes going to the peer. `shutdown()` closes the write side only.
    pub writer: BoxedWriter,
}

impl HalfCloseStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for HalfCloseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HalfCloseStream").finish_non_exhaustive()
    }
}

impl Connection for TcpStream {
    fn into_half_close(self: Box<Self>) -> Result<HalfCloseStream, BoxedConnection> {
        // OwnedWriteHalf::poll_shutdown issues shutdown(SHUT_WR).
        let (reader, writer) = (*self).into_split();
        Ok(HalfCloseStream::new(reader, writer))
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {
    fn into_half_close(self: Box<Self>) -> Result<HalfCloseStream, BoxedConnection> {
        let (reader, writer) = (*self).into_split();
        Ok(HalfCloseStream::new(reader, writer))
    }
}

/// In-memory connection; shutting down one end makes the peer read EOF while
/// the opposite direction stays open.
impl Connection for DuplexStream {
    fn into_half_close(self: Box<Self>) -> Result<HalfCloseStream, BoxedConnection> {
        let (reader, writer) = tokio::io::split(*self);
        Ok(HalfCloseStream::new(reader, writer))
    }
}

/// Source of connection IDs; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks live client connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every tracked connection has closed or `grace` elapses.
    ///
    /// Returns `true` if all connections drained in time.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let drained = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Shared hold on a client connection's tracker entry and listener slot.
///
/// The connection stays counted until the last clone is dropped. An upgraded
/// stream outlives hyper's connection driver, so the relay keeps a clone.
#[derive(Debug, Clone)]
pub struct ConnectionLease {
    inner: Arc<LeaseInner>,
}

#[derive(Debug)]
struct LeaseInner {
    guard: ConnectionGuard,
    _permit: Option<ConnectionPermit>,
}

impl ConnectionLease {
    pub fn new(guard: ConnectionGuard, permit: Option<ConnectionPermit>) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                guard,
                _permit: permit,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.guard.id()
    }
}
