//! Protocol upgrade takeover.
//!
//! # Responsibilities
//! - Take raw ownership of the client and backend connections once a
//!   `101 Switching Protocols` response has been committed
//! - Deliver bytes the HTTP layer had already buffered, in order, before any
//!   relayed byte
//! - Refuse connections that cannot half-close
//! - Hand both connections to the [`HalfDuplexPipe`]
//!
//! # Data Flow
//! ```text
//! 101 committed to client
//!     → client OnUpgrade resolves   (raw conn + bytes read past the request)
//!     → backend OnUpgrade resolves  (raw conn + bytes read past the 101 head)
//!     → backend leftovers → client, flush
//!     → client leftovers  → backend, flush
//!     → half-close check on both
//!     → HalfDuplexPipe until both directions end
//! ```
//!
//! Nothing here can be reported over HTTP any more; errors are returned for
//! logging and dropping the connections closes them.

use bytes::Bytes;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;

use crate::net::connection::BoxedConnection;
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::pipe::{HalfDuplexPipe, PipeStats};

/// A connection recovered from the HTTP layer.
pub struct TakenOver {
    pub conn: BoxedConnection,
    /// Bytes the HTTP layer read from `conn` but never consumed.
    pub buffered: Bytes,
}

impl TakenOver {
    /// Recover the raw connection behind an upgraded HTTP connection.
    pub fn from_upgraded(upgraded: Upgraded, side: &str) -> Result<Self, ProxyError> {
        match upgraded.downcast::<TokioIo<BoxedConnection>>() {
            Ok(parts) => Ok(Self {
                conn: parts.io.into_inner(),
                buffered: parts.read_buf,
            }),
            Err(_) => Err(ProxyError::Configuration(format!(
                "{side} connection cannot be taken over as a raw byte stream"
            ))),
        }
    }
}

/// Take over both connections of an upgraded exchange and relay until done.
///
/// `client` must belong to a request whose `101` response has been (or is
/// about to be) returned to the HTTP layer; it resolves once that response
/// has been written and flushed.
pub async fn handle_upgrade(client: OnUpgrade, backend: OnUpgrade) -> Result<PipeStats, ProxyError> {
    let client = client.await.map_err(ProxyError::Upgrade)?;
    let client = TakenOver::from_upgraded(client, "client")?;

    let backend = backend.await.map_err(ProxyError::Upgrade)?;
    let backend = TakenOver::from_upgraded(backend, "backend")?;

    relay_taken_over(client, backend).await
}

/// Replay buffered bytes on both sides, then run the duplex pipe.
pub async fn relay_taken_over(client: TakenOver, backend: TakenOver) -> Result<PipeStats, ProxyError> {
    let TakenOver {
        conn: mut client_conn,
        buffered: client_buffered,
    } = client;
    let TakenOver {
        conn: mut backend_conn,
        buffered: backend_buffered,
    } = backend;

    // Backend bytes that arrived together with the 101 head.
    if !backend_buffered.is_empty() {
        client_conn.write_all(&backend_buffered).await?;
    }
    client_conn.flush().await?;

    // Client bytes that arrived together with the request.
    if !client_buffered.is_empty() {
        tracing::trace!(bytes = client_buffered.len(), "Replaying buffered client bytes");
        backend_conn.write_all(&client_buffered).await?;
        backend_conn.flush().await?;
    }

    let client = client_conn.into_half_close().map_err(|_| {
        ProxyError::Configuration("client connection does not support half-close".into())
    })?;
    let backend = backend_conn.into_half_close().map_err(|_| {
        ProxyError::Configuration("backend connection does not support half-close".into())
    })?;

    metrics::pipe_opened();
    let stats = HalfDuplexPipe::new(client, backend).run().await;
    metrics::pipe_closed();

    Ok(stats)
}
