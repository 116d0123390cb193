//! Backend dialing.
//!
//! # Responsibilities
//! - Abstract how a backend connection is obtained (TCP, Unix socket, or
//!   anything a caller supplies)
//! - Bound each dial with the configured connect timeout
//!
//! # Design Decisions
//! - The address is opaque to the proxy; only the dialer interprets it
//! - One dial per request, never retried here

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use crate::config::Transport;
use crate::net::connection::BoxedConnection;

/// Future returned by a [`Dialer`].
pub type DialFuture = BoxFuture<'static, io::Result<BoxedConnection>>;

/// Opens a fresh connection to the backend.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, address: &str) -> DialFuture;
}

impl<F> Dialer for F
where
    F: Fn(&str) -> DialFuture + Send + Sync + 'static,
{
    fn dial(&self, address: &str) -> DialFuture {
        self(address)
    }
}

/// Dials `host:port` over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, address: &str) -> DialFuture {
        let address = address.to_string();
        Box::pin(async move {
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedConnection)
        })
    }
}

/// Dials a Unix domain socket path.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixDialer;

#[cfg(unix)]
impl Dialer for UnixDialer {
    fn dial(&self, address: &str) -> DialFuture {
        let path = address.to_string();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            Ok(Box::new(stream) as BoxedConnection)
        })
    }
}

/// Select the dialer for a configured transport.
pub fn dialer_for(transport: Transport) -> io::Result<Arc<dyn Dialer>> {
    match transport {
        Transport::Tcp => Ok(Arc::new(TcpDialer)),
        #[cfg(unix)]
        Transport::Unix => Ok(Arc::new(UnixDialer)),
        #[cfg(not(unix))]
        Transport::Unix => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
    }
}

/// Dial once, giving up after `timeout`.
pub async fn dial_with_timeout(
    dialer: &dyn Dialer,
    address: &str,
    timeout: Duration,
) -> io::Result<BoxedConnection> {
    match tokio::time::timeout(timeout, dialer.dial(address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {address} timed out after {timeout:?}"),
        )),
    }
}
