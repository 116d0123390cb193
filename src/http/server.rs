//! HTTP server setup and connection serving.
//!
//! # Responsibilities
//! - Accept client connections from the [`Listener`]
//! - Serve each one with hyper's HTTP/1.1 driver, upgrades enabled
//! - Attach the connection [`Scope`] and [`ConnectionLease`] to every
//!   request it carries
//! - Route every request to the [`RequestForwarder`] through an Axum router
//!   with request tracing
//! - Drain open connections on shutdown
//!
//! # Design Decisions
//! - Connections are served directly rather than through `axum::serve` so the
//!   client stream keeps its concrete [`BoxedConnection`] type; the upgrade
//!   path recovers it by that type.
//! - A connection counts against the listener limit and the drain until its
//!   lease is released, which for an upgraded stream is when the relay ends.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::lifecycle::Scope;
use crate::net::connection::{BoxedConnection, ConnectionLease, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::proxy::{ProxyError, RequestForwarder};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    tracker: ConnectionTracker,
    shutdown_grace: Duration,
}

impl HttpServer {
    /// Create a server forwarding to the configured backend.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let forwarder = RequestForwarder::from_config(config)?;
        Ok(Self::from_forwarder(forwarder).with_shutdown_grace(config.timeouts.shutdown_grace()))
    }

    /// Create a server around an already built forwarder.
    pub fn from_forwarder(forwarder: RequestForwarder) -> Self {
        Self {
            router: Self::build_router(Arc::new(forwarder)),
            tracker: ConnectionTracker::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the Axum router. Every method and path goes to the forwarder.
    fn build_router(forwarder: Arc<RequestForwarder>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(forwarder)
            .layer(TraceLayer::new_for_http())
    }

    /// Live client connections.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept and serve connections until `shutdown` is cancelled, then wait
    /// for open connections to finish within the grace period.
    pub async fn run(self, listener: Listener, shutdown: Scope) -> io::Result<()> {
        tracing::info!(address = %listener.describe(), "HTTP server starting");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (conn, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    // Usually fd exhaustion; give other connections a moment to close.
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener stopped");
                    break;
                }
            };

            let lease = ConnectionLease::new(self.tracker.track(), Some(permit));
            let span = tracing::info_span!("connection", id = %lease.id(), peer = %peer);
            tokio::spawn(
                serve_connection(conn, self.router.clone(), shutdown.child(), lease)
                    .instrument(span),
            );
        }

        drop(listener);
        tracing::info!(
            active_connections = self.tracker.active_count(),
            "Listener closed; draining connections"
        );
        if !self.tracker.wait_for_drain(self.shutdown_grace).await {
            tracing::warn!(
                active_connections = self.tracker.active_count(),
                grace = ?self.shutdown_grace,
                "Grace period elapsed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Serve one client connection until it closes, is upgraded, or shutdown
/// asks it to finish its current exchange.
async fn serve_connection(
    conn: BoxedConnection,
    router: Router,
    scope: Scope,
    lease: ConnectionLease,
) {
    let request_parent = scope.clone();
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(request_parent.clone());
        request.extensions_mut().insert(lease.clone());
        router.clone().oneshot(request)
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    let connection = builder
        .serve_connection(TokioIo::new(conn), service)
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = scope.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Connection ended with error");
    }

    // Requests still relaying a body observe this and stop.
    scope.cancel();
}

/// Fallback handler: every request is forwarded.
async fn proxy_handler(
    State(forwarder): State<Arc<RequestForwarder>>,
    request: Request<Body>,
) -> Response {
    forwarder.forward(request).await
}
