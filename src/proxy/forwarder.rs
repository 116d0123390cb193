//! Per-request forwarding orchestration.
//!
//! # Responsibilities
//! - Dial the backend once per request
//! - Rewrite the request to the synthetic target and run the Director hook
//! - Exchange the request/response over a dedicated HTTP/1.1 connection
//! - Run the ModifyResponse hook and propagate status and headers verbatim
//! - Stream the body with periodic flushing, or hand a `101` to the upgrade
//!   handler
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → request scope (child of the connection scope)
//!     → dial (connect timeout, no retry)           ── fail → 502
//!     → outbound request + Director + keep-alive
//!     → handshake / write / parse response          ── fail → 502
//!     → ModifyResponse                              ── fail → 502
//!     → status + headers returned to the HTTP layer (commit)
//!     → 101: upgrade task → HalfDuplexPipe
//!       else: body copy task + PeriodicFlusher
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{CONNECTION, HOST};
use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body::Body as HttpBody;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::lifecycle::{Scope, ScopeGuard};
use crate::net::connection::ConnectionLease;
use crate::net::dial::{dial_with_timeout, dialer_for, Dialer};
use crate::observability::metrics;
use crate::proxy::body::{copy_body, response_channel, ResponseWriter};
use crate::proxy::error::{BoxError, ProxyError};
use crate::proxy::flusher::{Flush, PeriodicFlusher, DEFAULT_FLUSH_INTERVAL};
use crate::proxy::hooks::{Director, ModifyResponse};
use crate::proxy::upgrade::handle_upgrade;

/// Authority every outbound request is addressed to unless configured.
pub const DEFAULT_SYNTHETIC_HOST: &str = "api.moby.localhost";

const DEFAULT_WRITE_BUFFER: usize = 4096;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Relays requests to a single backend reached through a [`Dialer`].
pub struct RequestForwarder {
    dialer: Arc<dyn Dialer>,
    address: String,
    director: Option<Director>,
    modify_response: Option<ModifyResponse>,
    scheme: Scheme,
    authority: Authority,
    host: HeaderValue,
    flush_interval: Duration,
    write_buffer_bytes: usize,
    connect_timeout: Duration,
}

impl RequestForwarder {
    /// Forward to `address`, interpreted only by `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>, address: impl Into<String>) -> Self {
        Self {
            dialer,
            address: address.into(),
            director: None,
            modify_response: None,
            scheme: Scheme::HTTP,
            authority: Authority::from_static(DEFAULT_SYNTHETIC_HOST),
            host: HeaderValue::from_static(DEFAULT_SYNTHETIC_HOST),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            write_buffer_bytes: DEFAULT_WRITE_BUFFER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Build a forwarder for the configured backend.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let dialer = dialer_for(config.backend.transport)
            .map_err(|e| ProxyError::Configuration(format!("backend transport: {e}")))?;

        let forwarder = Self::new(dialer, config.backend.address.clone())
            .with_synthetic_target(
                &config.forwarding.synthetic_scheme,
                &config.forwarding.synthetic_host,
            )?
            .with_flush_interval(config.forwarding.flush_interval())
            .with_write_buffer(config.forwarding.write_buffer_bytes)
            .with_connect_timeout(config.timeouts.connect());
        Ok(forwarder)
    }

    pub fn with_director<F>(mut self, director: F) -> Self
    where
        F: Fn(&mut Request<Body>) + Send + Sync + 'static,
    {
        self.director = Some(Arc::new(director));
        self
    }

    pub fn with_modify_response<F>(mut self, modify: F) -> Self
    where
        F: Fn(&mut Response<Incoming>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.modify_response = Some(Arc::new(modify));
        self
    }

    /// Address outbound requests to `scheme://authority`.
    pub fn with_synthetic_target(mut self, scheme: &str, authority: &str) -> Result<Self, ProxyError> {
        self.scheme = scheme
            .parse()
            .map_err(|e| ProxyError::Configuration(format!("invalid synthetic scheme {scheme:?}: {e}")))?;
        self.authority = authority
            .parse()
            .map_err(|e| ProxyError::Configuration(format!("invalid synthetic host {authority:?}: {e}")))?;
        self.host = HeaderValue::from_str(self.authority.as_str())
            .map_err(|e| ProxyError::Configuration(format!("invalid synthetic host {authority:?}: {e}")))?;
        Ok(self)
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_write_buffer(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Forward one request and produce the client-facing response.
    ///
    /// Failures before the response head is returned become error pages.
    /// Once it is returned the body or upgraded stream is relayed by a
    /// background task and failures are only logged.
    pub async fn forward(&self, request: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = request.method().clone();

        let response = match self.try_forward(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    kind = ?err.kind(),
                    error = %err,
                    "Request failed before response commit"
                );
                err.into_response()
            }
        };

        metrics::record_request(method.as_str(), response.status().as_u16(), start);
        response
    }

    async fn try_forward(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        // 1. Request scope, cancelled on every exit path
        let scope = request
            .extensions()
            .get::<Scope>()
            .map(Scope::child)
            .unwrap_or_default();
        let guard = scope.drop_guard();

        let (mut parts, body) = request.into_parts();
        let client_upgrade = parts.extensions.remove::<OnUpgrade>();
        let lease = parts.extensions.remove::<ConnectionLease>();

        // 2. Dial, exactly once
        let conn = dial_with_timeout(self.dialer.as_ref(), &self.address, self.connect_timeout)
            .await
            .map_err(|source| {
                metrics::record_dial_failure();
                ProxyError::Dial {
                    address: self.address.clone(),
                    source,
                }
            })?;

        // 3. Outbound request
        let mut outbound = self.build_outbound(parts, body)?;
        if let Some(director) = &self.director {
            director(&mut outbound);
        }
        into_origin_form(&mut outbound);
        force_keep_alive(outbound.headers_mut());

        tracing::debug!(
            method = %outbound.method(),
            target = %outbound.uri(),
            backend = %self.address,
            "Forwarding request"
        );

        // 4. + 5. Write the request and read the response head
        let (mut sender, connection) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(conn))
            .await
            .map_err(ProxyError::Handshake)?;
        tokio::spawn(
            async move {
                if let Err(e) = connection.with_upgrades().await {
                    tracing::debug!(error = %e, "Backend connection ended with error");
                }
            }
            .in_current_span(),
        );

        let mut response = sender
            .send_request(outbound)
            .await
            .map_err(ProxyError::from_exchange)?;

        // 6. Response hook
        if let Some(modify) = &self.modify_response {
            modify(&mut response).map_err(ProxyError::Hook)?;
        }

        // 7. Status and headers
        let mut head = Response::new(Body::empty());
        *head.status_mut() = response.status();
        copy_headers(response.headers(), head.headers_mut());

        // 8. + 9. Returning the head commits it; the relay continues in the background
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                return Err(ProxyError::Configuration(
                    "backend switched protocols but the client connection cannot be taken over".into(),
                ));
            };
            let backend_upgrade = hyper::upgrade::on(&mut response);
            drop(sender);

            tokio::spawn(
                async move {
                    let _guard = guard;
                    let _lease = lease;
                    match handle_upgrade(client_upgrade, backend_upgrade).await {
                        Ok(stats) => tracing::debug!(
                            client_to_backend = stats.a_to_b,
                            backend_to_client = stats.b_to_a,
                            "Upgraded stream finished"
                        ),
                        Err(e) => tracing::error!(kind = ?e.kind(), error = %e, "Upgraded stream failed"),
                    }
                }
                .in_current_span(),
            );
            return Ok(head);
        }

        let (writer, client_body) = response_channel(self.write_buffer_bytes);
        *head.body_mut() = Body::new(client_body);

        let sink = Arc::new(writer.clone()) as Arc<dyn Flush>;
        spawn_relay(response.into_body(), writer, sink, guard, self.flush_interval);

        Ok(head)
    }

    /// Same method, path, query, headers and body, addressed to the
    /// synthetic target.
    fn build_outbound(&self, parts: Parts, body: Body) -> Result<Request<Body>, ProxyError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Configuration(format!("invalid outbound target: {e}")))?;

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = parts.headers;
        outbound.headers_mut().insert(HOST, self.host.clone());
        Ok(outbound)
    }
}

/// Relay `body` to `writer` in the background while `sink` is flushed every
/// `interval`. The task ends once both the copy and the flusher have stopped.
fn spawn_relay<B>(
    body: B,
    writer: ResponseWriter,
    sink: Arc<dyn Flush>,
    guard: ScopeGuard,
    interval: Duration,
) -> JoinHandle<()>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    let flusher = PeriodicFlusher::new(interval).spawn(Some(sink), guard.scope().clone());
    tokio::spawn(
        async move {
            relay_body(body, writer, guard).await;
            let _ = flusher.await;
        }
        .in_current_span(),
    )
}

/// Copy the backend body to the client until it ends, fails, or the request
/// scope is cancelled. Dropping `guard` stops the flusher.
async fn relay_body<B>(body: B, writer: ResponseWriter, guard: ScopeGuard)
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let scope = guard.scope().clone();
    tokio::select! {
        result = copy_body(body, &writer) => match result {
            Ok(bytes) => tracing::debug!(bytes, "Response body relayed"),
            Err(e) => {
                let err = ProxyError::Stream(e);
                tracing::warn!(kind = ?err.kind(), error = %err, "Response body relay failed");
            }
        },
        _ = scope.cancelled() => {
            tracing::debug!("Request cancelled; abandoning backend response");
            writer
                .abort(std::io::Error::new(std::io::ErrorKind::Interrupted, "request cancelled"))
                .await;
        }
    }
    drop(guard);
}

/// Write the target in origin-form, keeping the authority as `Host`.
fn into_origin_form(request: &mut Request<Body>) {
    if let Some(authority) = request.uri().authority() {
        if !request.headers().contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                request.headers_mut().insert(HOST, host);
            }
        }
    }
    let path_and_query = request
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *request.uri_mut() = Uri::from(path_and_query);
}

/// Drop `close` tokens so the backend connection stays usable after the
/// response head, which an upgraded stream depends on.
fn force_keep_alive(headers: &mut HeaderMap) {
    if !headers.contains_key(CONNECTION) {
        return;
    }
    let kept: Vec<HeaderValue> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| {
            let Ok(text) = value.to_str() else {
                return Some(value.clone());
            };
            let tokens: Vec<&str> = text
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("close"))
                .collect();
            if tokens.is_empty() {
                None
            } else {
                HeaderValue::from_str(&tokens.join(", ")).ok()
            }
        })
        .collect();

    headers.remove(CONNECTION);
    for value in kept {
        headers.append(CONNECTION, value);
    }
}

/// Append every header, keeping repeated names and value order.
fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        to.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dial::DialFuture;
    use crate::net::BoxedConnection;
    use futures_util::future::BoxFuture;
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    async fn read_head(stream: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// A dialer whose every connection is served by `reply` and whose
    /// request heads are reported on the returned channel.
    fn canned_backend(reply: &'static [u8]) -> (Arc<dyn Dialer>, mpsc::UnboundedReceiver<String>) {
        let (heads_tx, heads_rx) = mpsc::unbounded_channel();
        let dialer = move |_: &str| -> DialFuture {
            let (proxy_side, mut backend) = tokio::io::duplex(4096);
            let heads_tx = heads_tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut backend).await;
                let _ = heads_tx.send(head);
                backend.write_all(reply).await.unwrap();
                let mut rest = Vec::new();
                let _ = backend.read_to_end(&mut rest).await;
            });
            Box::pin(async move { Ok(Box::new(proxy_side) as BoxedConnection) })
        };
        (Arc::new(dialer), heads_rx)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn outbound_targets_synthetic_authority() {
        let forwarder = RequestForwarder::new(Arc::new(crate::net::TcpDialer), "unused");
        let (parts, body) = Request::builder()
            .method("POST")
            .uri("http://localhost:2375/v1.43/containers/json?all=1")
            .header(HOST, "localhost:2375")
            .header("x-trace", "a")
            .header("x-trace", "b")
            .body(Body::empty())
            .unwrap()
            .into_parts();

        let mut outbound = forwarder.build_outbound(parts, body).unwrap();
        assert_eq!(outbound.method(), "POST");
        assert_eq!(
            outbound.uri(),
            "http://api.moby.localhost/v1.43/containers/json?all=1"
        );
        assert_eq!(outbound.headers()[HOST], "api.moby.localhost");
        let traces: Vec<_> = outbound.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces, ["a", "b"]);

        into_origin_form(&mut outbound);
        assert_eq!(outbound.uri(), "/v1.43/containers/json?all=1");
        assert_eq!(outbound.headers()[HOST], "api.moby.localhost");
    }

    #[test]
    fn keep_alive_strips_close_tokens_only() {
        let mut headers = HeaderMap::new();
        headers.append(CONNECTION, HeaderValue::from_static("close"));
        headers.append(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
        force_keep_alive(&mut headers);

        let values: Vec<_> = headers.get_all(CONNECTION).iter().collect();
        assert_eq!(values, ["Upgrade"]);

        let mut only_close = HeaderMap::new();
        only_close.insert(CONNECTION, HeaderValue::from_static("close"));
        force_keep_alive(&mut only_close);
        assert!(!only_close.contains_key(CONNECTION));
    }

    #[test]
    fn copied_headers_keep_order_and_repeats() {
        let mut from = HeaderMap::new();
        from.append("set-cookie", HeaderValue::from_static("a=1"));
        from.append("content-type", HeaderValue::from_static("text/plain"));
        from.append("set-cookie", HeaderValue::from_static("b=2"));

        let mut to = HeaderMap::new();
        copy_headers(&from, &mut to);
        let cookies: Vec<_> = to.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(to.len(), 3);
    }

    #[test]
    fn rejects_invalid_synthetic_host() {
        let result = RequestForwarder::new(Arc::new(crate::net::TcpDialer), "unused")
            .with_synthetic_target("http", "bad host");
        assert!(matches!(result, Err(ProxyError::Configuration(_))));
    }

    #[tokio::test]
    async fn relays_backend_response() {
        let (dialer, mut heads) =
            canned_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Multi: 1\r\nX-Multi: 2\r\n\r\nhello");
        let forwarder = RequestForwarder::new(dialer, "backend");

        let response = forwarder.forward(get("/_ping?x=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "5");
        let multi: Vec<_> = response.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, ["1", "2"]);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let head = heads.recv().await.unwrap();
        assert!(head.starts_with("GET /_ping?x=1 HTTP/1.1\r\n"), "{head}");
        assert!(head.to_ascii_lowercase().contains("host: api.moby.localhost\r\n"), "{head}");
    }

    #[tokio::test]
    async fn dial_failure_is_bad_gateway_after_one_attempt() {
        let dials = Arc::new(AtomicUsize::new(0));
        let counter = dials.clone();
        let dialer = move |_: &str| -> DialFuture {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) })
        };
        let forwarder = RequestForwarder::new(Arc::new(dialer), "/run/missing.sock");

        let response = forwarder.forward(get("/info")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_response_is_bad_gateway() {
        let (dialer, _heads) = canned_backend(b"this is not http\r\n\r\n");
        let forwarder = RequestForwarder::new(dialer, "backend");

        let response = forwarder.forward(get("/info")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn failing_response_hook_is_bad_gateway() {
        let (dialer, _heads) = canned_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let forwarder = RequestForwarder::new(dialer, "backend")
            .with_modify_response(|_| Err("rejected by hook".into()));

        let response = forwarder.forward(get("/info")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"response hook failed: rejected by hook\n");
    }

    #[tokio::test]
    async fn director_changes_reach_backend() {
        let (dialer, mut heads) = canned_backend(b"HTTP/1.1 204 No Content\r\n\r\n");
        let forwarder = RequestForwarder::new(dialer, "backend").with_director(|request| {
            request
                .headers_mut()
                .insert("x-forwarded-by", HeaderValue::from_static("duplex-proxy"));
        });

        let response = forwarder.forward(get("/version")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let head = heads.recv().await.unwrap();
        assert!(head.contains("x-forwarded-by: duplex-proxy\r\n"), "{head}");
    }

    #[tokio::test]
    async fn switching_protocols_without_takeover_is_internal_error() {
        let (dialer, _heads) = canned_backend(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
        let forwarder = RequestForwarder::new(dialer, "backend");

        let response = forwarder.forward(get("/containers/abc/attach")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Flush sink over a response writer that counts how often it is driven.
    struct CountingFlush {
        writer: ResponseWriter,
        flushes: AtomicUsize,
    }

    impl Flush for CountingFlush {
        fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async move {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                self.writer.flush().await
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushing_stops_when_body_relay_completes() {
        let (frames_tx, mut frames_rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(1);
        let backend_body = StreamBody::new(futures_util::stream::poll_fn(move |cx| {
            frames_rx.poll_recv(cx)
        }));

        let (writer, mut client_body) = response_channel(1024);
        let sink = Arc::new(CountingFlush {
            writer: writer.clone(),
            flushes: AtomicUsize::new(0),
        });
        let relay = spawn_relay(
            backend_body,
            writer,
            sink.clone() as Arc<dyn Flush>,
            Scope::new().drop_guard(),
            Duration::from_millis(10),
        );

        frames_tx.send(Ok(Frame::data(Bytes::from_static(b"a")))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 3);
        let first = client_body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"a"));

        // End of the backend body ends the relay and its flusher.
        drop(frames_tx);
        tokio::time::timeout(Duration::from_millis(10), relay)
            .await
            .expect("relay should finish within one flush interval")
            .unwrap();
        let at_completion = sink.flushes.load(Ordering::SeqCst);
        assert!(at_completion <= 4, "flushed {at_completion} times");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), at_completion);
        assert!(client_body.frame().await.is_none());
    }

    #[tokio::test]
    async fn connection_close_is_not_forwarded() {
        let (dialer, mut heads) = canned_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let forwarder = RequestForwarder::new(dialer, "backend");

        let request = Request::builder()
            .uri("/info")
            .header(CONNECTION, "close")
            .body(Body::empty())
            .unwrap();
        forwarder.forward(request).await;

        let head = heads.recv().await.unwrap().to_ascii_lowercase();
        assert!(!head.contains("connection: close"), "{head}");
    }
}
