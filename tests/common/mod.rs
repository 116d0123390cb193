//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use duplex_proxy::net::{ConnectionTracker, Listener, TcpDialer};
use duplex_proxy::{HttpServer, RequestForwarder, Shutdown};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};

/// Start a raw TCP backend on an ephemeral port; `handler` runs once per
/// accepted connection.
pub async fn start_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handler(socket));
        }
    });
    addr
}

/// A forwarder dialing `backend` over TCP.
pub fn forwarder_for(backend: SocketAddr) -> RequestForwarder {
    RequestForwarder::new(Arc::new(TcpDialer), backend.to_string())
}

/// Serve `forwarder` on an ephemeral port until the returned handle is
/// triggered.
pub async fn start_proxy(forwarder: RequestForwarder) -> (SocketAddr, Shutdown) {
    let (addr, shutdown, _) = start_limited_proxy(forwarder, 64).await;
    (addr, shutdown)
}

/// Like [`start_proxy`], accepting at most `max_connections` clients at once
/// and exposing the server's connection tracker.
pub async fn start_limited_proxy(
    forwarder: RequestForwarder,
    max_connections: usize,
) -> (SocketAddr, Shutdown, ConnectionTracker) {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, max_connections);
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::from_forwarder(forwarder);
    let tracker = server.tracker();
    tokio::spawn(server.run(listener, shutdown.subscribe()));
    (addr, shutdown, tracker)
}

/// Read an HTTP message head one byte at a time, leaving anything after the
/// blank line unread.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
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

/// Request head asking for a raw stream upgrade.
pub fn upgrade_request(path: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n"
    )
}
