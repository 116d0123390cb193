//! Half-close aware HTTP forwarding proxy.
//!
//! Relays HTTP/1.1 traffic from local clients to a single backend reachable
//! only through a dialed byte stream (a Unix socket, a TCP port, or anything a
//! [`net::Dialer`] can open), preserving the streaming behavior the backend
//! relies on: long-lived responses are flushed periodically, and `101
//! Switching Protocols` responses turn both connections into a raw duplex
//! pipe where each direction closes independently.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod proxy;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::{Scope, Shutdown};
pub use proxy::{ProxyError, RequestForwarder};
