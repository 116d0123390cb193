//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client connection (TCP / Unix)
//!     → server.rs (hyper HTTP/1.1 driver, upgrades enabled)
//!     → connection Scope attached to each request
//!     → Axum router + TraceLayer
//!     → proxy::RequestForwarder
//!     → response head + streamed body, or 101 and connection takeover
//! ```

pub mod server;

pub use server::HttpServer;
