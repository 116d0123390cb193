//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side:
//!     listener.rs (accept TCP / Unix, connection limits)
//!     → BoxedConnection handed to the HTTP layer
//!
//! Backend side:
//!     dial.rs (one fresh dial per request, connect timeout)
//!     → BoxedConnection owned by the forwarder
//!
//! Both sides:
//!     connection.rs (Connection trait, half-close split, tracking)
//! ```
//!
//! # Design Decisions
//! - Backend connections are never pooled or reused
//! - Half-close support is a property of the concrete transport, checked
//!   explicitly where it is needed

pub mod connection;
pub mod dial;
pub mod listener;

pub use connection::{
    BoxedConnection, Connection, ConnectionId, ConnectionLease, ConnectionTracker, HalfCloseStream,
};
pub use dial::{dial_with_timeout, dialer_for, DialFuture, Dialer, TcpDialer};
pub use listener::{ConnectionPermit, Listener, ListenerError, PeerAddr};
