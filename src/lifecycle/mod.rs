//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     root Scope cancelled → listener stops accepting
//!     → connection scopes cancelled → in-flight requests observe it
//!
//! Scopes (scope.rs):
//!     shutdown scope
//!       └─ connection scope (one per client connection)
//!            └─ request scope (one per forwarded request)
//! ```
//!
//! # Design Decisions
//! - Cancellation only flows downward; a finished request never cancels its
//!   connection
//! - Shutdown waits up to a grace period for connections to drain, then the
//!   server returns; upgraded streams still relaying at that point end when
//!   the runtime stops

pub mod scope;
pub mod shutdown;
pub mod signals;

pub use scope::{Scope, ScopeGuard};
pub use shutdown::Shutdown;
