//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → forwarder.rs (dial, rewrite, hooks, exchange, commit head)
//!         │
//!         ├─ status != 101
//!         │     → body.rs (buffered client body)
//!         │     → flusher.rs (flush every interval until the request scope ends)
//!         │
//!         └─ status == 101
//!               → upgrade.rs (take over both connections, replay buffered bytes)
//!               → pipe.rs (two copy loops, independent half-close)
//! ```
//!
//! # Design Decisions
//! - One backend connection per request, owned by the forwarder until the
//!   response ends or a protocol upgrade moves it into the pipe
//! - Hooks are function values fixed at construction (hooks.rs)
//! - Errors before the head is committed become error pages; after that they
//!   are only logged (error.rs)

pub mod body;
pub mod error;
pub mod flusher;
pub mod forwarder;
pub mod hooks;
pub mod pipe;
pub mod upgrade;

pub use body::{response_channel, ChannelBody, ResponseWriter};
pub use error::{BoxError, ErrorKind, ProxyError};
pub use flusher::{Flush, PeriodicFlusher, DEFAULT_FLUSH_INTERVAL};
pub use forwarder::RequestForwarder;
pub use hooks::{Director, ModifyResponse};
pub use pipe::{HalfDuplexPipe, PipeStats};
pub use upgrade::handle_upgrade;
