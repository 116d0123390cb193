//! Shutdown coordination for the proxy.

use crate::lifecycle::scope::Scope;

/// Coordinator for graceful shutdown.
///
/// Owns the root [`Scope`]; every long-running task subscribes to a child of it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    root: Scope,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> Scope {
        self.root.child()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.root.cancel();
    }
}
