//! Cancellable scopes.
//!
//! A [`Scope`] lets a parent operation tell everything it started to stop.
//! Scopes form a tree: cancelling a scope cancels every scope derived from
//! it with [`Scope::child`], never the other way round.
//!
//! # Design Decisions
//! - Built on a `watch` channel per scope; waiting is cheap and cancellation
//!   is observed by every clone.
//! - [`ScopeGuard`] ties cancellation to a value's lifetime so every exit
//!   path of a function cancels its scope.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

#[derive(Debug)]
struct ScopeInner {
    cancelled: watch::Sender<bool>,
    parent: Option<Scope>,
}

/// Handle to a cancellable scope. Clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create a new root scope.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Scope>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner { cancelled, parent }),
        }
    }

    /// Derive a scope that is cancelled together with this one.
    pub fn child(&self) -> Scope {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancel this scope and all scopes derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Whether this scope or one of its ancestors has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancelled.borrow() {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }

    /// Resolves once this scope or one of its ancestors is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.inner.cancelled.subscribe();
            match &self.inner.parent {
                // The sender lives as long as `self`, so `wait_for` only
                // returns once the flag flips.
                None => {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                Some(parent) => {
                    tokio::select! {
                        _ = rx.wait_for(|cancelled| *cancelled) => {}
                        _ = parent.cancelled() => {}
                    }
                }
            }
        })
    }

    /// Wrap this scope in a guard that cancels it when dropped.
    pub fn drop_guard(self) -> ScopeGuard {
        ScopeGuard { scope: self }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels the wrapped scope on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: Scope,
}

impl ScopeGuard {
    /// The guarded scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}
