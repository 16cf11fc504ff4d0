// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Cancellation and deadline carrier threaded through every user callback.
///
/// A `Context` wraps a [`CancellationToken`] together with an optional
/// deadline and a cancellation cause. Deriving a child with
/// [`Context::with_timeout`] produces a context that is cancelled whenever
/// its parent is; cancelling a child does not affect the parent.
///
/// All clones of one context share the same token and cause.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<String>,
    parent: Option<Arc<ContextInner>>,
}

impl Context {
    /// Creates a root context with no deadline.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    ///
    /// If the parent already has an earlier deadline, the child keeps it.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(parent) if parent < own => Some(parent),
            _ => Some(own),
        };
        Self {
            inner: Arc::new(ContextInner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancels this context (and its children) with the given cause.
    ///
    /// The first cause recorded on a context wins; later calls only cancel.
    pub fn cancel(&self, cause: impl Into<String>) {
        let _ = self.inner.cause.set(cause.into());
        self.inner.token.cancel();
    }

    /// Returns true once the context has been cancelled, directly or via a
    /// parent.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Returns the cancellation cause, walking up to the nearest ancestor
    /// that recorded one.
    pub fn cause(&self) -> Option<String> {
        let mut next = Some(&self.inner);
        while let Some(inner) = next {
            if let Some(cause) = inner.cause.get() {
                return Some(cause.clone());
            }
            next = inner.parent.as_ref();
        }
        None
    }

    /// Returns the context's deadline, if it has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns the time remaining until the deadline. `None` means no
    /// deadline; a zero duration means the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_cancellation() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(60));
        assert!(!child.is_cancelled());

        root.cancel("run aborted");
        assert!(child.is_cancelled());
        assert_eq!(child.cause().as_deref(), Some("run aborted"));
    }

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(60));
        child.cancel("hook timeout");

        assert!(!root.is_cancelled());
        assert_eq!(root.cause(), None);
        assert_eq!(child.cause().as_deref(), Some("hook timeout"));
    }

    #[test]
    fn nearest_cause_wins() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(60));
        root.cancel("outer");
        child.cancel("inner");
        assert_eq!(child.cause().as_deref(), Some("inner"));
    }

    #[test]
    fn deadlines_tighten_only() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(1));
        let grandchild = child.with_timeout(Duration::from_secs(600));
        // The grandchild keeps the child's earlier deadline.
        assert!(grandchild.deadline().unwrap() <= Instant::now() + Duration::from_secs(1));
    }

    #[test]
    fn first_cause_wins_per_context() {
        let ctx = Context::new();
        ctx.cancel("first");
        ctx.cancel("second");
        assert_eq!(ctx.cause().as_deref(), Some("first"));
    }
}
