// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures: reusable, composable per-batch setup objects.
//!
//! A fixture has five hooks. `set_up` runs once when the fixture is first
//! needed and may yield an opaque value, visible to every test below it and
//! to a child fixture's `set_up` as its parent value. `reset` runs between
//! consecutive tests sharing the fixture and restores the state `set_up`
//! established; returning an error is a cheap way to say "tear me down and
//! set me up again". `pre_test`/`post_test` bracket every dependent test.
//! `tear_down` releases whatever `set_up` acquired.
//!
//! Fixtures form a forest through their parent names; the running batch
//! keeps one root-to-leaf path alive at a time in a [`FixtureStack`].

mod stack;

pub use stack::{FixtureStack, StackColor, StackConfig};

use crate::{errors::ResetError, state::State, Context};
use std::{
    any::Any,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Default timeout for each fixture hook, unless the fixture declares its
/// own.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// The opaque value a fixture exposes to its descendants.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// User-provided fixture behavior.
///
/// Every hook has a no-op default so implementations only override what
/// they need. Hooks report failures through the [`State`] facade
/// (`error`/`fatal`); `reset` additionally returns a result because a
/// failed reset is recoverable rather than fatal.
pub trait FixtureImpl: Send {
    /// Establishes the fixture's state. The returned value becomes the
    /// stack's top value while this fixture is green.
    fn set_up(&mut self, ctx: &Context, s: &State) -> Option<FixtureValue> {
        let _ = (ctx, s);
        None
    }

    /// Restores the state `set_up` established, between tests.
    fn reset(&mut self, ctx: &Context, s: &State) -> Result<(), ResetError> {
        let _ = (ctx, s);
        Ok(())
    }

    /// Runs before every dependent test. Errors land on the test.
    fn pre_test(&mut self, ctx: &Context, s: &State) {
        let _ = (ctx, s);
    }

    /// Runs after every dependent test, even a failed one. Errors land on
    /// the test.
    fn post_test(&mut self, ctx: &Context, s: &State) {
        let _ = (ctx, s);
    }

    /// Releases the fixture's state.
    fn tear_down(&mut self, ctx: &Context, s: &State) {
        let _ = (ctx, s);
    }
}

/// A registered fixture: its identity, hooks, and per-hook timeouts.
pub struct Fixture {
    name: String,
    parent: String,
    service_deps: Vec<String>,
    imp: Mutex<Box<dyn FixtureImpl>>,
    set_up_timeout: Duration,
    reset_timeout: Duration,
    pre_test_timeout: Duration,
    post_test_timeout: Duration,
    tear_down_timeout: Duration,
}

impl Fixture {
    /// Creates a fixture with no parent and default hook timeouts.
    pub fn new(name: impl Into<String>, imp: impl FixtureImpl + 'static) -> Self {
        Self {
            name: name.into(),
            parent: String::new(),
            service_deps: Vec::new(),
            imp: Mutex::new(Box::new(imp)),
            set_up_timeout: DEFAULT_HOOK_TIMEOUT,
            reset_timeout: DEFAULT_HOOK_TIMEOUT,
            pre_test_timeout: DEFAULT_HOOK_TIMEOUT,
            post_test_timeout: DEFAULT_HOOK_TIMEOUT,
            tear_down_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Declares the fixture's parent.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = parent.into();
        self
    }

    /// Declares the services the fixture's hooks may use.
    pub fn with_service_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.service_deps = deps.into_iter().collect();
        self
    }

    /// Overrides the `set_up` timeout.
    pub fn with_set_up_timeout(mut self, timeout: Duration) -> Self {
        self.set_up_timeout = timeout;
        self
    }

    /// Overrides the `reset` timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Overrides the `pre_test` timeout.
    pub fn with_pre_test_timeout(mut self, timeout: Duration) -> Self {
        self.pre_test_timeout = timeout;
        self
    }

    /// Overrides the `post_test` timeout.
    pub fn with_post_test_timeout(mut self, timeout: Duration) -> Self {
        self.post_test_timeout = timeout;
        self
    }

    /// Overrides the `tear_down` timeout.
    pub fn with_tear_down_timeout(mut self, timeout: Duration) -> Self {
        self.tear_down_timeout = timeout;
        self
    }

    /// The fixture's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared parent; empty for the implicit root.
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// The declared service dependencies.
    pub fn service_deps(&self) -> &[String] {
        &self.service_deps
    }

    pub(crate) fn set_up_timeout(&self) -> Duration {
        self.set_up_timeout
    }

    pub(crate) fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub(crate) fn pre_test_timeout(&self) -> Duration {
        self.pre_test_timeout
    }

    pub(crate) fn post_test_timeout(&self) -> Duration {
        self.post_test_timeout
    }

    pub(crate) fn tear_down_timeout(&self) -> Duration {
        self.tear_down_timeout
    }

    /// Locks the implementation for a hook call. Only one user callback is
    /// ever live, so contention means a previous hook was abandoned; the
    /// new call will then block and time out through its own safe call.
    pub(crate) fn lock_imp(&self) -> MutexGuard<'_, Box<dyn FixtureImpl>> {
        self.imp.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}
