// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Legacy preconditions.
//!
//! A precondition is the one-level ancestor of fixtures: an object attached
//! directly to a test, compared by identity, prepared before the first of a
//! run of consecutive tests sharing it and closed after the last. New code
//! should declare a fixture instead; the planner supports both, and a test
//! may carry at most one of the two.

use crate::{fixture::FixtureValue, state::State, Context};
use std::{sync::Arc, time::Duration};

/// Default timeout for `prepare` and `close`.
pub const DEFAULT_PRECONDITION_TIMEOUT: Duration = Duration::from_secs(15);

/// A shared precondition object. Tests share a precondition by holding
/// clones of the same `Arc`; the planner groups them by pointer identity.
pub type SharedPrecondition = Arc<dyn Precondition>;

/// User-provided precondition behavior.
pub trait Precondition: Send + Sync {
    /// The precondition's name, used in event output and error prefixes.
    fn name(&self) -> &str;

    /// Timeout for [`Precondition::prepare`].
    fn prepare_timeout(&self) -> Duration {
        DEFAULT_PRECONDITION_TIMEOUT
    }

    /// Timeout for [`Precondition::close`].
    fn close_timeout(&self) -> Duration {
        DEFAULT_PRECONDITION_TIMEOUT
    }

    /// Establishes the precondition before the first dependent test of a
    /// group. The returned value is exposed to each dependent test.
    fn prepare(&self, ctx: &Context, s: &State) -> Option<FixtureValue>;

    /// Releases the precondition after the last dependent test of a group.
    fn close(&self, ctx: &Context, s: &State);
}

/// True if two precondition handles are the same object.
pub fn same_precondition(a: &SharedPrecondition, b: &SharedPrecondition) -> bool {
    Arc::ptr_eq(a, b)
}
