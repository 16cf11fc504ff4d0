// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-test stage list.
//!
//! Every test runs through the same flat sequence of stages; the planner
//! loops over the list rather than nesting calls. Only the test-function
//! stage is gated on "no error so far" — later stages run even after an
//! earlier stage failed, so fixtures always get their `post_test` and the
//! run-wide hook always gets its closing half.

use crate::{
    data::{self, DataFileRef},
    dut::SharedDut,
    errors::SafeCallError,
    fsutil,
    registry::Test,
    safecall::safe_call,
    state::State,
    Context,
};
use camino::Utf8PathBuf;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// Timeout for the framework-owned stages (setup, post-test hook).
pub(crate) const STAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for every stage.
pub(crate) const STAGE_GRACE: Duration = Duration::from_secs(30);

/// Exit-grace for a test that does not declare one.
pub(crate) const DEFAULT_TEST_GRACE: Duration = Duration::from_secs(30);

/// One entry of the stage list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stage {
    pub(crate) name: &'static str,
    pub(crate) kind: StageKind,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum StageKind {
    Setup,
    FixturePreTest,
    TestFunc,
    FixturePostTest,
    PostTestHook,
}

/// The stage list, in execution order.
pub(crate) const STAGES: &[Stage] = &[
    Stage {
        name: "setup",
        kind: StageKind::Setup,
    },
    Stage {
        name: "fixture_pre_test",
        kind: StageKind::FixturePreTest,
    },
    Stage {
        name: "test",
        kind: StageKind::TestFunc,
    },
    Stage {
        name: "fixture_post_test",
        kind: StageKind::FixturePostTest,
    },
    Stage {
        name: "post_test_hook",
        kind: StageKind::PostTestHook,
    },
];

/// The closing half of the run-wide test hook.
pub type PostTestHookFn = Box<dyn FnOnce(&Context, &State) + Send>;

/// The run-wide test hook, called during the setup stage of every test; the
/// returned closure runs after the test's `post_test` fixtures.
pub type TestHookFn = Arc<dyn Fn(&Context, &State) -> Option<PostTestHookFn> + Send + Sync>;

/// Slot carrying the hook closure from the setup stage to the post-test
/// stage.
pub(crate) type HookSlot = Arc<Mutex<Option<PostTestHookFn>>>;

/// Grace period for a test function: its declared exit timeout, or the
/// default when it declared none.
pub(crate) fn test_grace(test: &Test) -> Duration {
    if test.exit_timeout().is_zero() {
        DEFAULT_TEST_GRACE
    } else {
        test.exit_timeout()
    }
}

/// Runs one framework or user closure through the safe-call runner against
/// the test's state. Timeouts become test errors; only cancellation aborts.
pub(crate) async fn run_stage<F>(
    ctx: &Context,
    name: String,
    timeout: Duration,
    grace: Duration,
    state: &State,
    f: F,
) -> Result<(), SafeCallError>
where
    F: FnOnce(&Context, &State) + Send + 'static,
{
    let hook_state = state.clone();
    let panic_state = state.clone();
    let result = safe_call(
        ctx,
        &name,
        timeout,
        grace,
        move |message| panic_state.report_panic(message),
        move |call_ctx| f(call_ctx, &hook_state),
    )
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(err @ SafeCallError::DidNotReturn { .. }) => {
            state.error(err.to_string());
            state.log("worker thread abandoned");
            Ok(())
        }
        Err(err @ SafeCallError::Cancelled { .. }) => Err(err),
    }
}

/// Builds the setup-stage closure: create the test's output directory,
/// verify its data files, bring the DUT back if the previous test lost it,
/// and run the opening half of the run-wide test hook.
pub(crate) fn setup_stage(
    out_dir: Utf8PathBuf,
    data_dir: Utf8PathBuf,
    data_files: Vec<DataFileRef>,
    dut: Option<SharedDut>,
    test_hook: Option<TestHookFn>,
    hook_slot: HookSlot,
) -> impl FnOnce(&Context, &State) + Send + 'static {
    move |call_ctx, s| {
        if let Err(err) = fsutil::make_out_dir(&out_dir) {
            s.error(format!("failed to create output directory: {err}"));
        }

        for err in data::verify_files(&data_dir, &data_files) {
            s.error(err.reason);
        }

        if let Some(dut) = dut {
            let mut guard = dut.lock().unwrap_or_else(PoisonError::into_inner);
            if !guard.connected(call_ctx) {
                s.log("Reconnecting to DUT");
                if let Err(err) = guard.reconnect(call_ctx) {
                    s.error(err.to_string());
                }
            }
        }

        if let Some(hook) = test_hook {
            *hook_slot.lock().unwrap_or_else(PoisonError::into_inner) = hook(call_ctx, s);
        }
    }
}

/// Builds the post-test-hook stage closure.
pub(crate) fn post_test_hook_stage(
    hook_slot: HookSlot,
) -> impl FnOnce(&Context, &State) + Send + 'static {
    move |call_ctx, s| {
        let hook = hook_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(call_ctx, s);
        }
    }
}
