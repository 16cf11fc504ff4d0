// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stack of stateful fixtures backing the running batch.
//!
//! The stack always holds one root-to-leaf path of the fixture forest. Each
//! entry carries a three-colored health status:
//!
//! - red: created but not set up, or torn down, or its `set_up` failed;
//! - green: `set_up` (and every later `reset`) succeeded;
//! - yellow: a `reset` failed; the entry must be torn down and set up again
//!   before the next dependent test.
//!
//! Two invariants hold between operations: if any entry is yellow, none is
//! red; and if none is yellow, the bottom k entries are green and the rest
//! red. The stack as a whole is green/yellow/red accordingly, with the
//! empty stack green.

use crate::{
    dut::SharedDut,
    errors::{ResetError, SafeCallError, StackError},
    events::{EntityStream, Sink},
    features::FeatureSet,
    fixture::{Fixture, FixtureValue},
    fsutil,
    safecall::{safe_call, DEFAULT_GRACE},
    state::{EntityContext, State},
    Context,
};
use camino::Utf8PathBuf;
use dutest_metadata::ErrorObject;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// Aggregate health of the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackColor {
    /// Every entry is green (or the stack is empty); tests may run.
    Green,

    /// An entry failed to reset; tear down to it before the next test.
    Yellow,

    /// An entry failed to set up; dependent tests must be failed.
    Red,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EntryStatus {
    Red,
    Green,
    Yellow,
}

/// Construction parameters for [`FixtureStack`].
pub struct StackConfig {
    /// The shared event sink.
    pub sink: Sink,

    /// Root of the per-entity output tree.
    pub out_dir: Utf8PathBuf,

    /// The DUT's software features, exposed to fixture hooks.
    pub features: FeatureSet,

    /// Shared DUT handle, when running remotely.
    pub dut: Option<SharedDut>,

    /// Name of the batch's start fixture; the stack's bottom entry must
    /// declare it (or the implicit root) as parent.
    pub start_fixture: String,
}

struct StackEntry {
    fixture: Arc<Fixture>,
    status: EntryStatus,
    value: Option<FixtureValue>,
    stream: EntityStream,
    setup_errors: Vec<ErrorObject>,
}

/// The mutable fixture stack. Driven by the planner; see the module docs
/// for the color model.
pub struct FixtureStack {
    cfg: StackConfig,
    entries: Vec<StackEntry>,
    dirty: bool,
}

impl FixtureStack {
    /// Creates an empty (green) stack.
    pub fn new(cfg: StackConfig) -> Self {
        Self {
            cfg,
            entries: Vec::new(),
            dirty: false,
        }
    }

    /// The stack's aggregate color.
    pub fn color(&self) -> StackColor {
        if self
            .entries
            .iter()
            .any(|entry| entry.status == EntryStatus::Yellow)
        {
            StackColor::Yellow
        } else if self
            .entries
            .iter()
            .any(|entry| entry.status == EntryStatus::Red)
        {
            StackColor::Red
        } else {
            StackColor::Green
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the stack has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names, bottom to top.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.fixture.name().to_owned())
            .collect()
    }

    /// True if any entry is yellow.
    pub fn has_yellow(&self) -> bool {
        self.color() == StackColor::Yellow
    }

    /// The top green fixture's value, or `None` if the stack is empty or
    /// not green.
    pub fn val(&self) -> Option<FixtureValue> {
        match self.entries.last() {
            Some(entry) if entry.status == EntryStatus::Green => entry.value.clone(),
            _ => None,
        }
    }

    /// Marks the stack dirty before a test runs; a successful [`reset`]
    /// between tests clears it. Double-marking means the planner skipped a
    /// reset, which is a bug.
    ///
    /// [`reset`]: FixtureStack::reset
    pub fn mark_dirty(&mut self) -> Result<(), StackError> {
        if self.dirty {
            return Err(StackError::AlreadyDirty);
        }
        self.dirty = true;
        Ok(())
    }

    /// Appends a fixture. If the stack was green, runs its `set_up`; a
    /// failure there leaves the new entry red (and therefore the stack
    /// red), with the reported errors retained for [`FixtureStack::errors`].
    pub async fn push(&mut self, ctx: &Context, fixture: Arc<Fixture>) -> Result<(), StackError> {
        if self.color() == StackColor::Yellow {
            return Err(StackError::PushOnYellow {
                name: fixture.name().to_owned(),
            });
        }
        let expected_parent = self
            .entries
            .last()
            .map_or(self.cfg.start_fixture.as_str(), |entry| {
                entry.fixture.name()
            });
        if fixture.parent() != expected_parent {
            return Err(StackError::WrongParent {
                name: fixture.name().to_owned(),
                parent: fixture.parent().to_owned(),
                top: expected_parent.to_owned(),
            });
        }

        let was_green = self.color() == StackColor::Green;
        let stream = EntityStream::new(
            self.cfg.sink.clone(),
            fixture.name(),
            self.cfg.out_dir.join(fixture.name()),
        );
        let mut entry = StackEntry {
            fixture: Arc::clone(&fixture),
            status: EntryStatus::Red,
            value: None,
            stream,
            setup_errors: Vec::new(),
        };

        if !was_green {
            // An entry below is red; this fixture is never set up and emits
            // no events.
            self.entries.push(entry);
            return Ok(());
        }

        self.log_stream_failure(entry.stream.start());
        let state = State::new(
            EntityContext::for_fixture(entry.stream.clone(), fixture.service_deps().to_vec()),
            self.val(),
            self.cfg.features.clone(),
            self.cfg.dut.clone(),
        );

        if let Err(io_err) = fsutil::make_out_dir(entry.stream.out_dir()) {
            state.error(format!(
                "failed to create fixture output directory: {io_err}"
            ));
        } else {
            let value_slot: Arc<Mutex<Option<FixtureValue>>> = Arc::new(Mutex::new(None));
            let slot = Arc::clone(&value_slot);
            let hook_fixture = Arc::clone(&fixture);
            let hook_state = state.clone();
            let panic_state = state.clone();
            let result = safe_call(
                ctx,
                &format!("fixture {} set_up", fixture.name()),
                fixture.set_up_timeout(),
                DEFAULT_GRACE,
                move |message| panic_state.report_panic(message),
                move |call_ctx| {
                    let value = hook_fixture.lock_imp().set_up(call_ctx, &hook_state);
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
                },
            )
            .await;

            match result {
                Ok(()) => {
                    if !entry.stream.has_errors() {
                        entry.status = EntryStatus::Green;
                        entry.value = value_slot
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                    }
                }
                Err(err @ SafeCallError::DidNotReturn { .. }) => {
                    self.log_stream_failure(
                        entry.stream.error(ErrorObject::from_reason(err.to_string())),
                    );
                }
                Err(SafeCallError::Cancelled { cause }) => {
                    // Batch is aborting; the entry stays red and its stream
                    // is closed during teardown.
                    self.entries.push(entry);
                    return Err(StackError::Cancelled { cause });
                }
            }
        }

        if entry.status != EntryStatus::Green {
            entry.setup_errors = entry.stream.errors();
            self.log_stream_failure(entry.stream.end(vec![], None));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Removes the top entry, running its `tear_down` if it was green or
    /// yellow. Teardown failures are reported on the fixture's stream but
    /// never prevent the pop.
    pub async fn pop(&mut self, ctx: &Context) {
        let Some(mut entry) = self.entries.pop() else {
            debug_assert!(false, "pop called on an empty fixture stack");
            return;
        };
        if matches!(entry.status, EntryStatus::Green | EntryStatus::Yellow) {
            let parent_value = self.val();
            let state = State::new(
                EntityContext::for_fixture(
                    entry.stream.clone(),
                    entry.fixture.service_deps().to_vec(),
                ),
                parent_value,
                self.cfg.features.clone(),
                self.cfg.dut.clone(),
            );
            let hook_fixture = Arc::clone(&entry.fixture);
            let hook_state = state.clone();
            let panic_state = state.clone();
            let result = safe_call(
                ctx,
                &format!("fixture {} tear_down", entry.fixture.name()),
                entry.fixture.tear_down_timeout(),
                DEFAULT_GRACE,
                move |message| panic_state.report_panic(message),
                move |call_ctx| hook_fixture.lock_imp().tear_down(call_ctx, &hook_state),
            )
            .await;
            match result {
                Ok(()) => {}
                Err(err @ SafeCallError::DidNotReturn { .. }) => {
                    self.log_stream_failure(
                        entry.stream.error(ErrorObject::from_reason(err.to_string())),
                    );
                }
                Err(SafeCallError::Cancelled { cause }) => {
                    debug!(fixture = entry.fixture.name(), %cause, "teardown interrupted");
                }
            }
            entry.status = EntryStatus::Red;
        }
        // Red entries that never ran set_up have nothing on the wire; the
        // stream rejects the end and we drop it.
        if let Err(err) = entry.stream.end(vec![], None) {
            debug!(%err, "fixture stream already closed at pop");
        }
    }

    /// Clears the dirty flag and, on a green stack, runs every entry's
    /// `reset` bottom-up. The first failing reset (error, panic, or
    /// timeout) turns its entry yellow and the method still succeeds; a
    /// red stack is a successful no-op.
    pub async fn reset(&mut self, ctx: &Context) -> Result<(), StackError> {
        self.dirty = false;
        match self.color() {
            StackColor::Red => return Ok(()),
            StackColor::Yellow => return Err(StackError::ResetOnYellow),
            StackColor::Green => {}
        }

        for index in 0..self.entries.len() {
            let parent_value = self.value_below(index);
            let entry = &self.entries[index];
            let state = State::new(
                EntityContext::for_fixture(
                    entry.stream.clone(),
                    entry.fixture.service_deps().to_vec(),
                ),
                parent_value,
                self.cfg.features.clone(),
                self.cfg.dut.clone(),
            );
            let failure_slot: Arc<Mutex<Option<ResetError>>> = Arc::new(Mutex::new(None));

            let hook_fixture = Arc::clone(&entry.fixture);
            let hook_state = state.clone();
            let hook_slot = Arc::clone(&failure_slot);
            let panic_slot = Arc::clone(&failure_slot);
            let result = safe_call(
                ctx,
                &format!("fixture {} reset", entry.fixture.name()),
                entry.fixture.reset_timeout(),
                DEFAULT_GRACE,
                // A panicking reset is treated identically to one that
                // returned an error.
                move |message| {
                    *panic_slot.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(ResetError::new(format!("Panic: {message}")));
                },
                move |call_ctx| {
                    if let Err(failure) = hook_fixture.lock_imp().reset(call_ctx, &hook_state) {
                        *hook_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
                    }
                },
            )
            .await;

            let failure = match result {
                Ok(()) => failure_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
                Err(err @ SafeCallError::DidNotReturn { .. }) => {
                    Some(ResetError::new(err.to_string()))
                }
                Err(SafeCallError::Cancelled { cause }) => {
                    return Err(StackError::Cancelled { cause });
                }
            };

            if let Some(failure) = failure {
                let entry = &mut self.entries[index];
                entry.status = EntryStatus::Yellow;
                self.log_stream_failure(self.entries[index].stream.log(format!(
                    "Fixture failed to reset: {}; recovering",
                    failure.reason
                )));
                return Ok(());
            }
        }
        Ok(())
    }

    /// Runs every entry's `pre_test` hook, bottom-up, against the given
    /// test. Hook output goes to the test's stream; each hook sees the
    /// fixture's declared services, not the test's.
    pub(crate) async fn pre_test(
        &mut self,
        ctx: &Context,
        test_entity: &EntityContext,
    ) -> Result<(), StackError> {
        for index in 0..self.entries.len() {
            self.run_around_test_hook(ctx, test_entity, index, false)
                .await?;
        }
        Ok(())
    }

    /// Mirror of [`FixtureStack::pre_test`], top-down.
    pub(crate) async fn post_test(
        &mut self,
        ctx: &Context,
        test_entity: &EntityContext,
    ) -> Result<(), StackError> {
        for index in (0..self.entries.len()).rev() {
            self.run_around_test_hook(ctx, test_entity, index, true)
                .await?;
        }
        Ok(())
    }

    async fn run_around_test_hook(
        &mut self,
        ctx: &Context,
        test_entity: &EntityContext,
        index: usize,
        post: bool,
    ) -> Result<(), StackError> {
        let parent_value = self.value_below(index);
        let entry = &self.entries[index];
        debug_assert_eq!(entry.status, EntryStatus::Green);

        let mut entity = test_entity.clone();
        entity.service_deps = entry.fixture.service_deps().to_vec();
        let state = State::new(
            entity,
            parent_value,
            self.cfg.features.clone(),
            self.cfg.dut.clone(),
        );
        let hook_name = if post { "post_test" } else { "pre_test" };
        let timeout = if post {
            entry.fixture.post_test_timeout()
        } else {
            entry.fixture.pre_test_timeout()
        };
        let hook_fixture = Arc::clone(&entry.fixture);
        let hook_state = state.clone();
        let panic_state = state.clone();
        let result = safe_call(
            ctx,
            &format!("fixture {} {hook_name}", entry.fixture.name()),
            timeout,
            DEFAULT_GRACE,
            move |message| panic_state.report_panic(message),
            move |call_ctx| {
                let mut imp = hook_fixture.lock_imp();
                if post {
                    imp.post_test(call_ctx, &hook_state);
                } else {
                    imp.pre_test(call_ctx, &hook_state);
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err @ SafeCallError::DidNotReturn { .. }) => {
                state.error(err.to_string());
                Ok(())
            }
            Err(SafeCallError::Cancelled { cause }) => Err(StackError::Cancelled { cause }),
        }
    }

    /// Errors to surface on tests depending on this stack: for every red
    /// entry, its failed `set_up`'s errors, rewritten to name the fixture.
    pub fn errors(&self) -> Vec<ErrorObject> {
        let mut errors = Vec::new();
        for entry in &self.entries {
            if entry.status != EntryStatus::Red {
                continue;
            }
            for err in &entry.setup_errors {
                errors.push(ErrorObject {
                    reason: format!(
                        "[Fixture failure] {}: {}",
                        entry.fixture.name(),
                        err.reason
                    ),
                    file: err.file.clone(),
                    line: err.line,
                    stack: err.stack.clone(),
                });
            }
        }
        errors
    }

    fn value_below(&self, index: usize) -> Option<FixtureValue> {
        if index == 0 {
            return None;
        }
        let below = &self.entries[index - 1];
        if below.status == EntryStatus::Green {
            below.value.clone()
        } else {
            None
        }
    }

    fn log_stream_failure(&self, result: Result<(), crate::errors::StreamError>) {
        if let Err(err) = result {
            error!(%err, "failed to write fixture event");
        }
    }

    #[cfg(test)]
    fn entry_statuses(&self) -> Vec<EntryStatus> {
        self.entries.iter().map(|entry| entry.status).collect()
    }
}
