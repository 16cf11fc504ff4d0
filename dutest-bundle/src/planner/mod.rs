// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test planner.
//!
//! The planner is single-threaded over the batch: it orders the selected
//! tests so consecutive tests share fixture setup, walks the fixture stack
//! between tests (popping to the common prefix and pushing the rest), runs
//! each test's stage list through the safe-call runner, and emits every
//! entity's events in causal order. User callbacks run on worker threads,
//! but at most one is live at any time.

mod stages;

pub use self::stages::{PostTestHookFn, TestHookFn};

use crate::{
    data::{self, DataDownloader, DataFileRef},
    dut::SharedDut,
    errors::{BundleError, SafeCallError, StackError},
    events::{EntityStream, Sink},
    features::{DepCheckResult, FeatureSet},
    fixture::{Fixture, FixtureStack, FixtureValue, StackColor, StackConfig},
    precondition::{same_precondition, SharedPrecondition},
    registry::{Registry, Test},
    safecall::{safe_call, DEFAULT_GRACE},
    state::{EntityContext, State},
    Context,
};
use camino::Utf8PathBuf;
use dutest_metadata::{DownloadMode, ErrorObject, TimingLog, TimingStage};
use self::stages::{
    post_test_hook_stage, run_stage, setup_stage, test_grace, HookSlot, StageKind, STAGES,
    STAGE_GRACE, STAGE_TIMEOUT,
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use tracing::{debug, error};

/// Run-wide configuration for a batch.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Root of the per-entity output tree.
    pub out_dir: Utf8PathBuf,

    /// Directory holding external data files.
    pub data_dir: Utf8PathBuf,

    /// The DUT's software features.
    pub features: FeatureSet,

    /// When external data files are fetched.
    pub download_mode: DownloadMode,

    /// Stop scheduling new tests once this many have failed; zero means no
    /// limit.
    pub max_test_failures: usize,

    /// Name of the fixture every test's chain is rooted under; empty for
    /// the implicit root.
    pub start_fixture: String,

    /// Run-wide hook bracketing every test.
    pub test_hook: Option<TestHookFn>,
}

/// Counts reported after a batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// Tests the planner scheduled (including skips).
    pub planned: usize,

    /// Tests that ran to completion without errors.
    pub passed: usize,

    /// Tests that reported at least one error (including
    /// dependency-failure tests that never ran).
    pub failed: usize,

    /// Tests skipped before running, with a skip reason.
    pub skipped: usize,
}

struct PrecondState {
    precond: SharedPrecondition,
    value: Option<FixtureValue>,
    ok: bool,
}

enum Disposition {
    Run { chain: Vec<Arc<Fixture>> },
    Skip(Vec<String>),
    Fail(String),
}

struct PlanEntry {
    test: Arc<Test>,
    disposition: Disposition,
}

impl PlanEntry {
    // Sort: dependency-skipped tests first, then tests with no fixture or
    // precondition, then the rest grouped by fixture leaf (or precondition
    // name) so consecutive tests share setup; name-ordered within a group.
    fn sort_key(&self) -> (u8, String, String) {
        let name = self.test.name().to_owned();
        match &self.disposition {
            Disposition::Skip(_) | Disposition::Fail(_) => (0, String::new(), name),
            Disposition::Run { chain } => {
                let group = if let Some(precond) = self.test.precondition() {
                    precond.name().to_owned()
                } else {
                    chain
                        .last()
                        .map(|fixture| fixture.name().to_owned())
                        .unwrap_or_default()
                };
                if group.is_empty() {
                    (1, group, name)
                } else {
                    (2, group, name)
                }
            }
        }
    }
}

/// Plans and executes one batch of tests.
pub struct Planner {
    cfg: RunConfig,
    sink: Sink,
    downloader: Option<Box<dyn DataDownloader>>,
    dut: Option<SharedDut>,
    stack: FixtureStack,
    stats: RunStats,
    current_precond: Option<PrecondState>,
}

impl Planner {
    /// Creates a planner for one batch.
    pub fn new(
        cfg: RunConfig,
        sink: Sink,
        downloader: Option<Box<dyn DataDownloader>>,
        dut: Option<SharedDut>,
    ) -> Self {
        let stack = FixtureStack::new(StackConfig {
            sink: sink.clone(),
            out_dir: cfg.out_dir.clone(),
            features: cfg.features.clone(),
            dut: dut.clone(),
            start_fixture: cfg.start_fixture.clone(),
        });
        Self {
            cfg,
            sink,
            downloader,
            dut,
            stack,
            stats: RunStats::default(),
            current_precond: None,
        }
    }

    /// Runs the batch to completion (or abort), tearing down every stacked
    /// fixture at the end either way.
    pub async fn run(
        mut self,
        ctx: &Context,
        registry: &Registry,
        tests: Vec<Arc<Test>>,
    ) -> Result<RunStats, BundleError> {
        let entries = self.plan(registry, tests)?;
        self.stats.planned = entries.len();
        debug!(planned = entries.len(), "batch planned");

        if let (Some(downloader), DownloadMode::Batch) =
            (&mut self.downloader, self.cfg.download_mode)
        {
            let files: Vec<DataFileRef> = entries
                .iter()
                .filter(|entry| matches!(entry.disposition, Disposition::Run { .. }))
                .flat_map(|entry| data_files_of(&entry.test))
                .collect();
            downloader.before_run(ctx, &files);
        }

        let mut abort = None;
        for entry in &entries {
            if ctx.is_cancelled() {
                abort = Some(
                    ctx.cause()
                        .unwrap_or_else(|| "run context cancelled".to_owned()),
                );
                break;
            }
            if self.cfg.max_test_failures > 0 && self.stats.failed >= self.cfg.max_test_failures {
                let _ = self.sink.run_log(format!(
                    "aborting run after {} test failures",
                    self.stats.failed
                ));
                break;
            }

            match &entry.disposition {
                Disposition::Skip(reasons) => self.report_skip(&entry.test, reasons.clone()),
                Disposition::Fail(message) => self.report_dep_failure(&entry.test, message),
                Disposition::Run { chain } => {
                    if let Err(cause) = self.run_test(ctx, &entry.test, chain).await {
                        abort = Some(cause);
                        break;
                    }
                }
            }
        }

        // Teardown runs even when aborting: close any open precondition and
        // pop every remaining fixture so each green one gets its tear_down.
        self.close_precondition(ctx).await;
        while !self.stack.is_empty() {
            self.stack.pop(ctx).await;
        }

        match abort {
            Some(reason) => Err(BundleError::Aborted { reason }),
            None => Ok(self.stats),
        }
    }

    fn plan(
        &self,
        registry: &Registry,
        tests: Vec<Arc<Test>>,
    ) -> Result<Vec<PlanEntry>, BundleError> {
        let mut entries = Vec::with_capacity(tests.len());
        for test in tests {
            let disposition = match self.cfg.features.check_deps(test.software_deps()) {
                DepCheckResult::Unknown(message) => Disposition::Fail(message),
                DepCheckResult::Skip(reasons) => Disposition::Skip(reasons),
                DepCheckResult::Satisfied => {
                    let chain = registry.fixture_chain(test.fixture(), &self.cfg.start_fixture)?;
                    Disposition::Run { chain }
                }
            };
            entries.push(PlanEntry { test, disposition });
        }
        entries.sort_by_cached_key(PlanEntry::sort_key);
        Ok(entries)
    }

    fn test_stream(&self, test: &Test) -> EntityStream {
        EntityStream::new(
            self.sink.clone(),
            test.name(),
            self.cfg.out_dir.join(test.name()),
        )
    }

    fn report_skip(&mut self, test: &Arc<Test>, reasons: Vec<String>) {
        let stream = self.test_stream(test);
        self.log_stream(stream.start());
        self.log_stream(stream.end(reasons, None));
        self.stats.skipped += 1;
    }

    fn report_dep_failure(&mut self, test: &Arc<Test>, message: &str) {
        let stream = self.test_stream(test);
        self.log_stream(stream.start());
        self.log_stream(stream.error(ErrorObject::from_reason(message)));
        self.log_stream(stream.end(vec![], None));
        self.stats.failed += 1;
    }

    async fn run_test(
        &mut self,
        ctx: &Context,
        test: &Arc<Test>,
        chain: &[Arc<Fixture>],
    ) -> Result<(), String> {
        // S1: walk the stack from the previous test's chain to this one's.
        self.transition_stack(ctx, chain).await?;

        // A precondition group ends as soon as a test outside it runs.
        let stale = match (&self.current_precond, test.precondition()) {
            (Some(current), Some(precond)) => !same_precondition(&current.precond, precond),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            self.close_precondition(ctx).await;
        }

        let stream = self.test_stream(test);

        // S2: a red stack means setup failed somewhere below this test.
        // Fail the test with the rewritten fixture errors and move on
        // without running anything of it.
        if self.stack.color() == StackColor::Red {
            self.log_stream(stream.start());
            for err in self.stack.errors() {
                self.log_stream(stream.error(err));
            }
            self.log_stream(stream.end(vec![], None));
            self.stats.failed += 1;
            return Ok(());
        }

        // S3: lazily fetch this test's data files.
        let files = data_files_of(test);
        if let (Some(downloader), DownloadMode::Lazy) =
            (&mut self.downloader, self.cfg.download_mode)
        {
            downloader.before_entity(ctx, &files);
        }

        // S4: force a reset before the next test, then run the stage list.
        if let Err(err) = self.stack.mark_dirty() {
            error!(%err, test = test.name(), "dirty flag misuse");
            let _ = self.sink.run_log(format!("{err}"));
        }
        self.log_stream(stream.start());

        let entity = EntityContext::for_test(
            stream.clone(),
            &self.cfg.data_dir,
            test.name(),
            test.data().to_vec(),
            test.service_deps().to_vec(),
        );

        let value = match test.precondition() {
            Some(precond) => match self.prepare_precondition(ctx, precond, &entity).await {
                Ok(value) => value,
                Err(cause) => {
                    // The batch is aborting mid-prepare; close out the
                    // test's events before bubbling the abort up.
                    if stream.has_errors() {
                        self.stats.failed += 1;
                    } else {
                        self.stats.passed += 1;
                    }
                    self.log_stream(stream.end(vec![], None));
                    return Err(cause);
                }
            },
            None => self.stack.val(),
        };
        let state = State::new(
            entity.clone(),
            value,
            self.cfg.features.clone(),
            self.dut.clone(),
        );

        let hook_slot: HookSlot = Arc::new(Mutex::new(None));
        let mut timing = TimingLog::default();
        let mut abort = None;

        for stage in STAGES {
            let started = Instant::now();
            let result = match stage.kind {
                StageKind::Setup => {
                    let closure = setup_stage(
                        stream.out_dir().to_owned(),
                        self.cfg.data_dir.clone(),
                        files.clone(),
                        self.dut.clone(),
                        self.cfg.test_hook.clone(),
                        Arc::clone(&hook_slot),
                    );
                    run_stage(
                        ctx,
                        format!("{}: setup", test.name()),
                        STAGE_TIMEOUT,
                        STAGE_GRACE,
                        &state,
                        closure,
                    )
                    .await
                    .map_err(cancellation_cause)
                }
                StageKind::FixturePreTest => self
                    .stack
                    .pre_test(ctx, &entity)
                    .await
                    .map_err(stack_cause),
                StageKind::TestFunc => {
                    // Only the test function is gated on "no error so far":
                    // a failed setup stage or pre_test hook means the test
                    // never runs, but the stages after it still do.
                    if state.has_error() {
                        continue;
                    }
                    let func = Arc::clone(test.func());
                    run_stage(
                        ctx,
                        test.name().to_owned(),
                        test.timeout(),
                        test_grace(test),
                        &state,
                        move |call_ctx, s| func(call_ctx, s),
                    )
                    .await
                    .map_err(cancellation_cause)
                }
                StageKind::FixturePostTest => self
                    .stack
                    .post_test(ctx, &entity)
                    .await
                    .map_err(stack_cause),
                StageKind::PostTestHook => {
                    if self.cfg.test_hook.is_none() {
                        continue;
                    }
                    run_stage(
                        ctx,
                        format!("{}: post-test hook", test.name()),
                        STAGE_TIMEOUT,
                        STAGE_GRACE,
                        &state,
                        post_test_hook_stage(Arc::clone(&hook_slot)),
                    )
                    .await
                    .map_err(cancellation_cause)
                }
            };
            timing.stages.push(TimingStage {
                name: stage.name.to_owned(),
                seconds: started.elapsed().as_secs_f64(),
            });
            if let Err(cause) = result {
                abort = Some(cause);
                break;
            }
        }

        // End the test on the wire before resetting fixtures, so reset
        // activity shows up between this test and the next one.
        if stream.has_errors() {
            self.stats.failed += 1;
        } else {
            self.stats.passed += 1;
        }
        self.log_stream(stream.end(vec![], Some(timing)));

        if let Some(cause) = abort {
            return Err(cause);
        }

        // S5: prepare the stack for the next test. A red stack no-ops; a
        // failed reset leaves the entry yellow for the next transition to
        // tear down and set up again.
        match self.stack.reset(ctx).await {
            Ok(()) => Ok(()),
            Err(StackError::Cancelled { cause }) => Err(cause),
            Err(bug) => {
                error!(%bug, "reset misuse");
                let _ = self.sink.run_log(format!("{bug}"));
                Ok(())
            }
        }
    }

    async fn transition_stack(
        &mut self,
        ctx: &Context,
        chain: &[Arc<Fixture>],
    ) -> Result<(), String> {
        // A yellow entry failed its reset; it and everything above it must
        // be torn down before the next test, even one sharing the chain.
        while self.stack.has_yellow() {
            self.stack.pop(ctx).await;
        }

        let current = self.stack.names();
        let mut common = 0;
        while common < current.len()
            && common < chain.len()
            && current[common] == chain[common].name()
        {
            common += 1;
        }
        for _ in common..current.len() {
            self.stack.pop(ctx).await;
        }
        for fixture in &chain[common..] {
            match self.stack.push(ctx, Arc::clone(fixture)).await {
                Ok(()) => {}
                Err(StackError::Cancelled { cause }) => return Err(cause),
                Err(bug) => {
                    error!(%bug, "fixture stack misuse");
                    let _ = self.sink.run_log(format!("{bug}"));
                    return Err(bug.to_string());
                }
            }
        }
        Ok(())
    }

    async fn prepare_precondition(
        &mut self,
        ctx: &Context,
        precond: &SharedPrecondition,
        entity: &EntityContext,
    ) -> Result<Option<FixtureValue>, String> {
        if let Some(current) = &self.current_precond {
            if same_precondition(&current.precond, precond) && current.ok {
                return Ok(current.value.clone());
            }
        }

        let state = State::new(
            entity.clone(),
            None,
            self.cfg.features.clone(),
            self.dut.clone(),
        )
        .with_error_prefix("[Precondition failure] ");
        let value_slot: Arc<Mutex<Option<FixtureValue>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&value_slot);
        let hook_precond = Arc::clone(precond);
        let hook_state = state.clone();
        let panic_state = state.clone();
        let result = safe_call(
            ctx,
            &format!("precondition {} prepare", precond.name()),
            precond.prepare_timeout(),
            DEFAULT_GRACE,
            move |message| panic_state.report_panic(message),
            move |call_ctx| {
                let value = hook_precond.prepare(call_ctx, &hook_state);
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
            },
        )
        .await;

        let ok = match result {
            Ok(()) => !state.has_error(),
            Err(err @ SafeCallError::DidNotReturn { .. }) => {
                state.error(err.to_string());
                false
            }
            Err(SafeCallError::Cancelled { cause }) => return Err(cause),
        };
        let value = value_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.current_precond = Some(PrecondState {
            precond: Arc::clone(precond),
            value: value.clone(),
            ok,
        });
        Ok(if ok { value } else { None })
    }

    async fn close_precondition(&mut self, ctx: &Context) {
        let Some(current) = self.current_precond.take() else {
            return;
        };
        if !current.ok {
            return;
        }

        // The group's last test has already ended on the wire, so close
        // output goes to an anonymous stream; failures surface as run logs.
        let root_stream = EntityStream::new(self.sink.clone(), "", self.cfg.out_dir.clone());
        let state = State::new(
            EntityContext::bare(root_stream.clone()),
            current.value.clone(),
            self.cfg.features.clone(),
            self.dut.clone(),
        )
        .with_error_prefix("[Precondition failure] ");

        let hook_precond = Arc::clone(&current.precond);
        let hook_state = state.clone();
        let panic_state = state.clone();
        let result = safe_call(
            ctx,
            &format!("precondition {} close", current.precond.name()),
            current.precond.close_timeout(),
            DEFAULT_GRACE,
            move |message| panic_state.report_panic(message),
            move |call_ctx| hook_precond.close(call_ctx, &hook_state),
        )
        .await;
        if let Err(err) = result {
            debug!(%err, precondition = current.precond.name(), "close interrupted");
        }
        for err in root_stream.errors() {
            let _ = self.sink.run_log(format!(
                "precondition {} close: {}",
                current.precond.name(),
                err.reason
            ));
        }
    }

    fn log_stream(&self, result: Result<(), crate::errors::StreamError>) {
        if let Err(err) = result {
            error!(%err, "failed to write test event");
        }
    }
}

fn data_files_of(test: &Test) -> Vec<DataFileRef> {
    let pkg_path = data::pkg_path(test.name());
    test.data()
        .iter()
        .map(|name| DataFileRef {
            pkg_path: pkg_path.clone(),
            name: name.clone(),
        })
        .collect()
}

fn cancellation_cause(err: SafeCallError) -> String {
    match err {
        SafeCallError::Cancelled { cause } => cause,
        other => other.to_string(),
    }
}

fn stack_cause(err: StackError) -> String {
    match err {
        StackError::Cancelled { cause } => cause,
        other => other.to_string(),
    }
}
