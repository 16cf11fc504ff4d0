// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bundle process entry points.
//!
//! A bundle executable builds a [`Registry`], fills in a [`Delegate`] for
//! the environment-specific pieces (DUT transport, data downloader,
//! readiness hook), and calls [`run`]. The runner pipes one JSON
//! [`BundleArgs`] record to standard input; depending on the mode the
//! bundle either streams newline-delimited JSON events for a test run or
//! prints a JSON description of the selected tests.

use crate::{
    data::DataDownloader,
    dut::SharedDut,
    errors::{ArgsError, BundleError, DutError},
    events::{JsonLinesWriter, Sink},
    features::{DepCheckResult, FeatureSet},
    planner::{Planner, RunConfig, TestHookFn},
    registry::{Registry, Test},
    select::TestFilter,
    Context,
};
use dutest_metadata::{
    BundleArgs, BundleExitCode, ErrorObject, RemoteArgs, RunMode, TestInfo, TestListSummary,
    BUNDLE_ARGS_VERSION,
};
use std::{
    io::{self, Read, Write},
    sync::Arc,
};
use tracing::{debug, error};

/// Readiness hook run before any test when the runner asks for it.
pub type ReadyFn = Arc<dyn Fn(&Context) -> Result<(), String> + Send + Sync>;

/// Builds the DUT handle for a remote run.
pub type DutConnectFn = Arc<dyn Fn(&Context, &RemoteArgs) -> Result<SharedDut, DutError> + Send + Sync>;

/// Builds the external-data downloader for a run.
pub type DownloaderFactory = Arc<dyn Fn(&BundleArgs) -> Box<dyn DataDownloader> + Send + Sync>;

/// Environment-specific hooks a bundle may provide.
#[derive(Clone, Default)]
pub struct Delegate {
    /// Run before any test when the args set `wait_until_ready`.
    pub ready: Option<ReadyFn>,

    /// Run-wide hook bracketing every test.
    pub test_hook: Option<TestHookFn>,

    /// Connects to the DUT when the args carry remote configuration.
    pub connect_dut: Option<DutConnectFn>,

    /// Provides the external-data downloader.
    pub downloader: Option<DownloaderFactory>,
}

/// Process entry point: reads args from standard input, writes to standard
/// output, returns the process exit code.
pub fn run(registry: &Registry, delegate: Delegate) -> i32 {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .try_init();
    run_with(registry, delegate, io::stdin().lock(), io::stdout())
}

/// [`run`] with explicit streams, for driving a bundle in-process.
pub fn run_with(
    registry: &Registry,
    delegate: Delegate,
    input: impl Read,
    output: impl Write + Send + 'static,
) -> i32 {
    let args = match parse_args(input) {
        Ok(args) => args,
        Err(err) => {
            error!(%err, "bad bundle args");
            return BundleError::from(err).exit_code();
        }
    };

    let filter = match TestFilter::from_patterns(&args.patterns) {
        Ok(filter) => filter,
        Err(err) => {
            error!(%err, "bad selection patterns");
            return BundleError::from(err).exit_code();
        }
    };
    let selected: Vec<Arc<Test>> = registry
        .tests()
        .filter(|test| filter.matches(test))
        .cloned()
        .collect();
    debug!(selected = selected.len(), mode = ?args.mode, "selection complete");

    match args.mode {
        RunMode::ListTests => list_tests(&args, &selected, output),
        RunMode::RunTests => {
            if selected.is_empty() {
                error!("no tests matched the requested patterns");
                return BundleError::NoTestsMatched.exit_code();
            }
            run_tests(registry, delegate, &args, selected, output)
        }
    }
}

fn parse_args(mut input: impl Read) -> Result<BundleArgs, ArgsError> {
    let mut raw = String::new();
    input.read_to_string(&mut raw).map_err(ArgsError::Read)?;
    let args: BundleArgs = serde_json::from_str(&raw).map_err(ArgsError::Parse)?;
    if args.version != BUNDLE_ARGS_VERSION {
        return Err(ArgsError::Version {
            expected: BUNDLE_ARGS_VERSION,
            actual: args.version,
        });
    }
    Ok(args)
}

fn feature_set(args: &BundleArgs) -> FeatureSet {
    FeatureSet::new(
        args.available_software_features.iter().cloned(),
        args.unavailable_software_features.iter().cloned(),
        args.check_software_deps,
    )
}

fn list_tests(args: &BundleArgs, selected: &[Arc<Test>], mut output: impl Write) -> i32 {
    let features = feature_set(args);
    let mut summary = TestListSummary::default();
    for test in selected {
        let skip_reason = match features.check_deps(test.software_deps()) {
            DepCheckResult::Satisfied => None,
            DepCheckResult::Skip(reasons) => Some(reasons.join("; ")),
            DepCheckResult::Unknown(message) => Some(message),
        };
        summary.tests.insert(
            test.name().to_owned(),
            TestInfo {
                attrs: test.attrs().to_vec(),
                data: test.data().to_vec(),
                software_deps: test.software_deps().to_vec(),
                service_deps: test.service_deps().to_vec(),
                fixture: test.fixture().to_owned(),
                timeout: test.timeout(),
                skip_reason,
            },
        );
    }
    let result = serde_json::to_writer(&mut output, &summary)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        .and_then(|()| output.write_all(b"\n"));
    match result {
        Ok(()) => BundleExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "failed to write test list");
            BundleError::Output(err).exit_code()
        }
    }
}

fn run_tests(
    registry: &Registry,
    delegate: Delegate,
    args: &BundleArgs,
    selected: Vec<Arc<Test>>,
    output: impl Write + Send + 'static,
) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build runtime");
            return BundleExitCode::ERROR;
        }
    };

    let sink = Sink::new(JsonLinesWriter::new(output));
    let ctx = Context::new();

    runtime.block_on(async {
        let heartbeat = spawn_heartbeat(&sink, args);

        let code = run_batch(registry, delegate, args, selected, &sink, &ctx).await;

        if let Some(task) = heartbeat {
            task.abort();
        }
        code
    })
}

async fn run_batch(
    registry: &Registry,
    delegate: Delegate,
    args: &BundleArgs,
    selected: Vec<Arc<Test>>,
    sink: &Sink,
    ctx: &Context,
) -> i32 {
    let dut = match &args.remote {
        Some(remote) => match &delegate.connect_dut {
            Some(connect) => match connect(ctx, remote) {
                Ok(dut) => Some(dut),
                Err(err) => {
                    return report_run_error(sink, err.to_string(), BundleExitCode::ERROR);
                }
            },
            None => {
                return report_run_error(
                    sink,
                    "remote args given but this bundle has no DUT transport".to_owned(),
                    BundleExitCode::BAD_ARGS,
                );
            }
        },
        None => None,
    };

    if args.wait_until_ready {
        if let Some(ready) = &delegate.ready {
            let _ = sink.run_log("waiting for DUT readiness");
            if let Err(reason) = ready(ctx) {
                return report_run_error(
                    sink,
                    format!("readiness hook failed: {reason}"),
                    BundleExitCode::ERROR,
                );
            }
        }
    }

    let downloader = delegate.downloader.as_ref().map(|factory| factory(args));
    let cfg = RunConfig {
        out_dir: args.out_dir.clone(),
        data_dir: args.data_dir.clone(),
        features: feature_set(args),
        download_mode: args.download_mode,
        max_test_failures: args.max_test_failures,
        start_fixture: args.start_fixture.clone(),
        test_hook: delegate.test_hook.clone(),
    };
    let planner = Planner::new(cfg, sink.clone(), downloader, dut);

    match planner.run(ctx, registry, selected).await {
        Ok(stats) => {
            let _ = sink.run_log(format!(
                "run complete: {} passed, {} failed, {} skipped",
                stats.passed, stats.failed, stats.skipped
            ));
            // Test failures do not fail the bundle; the runner judges them
            // from the event stream.
            BundleExitCode::SUCCESS
        }
        Err(err) => report_run_error(sink, err.to_string(), err.exit_code()),
    }
}

fn report_run_error(sink: &Sink, reason: String, status: i32) -> i32 {
    error!(%reason, status, "run failed");
    let _ = sink.run_error(ErrorObject::from_reason(reason), status);
    status
}

fn spawn_heartbeat(sink: &Sink, args: &BundleArgs) -> Option<tokio::task::JoinHandle<()>> {
    let interval = args.heartbeat_interval;
    if interval.is_zero() {
        return None;
    }
    let sink = sink.clone();
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval / 2).await;
            if let Err(err) = sink.heartbeat_if_idle(interval) {
                debug!(%err, "heartbeat write failed");
                return;
            }
        }
    }))
}
