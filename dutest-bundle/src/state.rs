// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The facade user callbacks see.
//!
//! Tests and fixture hooks never touch the event sink or the fixture stack
//! directly; they get a [`State`], which routes logs and errors to the right
//! entity stream, hands out the output directory and declared data files,
//! and exposes the fixture value above the callback. All of the entity
//! plumbing lives in one [`EntityContext`] record rather than a sprawl of
//! independent fields.

use crate::{
    data,
    dut::SharedDut,
    events::EntityStream,
    features::FeatureSet,
    fixture::FixtureValue,
    safecall::FatalUnwind,
};
use camino::{Utf8Path, Utf8PathBuf};
use dutest_metadata::ErrorObject;
use std::{backtrace::Backtrace, panic, sync::Arc};
use tracing::warn;

/// Everything that identifies "the current entity" for a callback.
#[derive(Clone)]
pub(crate) struct EntityContext {
    /// Stream receiving the callback's logs and errors. For fixture
    /// `pre_test`/`post_test` hooks this is the *test's* stream, not the
    /// fixture's.
    pub(crate) stream: EntityStream,

    /// The directory the callback may write output files to.
    pub(crate) out_dir: Utf8PathBuf,

    /// Directory holding the entity's data files, already resolved to the
    /// entity's package.
    pub(crate) data_dir: Utf8PathBuf,

    /// The data files the entity declared.
    pub(crate) data_files: Vec<String>,

    /// The services the entity declared.
    pub(crate) service_deps: Vec<String>,
}

/// Handle given to every user callback.
///
/// Cheap to clone; clones share the same entity.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

struct StateInner {
    entity: EntityContext,
    value: Option<FixtureValue>,
    features: FeatureSet,
    dut: Option<SharedDut>,
    error_prefix: String,
}

impl State {
    pub(crate) fn new(
        entity: EntityContext,
        value: Option<FixtureValue>,
        features: FeatureSet,
        dut: Option<SharedDut>,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                entity,
                value,
                features,
                dut,
                error_prefix: String::new(),
            }),
        }
    }

    /// Returns a state whose reported errors are prefixed, e.g.
    /// `[Precondition failure] `.
    pub(crate) fn with_error_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                entity: self.inner.entity.clone(),
                value: self.inner.value.clone(),
                features: self.inner.features.clone(),
                dut: self.inner.dut.clone(),
                error_prefix: prefix.into(),
            }),
        }
    }

    /// Logs a message to the entity's stream.
    pub fn log(&self, text: impl Into<String>) {
        if let Err(error) = self.inner.entity.stream.log(text) {
            warn!(%error, "dropping log from ended entity");
        }
    }

    /// Reports an error. The entity keeps running; the error marks it
    /// failed.
    #[track_caller]
    pub fn error(&self, reason: impl Into<String>) {
        let error = self.make_error(reason.into());
        self.report(error);
    }

    /// Reports an error and terminates the callback by unwinding the
    /// worker. Only the current callback dies; the batch keeps going.
    #[track_caller]
    pub fn fatal(&self, reason: impl Into<String>) -> ! {
        let error = self.make_error(reason.into());
        self.report(error);
        panic::resume_unwind(Box::new(FatalUnwind))
    }

    /// Reports a recovered panic as an entity error.
    pub(crate) fn report_panic(&self, message: String) {
        self.report(ErrorObject {
            reason: format!("{}Panic: {message}", self.inner.error_prefix),
            file: String::new(),
            line: 0,
            stack: Backtrace::force_capture().to_string(),
        });
    }

    fn report(&self, error: ErrorObject) {
        if let Err(error) = self.inner.entity.stream.error(error) {
            warn!(%error, "dropping error from ended entity");
        }
    }

    #[track_caller]
    fn make_error(&self, reason: String) -> ErrorObject {
        let location = panic::Location::caller();
        ErrorObject {
            reason: format!("{}{reason}", self.inner.error_prefix),
            file: location.file().to_owned(),
            line: location.line(),
            stack: Backtrace::force_capture().to_string(),
        }
    }

    /// The directory the callback may write output files to.
    pub fn out_dir(&self) -> &Utf8Path {
        &self.inner.entity.out_dir
    }

    /// Resolves a declared data file to its path. Declaring the file is
    /// mandatory; asking for an undeclared one is a fatal test bug.
    #[track_caller]
    pub fn data_path(&self, name: &str) -> Utf8PathBuf {
        if !self.inner.entity.data_files.iter().any(|file| file == name) {
            self.fatal(format!("data file {name} was not declared"));
        }
        self.inner.entity.data_dir.join(name)
    }

    /// The value exposed by the fixture above this callback, if any.
    pub fn value(&self) -> Option<&FixtureValue> {
        self.inner.value.as_ref()
    }

    /// The DUT's software features.
    pub fn features(&self) -> &FeatureSet {
        &self.inner.features
    }

    /// The services the entity declared. Callbacks must not use services
    /// they did not declare.
    pub fn service_deps(&self) -> &[String] {
        &self.inner.entity.service_deps
    }

    /// The shared DUT handle, when running against a remote device.
    pub fn dut(&self) -> Option<&SharedDut> {
        self.inner.dut.as_ref()
    }

    /// True if any error has been reported against the entity so far,
    /// by this callback or an earlier one.
    pub fn has_error(&self) -> bool {
        self.inner.entity.stream.has_errors()
    }

    pub(crate) fn stream(&self) -> &EntityStream {
        &self.inner.entity.stream
    }
}

impl EntityContext {
    /// Context for an entity with no data files or services, e.g. a
    /// fixture running `set_up`.
    pub(crate) fn bare(stream: EntityStream) -> Self {
        let out_dir = stream.out_dir().to_owned();
        Self {
            stream,
            out_dir,
            data_dir: Utf8PathBuf::new(),
            data_files: Vec::new(),
            service_deps: Vec::new(),
        }
    }

    /// Context for a fixture hook writing to the fixture's own stream.
    pub(crate) fn for_fixture(stream: EntityStream, service_deps: Vec<String>) -> Self {
        let out_dir = stream.out_dir().to_owned();
        Self {
            stream,
            out_dir,
            data_dir: Utf8PathBuf::new(),
            data_files: Vec::new(),
            service_deps,
        }
    }

    pub(crate) fn for_test(
        stream: EntityStream,
        data_dir: &Utf8Path,
        test_name: &str,
        data_files: Vec<String>,
        service_deps: Vec<String>,
    ) -> Self {
        let out_dir = stream.out_dir().to_owned();
        Self {
            stream,
            out_dir,
            data_dir: data_dir.join(data::pkg_path(test_name)),
            data_files,
            service_deps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryWriter, Sink};
    use dutest_metadata::Event;

    fn test_state() -> (State, MemoryWriter) {
        let writer = MemoryWriter::new();
        let sink = Sink::new(writer.clone());
        let stream = EntityStream::new(sink, "pkg.Test", "/out/pkg.Test");
        stream.start().unwrap();
        let state = State::new(
            EntityContext::for_test(
                stream,
                Utf8Path::new("/data"),
                "pkg.Test",
                vec!["blob.bin".to_owned()],
                vec![],
            ),
            None,
            FeatureSet::default(),
            None,
        );
        (state, writer)
    }

    #[test]
    fn error_records_location() {
        let (state, writer) = test_state();
        state.error("it broke");
        let events = writer.events();
        match &events[1] {
            Event::EntityError { error, .. } => {
                assert_eq!(error.reason, "it broke");
                assert!(error.file.ends_with("state.rs"));
                assert_ne!(error.line, 0);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(state.has_error());
    }

    #[test]
    fn fatal_unwinds_with_marker() {
        let (state, _writer) = test_state();
        let unwind = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            state.fatal("fatal failure");
        }))
        .unwrap_err();
        assert!(unwind.downcast_ref::<FatalUnwind>().is_some());
        assert!(state.has_error());
    }

    #[test]
    fn data_path_requires_declaration() {
        let (state, _writer) = test_state();
        assert_eq!(
            state.data_path("blob.bin"),
            Utf8PathBuf::from("/data/pkg/blob.bin")
        );
        let unwind = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            state.data_path("undeclared.bin");
        }))
        .unwrap_err();
        assert!(unwind.downcast_ref::<FatalUnwind>().is_some());
    }

    #[test]
    fn error_prefix_applies() {
        let (state, writer) = test_state();
        let prefixed = state.with_error_prefix("[Precondition failure] ");
        prefixed.error("nope");
        match &writer.events()[1] {
            Event::EntityError { error, .. } => {
                assert_eq!(error.reason, "[Precondition failure] nope");
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
