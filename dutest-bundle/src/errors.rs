// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the bundle execution core.
//!
//! The kinds deliberately do not collapse into one another: argument,
//! registration and pattern errors abort the batch before any test runs,
//! while data, setup, test, timeout and reset failures flow through the
//! event stream without aborting it.

use dutest_filtering::errors::AttrExprParseError;
use dutest_metadata::BundleExitCode;
use thiserror::Error;

/// The argument record on standard input was missing or malformed.
#[derive(Debug, Error)]
pub enum ArgsError {
    /// Reading standard input failed.
    #[error("failed to read bundle args")]
    Read(#[source] std::io::Error),

    /// The record was not valid JSON or violated the schema.
    #[error("failed to parse bundle args")]
    Parse(#[source] serde_json::Error),

    /// The record carried an unsupported schema version.
    #[error("unsupported bundle args version {actual} (expected {expected})")]
    Version {
        /// The version this bundle understands.
        expected: u32,
        /// The version the runner sent.
        actual: u32,
    },
}

/// A test or fixture could not be registered.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Two tests or two fixtures share a name.
    #[error("{kind} `{name}` is registered twice")]
    Duplicate {
        /// "test" or "fixture".
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// A test name is not a dotted package-qualified identifier.
    #[error("test name `{name}` is not of the form `pkg.Name`")]
    BadTestName {
        /// The offending name.
        name: String,
    },

    /// The empty fixture name is reserved for the implicit root.
    #[error("fixture has an empty name")]
    EmptyFixtureName,

    /// A test declared both a parent fixture and a precondition.
    #[error("test `{name}` declares both a fixture and a precondition")]
    FixtureAndPrecondition {
        /// The offending test.
        name: String,
    },

    /// A fixture chain refers to a fixture nobody registered.
    #[error("fixture `{parent}` (wanted by `{name}`) is not registered")]
    UnknownFixture {
        /// The test or fixture that wanted the parent.
        name: String,
        /// The missing fixture.
        parent: String,
    },

    /// A fixture chain loops or does not reach the root.
    #[error("fixture chain of `{name}` does not terminate at the root")]
    BadFixtureChain {
        /// The fixture whose chain is broken.
        name: String,
    },
}

/// A selection pattern could not be compiled.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The single parenthesized pattern was not a valid attribute
    /// expression.
    #[error(transparent)]
    Attr(#[from] AttrExprParseError),

    /// A name glob was invalid.
    #[error("bad name pattern `{pattern}`: {message}")]
    Glob {
        /// The offending pattern.
        pattern: String,
        /// Description of the failure.
        message: String,
    },
}

/// Failure writing to an entity's event stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The entity already emitted its `EntityEnd` event.
    #[error("entity `{entity}` already ended")]
    AlreadyEnded {
        /// The entity's name.
        entity: String,
    },

    /// The entity emitted an event other than `EntityStart` first.
    #[error("entity `{entity}` has not started")]
    NotStarted {
        /// The entity's name.
        entity: String,
    },

    /// `start` was called twice.
    #[error("entity `{entity}` already started")]
    AlreadyStarted {
        /// The entity's name.
        entity: String,
    },

    /// The underlying sink failed.
    #[error("failed to write event")]
    Sink(#[source] std::io::Error),
}

/// Failure of a guarded call to a user callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SafeCallError {
    /// The caller's context was cancelled before the callback returned.
    #[error("{cause}")]
    Cancelled {
        /// The cancellation cause.
        cause: String,
    },

    /// The callback did not return within its timeout plus grace period.
    /// The worker running it has been abandoned.
    #[error("{name} did not return on timeout")]
    DidNotReturn {
        /// The name passed to the safe call.
        name: String,
    },
}

/// Misuse or interruption of the fixture stack.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StackError {
    /// The caller's context was cancelled mid-operation.
    #[error("{cause}")]
    Cancelled {
        /// The cancellation cause.
        cause: String,
    },

    /// A fixture was pushed while the stack was yellow.
    #[error("BUG: fixture `{name}` pushed onto a yellow stack")]
    PushOnYellow {
        /// The fixture being pushed.
        name: String,
    },

    /// A fixture was pushed whose declared parent is not the stack top.
    #[error("BUG: fixture `{name}` declares parent `{parent}` but the stack top is `{top}`")]
    WrongParent {
        /// The fixture being pushed.
        name: String,
        /// Its declared parent.
        parent: String,
        /// The current stack top.
        top: String,
    },

    /// `reset` was called while the stack was yellow.
    #[error("BUG: reset called on a yellow stack")]
    ResetOnYellow,

    /// `mark_dirty` was called twice without an intervening reset.
    #[error("BUG: fixture stack marked dirty twice")]
    AlreadyDirty,
}

impl StackError {
    /// Returns true for the variants that indicate a framework bug rather
    /// than an interrupted run.
    pub fn is_bug(&self) -> bool {
        !matches!(self, StackError::Cancelled { .. })
    }
}

/// Failure reconnecting to the device under test.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to reconnect to DUT: {reason}")]
pub struct DutError {
    /// Description of the failure.
    pub reason: String,
}

impl DutError {
    /// Creates a new error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure reported by a fixture's `reset` callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct ResetError {
    /// Description of the failure.
    pub reason: String,
}

impl ResetError {
    /// Creates a new error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<&str> for ResetError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for ResetError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

/// A framework-level failure that determines the bundle's exit code.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Bad argument record.
    #[error(transparent)]
    Args(#[from] ArgsError),

    /// Bad registration.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Bad selection patterns.
    #[error(transparent)]
    Patterns(#[from] PatternError),

    /// The selection matched no tests in a context where one was required.
    #[error("no tests matched the requested patterns")]
    NoTestsMatched,

    /// The run aborted before producing a complete event sequence.
    #[error("run aborted: {reason}")]
    Aborted {
        /// Description of the failure.
        reason: String,
    },

    /// Writing output failed.
    #[error("failed to write bundle output")]
    Output(#[source] std::io::Error),
}

impl BundleError {
    /// Maps the error to the exit code the bundle process should report.
    pub fn exit_code(&self) -> i32 {
        match self {
            BundleError::Args(_) => BundleExitCode::BAD_ARGS,
            BundleError::Registration(_) => BundleExitCode::BAD_TESTS,
            BundleError::Patterns(_) => BundleExitCode::BAD_PATTERNS,
            BundleError::NoTestsMatched => BundleExitCode::NO_TESTS,
            BundleError::Aborted { .. } | BundleError::Output(_) => BundleExitCode::ERROR,
        }
    }
}
