// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for bundle processes.
///
/// A bundle exits zero whenever it produced a complete event sequence, even
/// if some tests failed; non-zero codes indicate framework-level failures.
pub enum BundleExitCode {}

impl BundleExitCode {
    /// The bundle produced a complete event sequence.
    pub const SUCCESS: i32 = 0;

    /// An unclassified framework failure.
    pub const ERROR: i32 = 1;

    /// The argument record on standard input was missing or malformed.
    pub const BAD_ARGS: i32 = 2;

    /// Test or fixture registration was invalid.
    pub const BAD_TESTS: i32 = 3;

    /// A selection pattern could not be parsed.
    pub const BAD_PATTERNS: i32 = 4;

    /// No tests matched the selection, or tests failed while running
    /// standalone without an event consumer.
    pub const NO_TESTS: i32 = 5;
}
