// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-format types shared between the dutest runner and bundle processes.
//!
//! A bundle process reads a single [`BundleArgs`] record from standard input
//! and, in run mode, writes a stream of newline-delimited JSON [`Event`]
//! records to standard output. In list mode it writes a [`TestListSummary`]
//! instead. This crate contains only the serializable types and the exit-code
//! contract; all execution logic lives in `dutest-bundle`.

mod args;
mod events;
mod exit_codes;
mod list;

pub use args::*;
pub use events::*;
pub use exit_codes::*;
pub use list::*;
