// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing and evaluation of attribute expressions.
//!
//! The runner selects tests either by name globs or by a boolean expression
//! over their attributes, e.g.
//!
//! ```text
//! ("group:mainline" && !informational) || attr:*wifi*
//! ```
//!
//! An atom matches a test if any of the test's attributes equals the atom,
//! or matches it as a glob if the atom contains wildcard characters. Atoms
//! may be bare words or double-quoted strings; `!`, `&&`, `||` and
//! parentheses combine them.

pub mod errors;
mod expression;
mod parsing;

pub use expression::{AttrExpr, AttrGlob, AttrMatcher};
