// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced while parsing attribute expressions.

use thiserror::Error;

/// An error that occurred while parsing an attribute expression.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to parse attribute expression `{input}` at offset {offset}: {message}")]
pub struct AttrExprParseError {
    /// The full expression that failed to parse.
    pub input: String,

    /// Byte offset into `input` at which parsing failed.
    pub offset: usize,

    /// Description of the failure.
    pub message: String,
}

/// An error that occurred while compiling a glob atom.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid glob `{glob}`: {message}")]
pub struct GlobConstructError {
    /// The offending glob.
    pub glob: String,

    /// Description of the failure.
    pub message: String,
}
