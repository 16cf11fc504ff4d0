// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A single record in the bundle's output stream.
///
/// Records are written as newline-delimited JSON, tagged by the `type` field.
/// Events for one entity are strictly ordered; entities nest (a child's
/// `EntityStart`/`EntityEnd` pair lies between its parent's) but do not
/// otherwise interleave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// An entity (test or fixture) has started.
    #[serde(rename_all = "camelCase")]
    EntityStart {
        /// The entity's name.
        entity: SmolStr,

        /// The directory in which the entity may leave output files.
        out_dir: camino::Utf8PathBuf,
    },

    /// An entity logged a message.
    #[serde(rename_all = "camelCase")]
    EntityLog {
        /// The entity's name.
        entity: SmolStr,

        /// The logged text.
        text: String,
    },

    /// An entity reported an error. Reporting an error marks the entity
    /// failed but does not end it.
    #[serde(rename_all = "camelCase")]
    EntityError {
        /// The entity's name.
        entity: SmolStr,

        /// The reported error.
        error: ErrorObject,
    },

    /// An entity has finished. Exactly one `EntityEnd` is written per
    /// `EntityStart`, and no further events for the entity follow it.
    #[serde(rename_all = "camelCase")]
    EntityEnd {
        /// The entity's name.
        entity: SmolStr,

        /// If non-empty, the entity was skipped before running, for these
        /// reasons.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skip_reasons: Vec<String>,

        /// Per-stage timing information, if collected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timing_log: Option<TimingLog>,
    },

    /// A message about the run as a whole rather than a single entity.
    #[serde(rename_all = "camelCase")]
    RunLog {
        /// The logged text.
        text: String,
    },

    /// A framework-level failure that ends the run.
    #[serde(rename_all = "camelCase")]
    RunError {
        /// The error that ended the run.
        error: ErrorObject,

        /// The exit status the bundle will report.
        status: i32,
    },

    /// A keepalive record, written when no other event has been produced
    /// within the configured heartbeat interval.
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// The time at which the heartbeat was written.
        time: DateTime<Local>,
    },
}

impl Event {
    /// Returns the entity name this event is about, if it is an entity event.
    pub fn entity(&self) -> Option<&str> {
        match self {
            Event::EntityStart { entity, .. }
            | Event::EntityLog { entity, .. }
            | Event::EntityError { entity, .. }
            | Event::EntityEnd { entity, .. } => Some(entity),
            Event::RunLog { .. } | Event::RunError { .. } | Event::Heartbeat { .. } => None,
        }
    }
}

/// A structured error attached to an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    /// Human-readable description of the failure.
    pub reason: String,

    /// Source file in which the error was reported.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,

    /// Line at which the error was reported.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: u32,

    /// Captured backtrace, if available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack: String,
}

fn is_zero(line: &u32) -> bool {
    *line == 0
}

impl ErrorObject {
    /// Creates an error with just a reason, with no location information.
    pub fn from_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            file: String::new(),
            line: 0,
            stack: String::new(),
        }
    }
}

/// Wall-clock timings for the stages of a single entity, reported in its
/// `EntityEnd` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingLog {
    /// The recorded stages, in execution order.
    pub stages: Vec<TimingStage>,
}

/// One entry of a [`TimingLog`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingStage {
    /// The stage name.
    pub name: String,

    /// Elapsed seconds.
    pub seconds: f64,
}
