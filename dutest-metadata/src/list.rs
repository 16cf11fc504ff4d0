// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Output of a bundle's list mode: every selected test, keyed by name.
///
/// Listing the same registry with the same patterns always produces the same
/// summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestListSummary {
    /// The selected tests.
    pub tests: BTreeMap<String, TestInfo>,
}

/// Description of one registered test, as reported by list mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInfo {
    /// Free-form attributes used for selection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<String>,

    /// Declared external data files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,

    /// Declared software-feature dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub software_deps: Vec<String>,

    /// Declared service dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_deps: Vec<String>,

    /// Name of the test's parent fixture, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fixture: String,

    /// The test's total timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// If present, the test would be skipped before running, for this
    /// reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}
