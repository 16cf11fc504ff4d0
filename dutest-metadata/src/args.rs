// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The schema version of [`BundleArgs`] this crate understands.
pub const BUNDLE_ARGS_VERSION: u32 = 1;

/// The single argument record a bundle process reads from standard input.
///
/// The runner serializes one of these as JSON and pipes it to the bundle.
/// Unknown optional fields are ignored for forward compatibility, but the
/// `version` field is checked strictly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleArgs {
    /// Schema version; must equal [`BUNDLE_ARGS_VERSION`].
    #[serde(default)]
    pub version: u32,

    /// What the bundle should do.
    #[serde(default)]
    pub mode: RunMode,

    /// Test selection patterns.
    ///
    /// Empty selects every test. A single string wrapped in parentheses is
    /// parsed as an attribute expression; anything else is a list of name
    /// globs.
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Directory holding external data files.
    #[serde(default)]
    pub data_dir: Utf8PathBuf,

    /// Root directory for per-entity output files.
    #[serde(default)]
    pub out_dir: Utf8PathBuf,

    /// Directory for scratch files, wiped between runs.
    #[serde(default)]
    pub temp_dir: Utf8PathBuf,

    /// Remote-only configuration; absent when the bundle runs on the DUT
    /// itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteArgs>,

    /// Software features the DUT is known to have.
    #[serde(default)]
    pub available_software_features: Vec<String>,

    /// Software features the DUT is known to lack.
    #[serde(default)]
    pub unavailable_software_features: Vec<String>,

    /// Whether to skip tests whose software dependencies are unsatisfied.
    /// When false, every test runs regardless of its declared dependencies.
    #[serde(default)]
    pub check_software_deps: bool,

    /// If true, run the bundle delegate's readiness hook before any test.
    #[serde(default)]
    pub wait_until_ready: bool,

    /// Devserver URLs used to fetch external data files.
    #[serde(default)]
    pub devservers: Vec<String>,

    /// How external data files are fetched.
    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Maximum silent interval between output records; a heartbeat record is
    /// written whenever it would otherwise be exceeded. Zero disables
    /// heartbeats.
    #[serde(default, with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Stop scheduling new tests once this many have failed. Zero means no
    /// limit.
    #[serde(default)]
    pub max_test_failures: usize,

    /// Name of a registered fixture to treat as the root of every test's
    /// fixture chain, if set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_fixture: String,
}

/// How to reach the device under test, for bundles driven from a host
/// machine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteArgs {
    /// `host:port` of the DUT's SSH endpoint.
    pub target: String,

    /// SSH private key file.
    #[serde(default)]
    pub key_file: Utf8PathBuf,

    /// Directory searched for SSH private keys.
    #[serde(default)]
    pub key_dir: Utf8PathBuf,

    /// Path to the harness executable pushed to the DUT.
    #[serde(default)]
    pub runner_path: Utf8PathBuf,

    /// Extra flags forwarded to the remote harness.
    #[serde(default)]
    pub run_flags: Vec<String>,

    /// Directory on the DUT holding local bundles.
    #[serde(default)]
    pub local_bundle_dir: Utf8PathBuf,
}

/// What a bundle process does with the selected tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunMode {
    /// Run the selected tests, streaming events to standard output.
    #[default]
    RunTests,

    /// Write a JSON description of the selected tests and exit.
    ListTests,
}

/// When external data files are fetched.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadMode {
    /// Fetch every selected test's data files before the first test runs.
    #[default]
    Batch,

    /// Fetch each test's data files just before that test runs.
    Lazy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_minimal() {
        let args: BundleArgs = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert_eq!(args.mode, RunMode::RunTests);
        assert_eq!(args.download_mode, DownloadMode::Batch);
        assert!(args.patterns.is_empty());
        assert!(args.remote.is_none());
    }

    #[test]
    fn args_parse_full() {
        let input = r#"{
            "version": 1,
            "mode": "ListTests",
            "patterns": ["(\"group:mainline\" && !informational)"],
            "dataDir": "/data",
            "outDir": "/out",
            "tempDir": "/tmp/dutest",
            "remote": {"target": "dut:22", "keyFile": "/key"},
            "availableSoftwareFeatures": ["wifi"],
            "unavailableSoftwareFeatures": ["cellular"],
            "checkSoftwareDeps": true,
            "downloadMode": "lazy",
            "heartbeatInterval": "30s",
            "maxTestFailures": 5
        }"#;
        let args: BundleArgs = serde_json::from_str(input).unwrap();
        assert_eq!(args.mode, RunMode::ListTests);
        assert_eq!(args.download_mode, DownloadMode::Lazy);
        assert_eq!(args.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(args.remote.unwrap().target, "dut:22");
        assert_eq!(args.max_test_failures, 5);
    }

    #[test]
    fn unknown_fields_tolerated() {
        let args: BundleArgs =
            serde_json::from_str(r#"{"version": 1, "futureField": true}"#).unwrap();
        assert_eq!(args.version, 1);
    }
}
