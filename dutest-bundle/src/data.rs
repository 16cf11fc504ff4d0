// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! External data files.
//!
//! Tests declare the data files they use; the files live under
//! `<data_dir>/<pkg_path>/<name>`. A file may be external, in which case a
//! sidecar `<name>.external` JSON record describes where to fetch it from
//! and a downloader (running either before the whole batch or lazily before
//! each test) materializes it. A failed fetch leaves a
//! `<name>.external-error` sidecar whose contents explain the failure.
//!
//! The downloader itself is an external collaborator; this module only
//! defines its contract and verifies declared files before a test runs.

use crate::Context;
use camino::{Utf8Path, Utf8PathBuf};
use dutest_metadata::ErrorObject;

/// Suffix of the sidecar describing where an external file comes from.
pub const EXTERNAL_SUFFIX: &str = ".external";

/// Suffix of the sidecar left behind by a failed fetch.
pub const EXTERNAL_ERROR_SUFFIX: &str = ".external-error";

/// One declared data file, resolved against the bundle's data directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataFileRef {
    /// Directory component derived from the owning test's package.
    pub pkg_path: Utf8PathBuf,

    /// The declared file name.
    pub name: String,
}

impl DataFileRef {
    /// The file's path under `data_dir`.
    pub fn path(&self, data_dir: &Utf8Path) -> Utf8PathBuf {
        data_dir.join(&self.pkg_path).join(&self.name)
    }
}

/// Fetches external data files ahead of the tests that use them.
pub trait DataDownloader: Send {
    /// Called once, before the first test, in batch mode. `files` covers
    /// every selected test.
    fn before_run(&mut self, ctx: &Context, files: &[DataFileRef]);

    /// Called before each entity, in lazy mode, with just that entity's
    /// files.
    fn before_entity(&mut self, ctx: &Context, files: &[DataFileRef]);
}

/// Derives the data-directory component for a dotted test name:
/// `a.b.Test` → `a/b`.
pub fn pkg_path(test_name: &str) -> Utf8PathBuf {
    let mut components: Vec<&str> = test_name.split('.').collect();
    components.pop();
    components.iter().collect()
}

/// Checks that every declared file is present and healthy. Returns one
/// error per problem; an empty result means the test may run.
pub fn verify_files(data_dir: &Utf8Path, files: &[DataFileRef]) -> Vec<ErrorObject> {
    let mut errors = Vec::new();
    for file in files {
        let path = file.path(data_dir);
        let error_sidecar = Utf8PathBuf::from(format!("{path}{EXTERNAL_ERROR_SUFFIX}"));
        if error_sidecar.exists() {
            let detail = std::fs::read_to_string(&error_sidecar)
                .unwrap_or_else(|_| "unreadable error sidecar".to_owned());
            errors.push(ErrorObject::from_reason(format!(
                "data file {}: {}",
                file.name,
                detail.trim()
            )));
            continue;
        }
        if !path.exists() {
            let external_sidecar = Utf8PathBuf::from(format!("{path}{EXTERNAL_SUFFIX}"));
            let reason = if external_sidecar.exists() {
                format!("external data file {} was not downloaded", file.name)
            } else {
                format!("data file {} was not found", file.name)
            };
            errors.push(ErrorObject::from_reason(reason));
        }
    }
    errors
}
