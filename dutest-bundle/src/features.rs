// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Software-feature dependency checking.
//!
//! The runner tells each bundle which software features the DUT has and
//! lacks; a test declaring a dependency on a lacking feature is skipped
//! before it runs, and a dependency on a feature nobody told us about is a
//! test failure (it usually means a typo in the test's declaration).

use std::collections::BTreeSet;

/// The set of software features known for the current DUT.
#[derive(Clone, Debug, Default)]
pub struct FeatureSet {
    available: BTreeSet<String>,
    unavailable: BTreeSet<String>,
    check: bool,
}

/// Outcome of checking one test's declared software dependencies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DepCheckResult {
    /// Every declared dependency is available.
    Satisfied,

    /// At least one declared dependency is known to be unavailable; the
    /// test is skipped with these reasons.
    Skip(Vec<String>),

    /// At least one declared dependency is neither available nor
    /// unavailable; the test fails with this message.
    Unknown(String),
}

impl FeatureSet {
    /// Creates a feature set. When `check` is false, every dependency is
    /// treated as satisfied.
    pub fn new(
        available: impl IntoIterator<Item = String>,
        unavailable: impl IntoIterator<Item = String>,
        check: bool,
    ) -> Self {
        Self {
            available: available.into_iter().collect(),
            unavailable: unavailable.into_iter().collect(),
            check,
        }
    }

    /// True if dependency checking is enabled.
    pub fn check_enabled(&self) -> bool {
        self.check
    }

    /// Checks a test's declared dependencies.
    pub fn check_deps(&self, deps: &[String]) -> DepCheckResult {
        if !self.check {
            return DepCheckResult::Satisfied;
        }

        let mut unknown = Vec::new();
        let mut missing = Vec::new();
        for dep in deps {
            if self.available.contains(dep) {
                continue;
            }
            if self.unavailable.contains(dep) {
                missing.push(dep.clone());
            } else {
                unknown.push(dep.clone());
            }
        }

        if !unknown.is_empty() {
            DepCheckResult::Unknown(format!("Unknown dependencies: {}", unknown.join(" ")))
        } else if !missing.is_empty() {
            DepCheckResult::Skip(
                missing
                    .into_iter()
                    .map(|dep| format!("missing software features: {dep}"))
                    .collect(),
            )
        } else {
            DepCheckResult::Satisfied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> FeatureSet {
        FeatureSet::new(
            vec!["valid".to_owned()],
            vec!["missing".to_owned()],
            true,
        )
    }

    #[test]
    fn satisfied_deps() {
        assert_eq!(
            features().check_deps(&["valid".to_owned()]),
            DepCheckResult::Satisfied
        );
        assert_eq!(features().check_deps(&[]), DepCheckResult::Satisfied);
    }

    #[test]
    fn missing_deps_skip() {
        match features().check_deps(&["missing".to_owned()]) {
            DepCheckResult::Skip(reasons) => {
                assert_eq!(reasons, ["missing software features: missing"]);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn unknown_deps_fail() {
        assert_eq!(
            features().check_deps(&["unreg".to_owned()]),
            DepCheckResult::Unknown("Unknown dependencies: unreg".to_owned())
        );
    }

    #[test]
    fn unknown_takes_precedence_over_missing() {
        assert_eq!(
            features().check_deps(&["missing".to_owned(), "unreg".to_owned()]),
            DepCheckResult::Unknown("Unknown dependencies: unreg".to_owned())
        );
    }

    #[test]
    fn disabled_check_satisfies_everything() {
        let set = FeatureSet::new(vec![], vec![], false);
        assert_eq!(
            set.check_deps(&["anything".to_owned()]),
            DepCheckResult::Satisfied
        );
    }
}
