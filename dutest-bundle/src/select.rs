// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test selection.
//!
//! The runner passes patterns through the bundle args. An empty list
//! selects everything; a single string wrapped in parentheses is an
//! attribute expression; anything else is a list of name globs, of which
//! any one may match.

use crate::{errors::PatternError, registry::Test};
use dutest_filtering::{AttrExpr, AttrMatcher};

/// A compiled test filter.
#[derive(Debug)]
pub enum TestFilter {
    /// Every test is selected.
    All,

    /// Tests whose name matches any of these patterns.
    Names(Vec<AttrMatcher>),

    /// Tests whose attributes satisfy the expression.
    Attr(AttrExpr),
}

impl TestFilter {
    /// Compiles the runner-provided pattern list.
    pub fn from_patterns(patterns: &[String]) -> Result<Self, PatternError> {
        if patterns.is_empty() {
            return Ok(TestFilter::All);
        }
        if patterns.len() == 1 {
            let trimmed = patterns[0].trim();
            if trimmed.starts_with('(') && trimmed.ends_with(')') {
                return Ok(TestFilter::Attr(AttrExpr::parse(trimmed)?));
            }
        }
        let matchers = patterns
            .iter()
            .map(|pattern| {
                AttrMatcher::new(pattern.clone()).map_err(|error| PatternError::Glob {
                    pattern: pattern.clone(),
                    message: error.message,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TestFilter::Names(matchers))
    }

    /// True if the filter selects the test.
    pub fn matches(&self, test: &Test) -> bool {
        match self {
            TestFilter::All => true,
            TestFilter::Names(matchers) => {
                matchers.iter().any(|matcher| matcher.is_match(test.name()))
            }
            TestFilter::Attr(expr) => expr.eval(test.attrs()),
        }
    }
}
