// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{AttrExprParseError, GlobConstructError},
    parsing,
};
use std::fmt;

/// A parsed attribute expression.
///
/// Build one with [`AttrExpr::parse`], then match tests against it with
/// [`AttrExpr::eval`].
#[derive(Clone, Debug, PartialEq)]
pub enum AttrExpr {
    /// Negation.
    Not(Box<AttrExpr>),

    /// Both sides must match.
    And(Box<AttrExpr>, Box<AttrExpr>),

    /// Either side must match.
    Or(Box<AttrExpr>, Box<AttrExpr>),

    /// A single attribute matcher.
    Atom(AttrMatcher),
}

impl AttrExpr {
    /// Parses an expression.
    pub fn parse(input: &str) -> Result<Self, AttrExprParseError> {
        parsing::parse_expr(input)
    }

    /// Returns true if the expression matches the given attribute list.
    pub fn eval(&self, attrs: &[String]) -> bool {
        match self {
            AttrExpr::Not(expr) => !expr.eval(attrs),
            AttrExpr::And(lhs, rhs) => lhs.eval(attrs) && rhs.eval(attrs),
            AttrExpr::Or(lhs, rhs) => lhs.eval(attrs) || rhs.eval(attrs),
            AttrExpr::Atom(matcher) => attrs.iter().any(|attr| matcher.is_match(attr)),
        }
    }

    pub(crate) fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    pub(crate) fn not(self) -> Self {
        AttrExpr::Not(self.boxed())
    }

    pub(crate) fn and(lhs: Self, rhs: Self) -> Self {
        AttrExpr::And(lhs.boxed(), rhs.boxed())
    }

    pub(crate) fn or(lhs: Self, rhs: Self) -> Self {
        AttrExpr::Or(lhs.boxed(), rhs.boxed())
    }
}

/// Matcher for a single attribute atom.
///
/// Atoms without wildcard characters compare for equality; atoms with them
/// compile to a glob.
#[derive(Clone, Debug)]
pub enum AttrMatcher {
    /// Exact comparison.
    Equal(String),

    /// Glob comparison.
    Glob(AttrGlob),
}

impl AttrMatcher {
    /// Creates a matcher for the given atom text.
    pub fn new(text: String) -> Result<Self, GlobConstructError> {
        if text.contains(['*', '?', '[']) {
            Ok(AttrMatcher::Glob(AttrGlob::new(text)?))
        } else {
            Ok(AttrMatcher::Equal(text))
        }
    }

    /// Returns true if the matcher matches the attribute.
    pub fn is_match(&self, attr: &str) -> bool {
        match self {
            AttrMatcher::Equal(text) => attr == text,
            AttrMatcher::Glob(glob) => glob.is_match(attr),
        }
    }
}

impl PartialEq for AttrMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Equal(a), Self::Equal(b)) => a == b,
            (Self::Glob(a), Self::Glob(b)) => a.pattern() == b.pattern(),
            _ => false,
        }
    }
}

/// A compiled glob atom.
///
/// Attributes are flat strings, not paths, so `globset`'s ready-made
/// matcher (with its separator and hidden-file rules) is the wrong tool
/// here. Instead the glob is lowered to the regex `globset` derives for it
/// and that regex is matched against the whole attribute.
#[derive(Clone, Debug)]
pub struct AttrGlob {
    pattern: String,
    matcher: regex::bytes::Regex,
}

impl AttrGlob {
    pub(crate) fn new(pattern: String) -> Result<Self, GlobConstructError> {
        match compile_glob(&pattern) {
            Ok(matcher) => Ok(Self { pattern, matcher }),
            Err(message) => Err(GlobConstructError {
                glob: pattern,
                message,
            }),
        }
    }

    /// The glob as written in the expression.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the glob matches an attribute.
    pub fn is_match(&self, attr: &str) -> bool {
        // globset derives byte-oriented regexes.
        self.matcher.is_match(attr.as_bytes())
    }
}

fn compile_glob(pattern: &str) -> Result<regex::bytes::Regex, String> {
    let glob = globset::GlobBuilder::new(pattern)
        // Character classes are escape mechanism enough for attributes;
        // backslashes stay literal.
        .backslash_escape(false)
        .build()
        .map_err(|err| err.to_string())?;
    regex::bytes::Regex::new(glob.regex()).map_err(|err| err.to_string())
}

impl fmt::Display for AttrExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrExpr::Not(expr) => write!(f, "!{expr}"),
            AttrExpr::And(lhs, rhs) => write!(f, "({lhs} && {rhs})"),
            AttrExpr::Or(lhs, rhs) => write!(f, "({lhs} || {rhs})"),
            AttrExpr::Atom(AttrMatcher::Equal(text)) => write!(f, "\"{text}\""),
            AttrExpr::Atom(AttrMatcher::Glob(glob)) => write!(f, "\"{}\"", glob.pattern()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn eval_atoms() {
        let expr = AttrExpr::parse("group:mainline").unwrap();
        assert!(expr.eval(&attrs(&["group:mainline", "informational"])));
        assert!(!expr.eval(&attrs(&["group:crosbolt"])));
        assert!(!expr.eval(&[]));
    }

    #[test]
    fn eval_boolean_operators() {
        let expr = AttrExpr::parse("\"group:mainline\" && !informational").unwrap();
        assert!(expr.eval(&attrs(&["group:mainline"])));
        assert!(!expr.eval(&attrs(&["group:mainline", "informational"])));

        let expr = AttrExpr::parse("a || b").unwrap();
        assert!(expr.eval(&attrs(&["b"])));
        assert!(!expr.eval(&attrs(&["c"])));
    }

    #[test]
    fn eval_operator_precedence() {
        // && binds tighter than ||.
        let expr = AttrExpr::parse("a || b && c").unwrap();
        assert!(expr.eval(&attrs(&["a"])));
        assert!(expr.eval(&attrs(&["b", "c"])));
        assert!(!expr.eval(&attrs(&["b"])));

        let expr = AttrExpr::parse("(a || b) && c").unwrap();
        assert!(!expr.eval(&attrs(&["a"])));
        assert!(expr.eval(&attrs(&["a", "c"])));
    }

    #[test]
    fn eval_globs() {
        let expr = AttrExpr::parse("\"dep:wifi_*\"").unwrap();
        assert!(expr.eval(&attrs(&["dep:wifi_chipset"])));
        assert!(!expr.eval(&attrs(&["dep:bluetooth"])));
    }

    #[test]
    fn parse_errors() {
        for input in ["", "a &&", "(a", "a || || b", "\"unterminated"] {
            let err = AttrExpr::parse(input).unwrap_err();
            assert_eq!(err.input, input);
        }
    }

    #[test]
    fn display_round_trip() {
        let expr = AttrExpr::parse("a && !(b || \"c d\")").unwrap();
        let reparsed = AttrExpr::parse(&expr.to_string()).unwrap();
        assert_eq!(expr, reparsed);
    }
}
