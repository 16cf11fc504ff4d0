// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The winnow parser behind [`AttrExpr::parse`].
//!
//! Grammar, loosest-binding first:
//!
//! ```text
//! expr  := and ( "||" and )*
//! and   := unary ( "&&" unary )*
//! unary := "!" unary | "(" expr ")" | atom
//! atom  := quoted string | bare word
//! ```

use crate::{
    errors::AttrExprParseError,
    expression::{AttrExpr, AttrMatcher},
};
use winnow::{
    ascii::multispace0,
    combinator::{alt, cut_err, delimited, preceded, repeat, terminated},
    error::{ContextError, StrContext, StrContextValue},
    prelude::*,
    token::{none_of, take_while},
};

pub(crate) fn parse_expr(input: &str) -> Result<AttrExpr, AttrExprParseError> {
    delimited(multispace0, parse_or, multispace0)
        .parse(input)
        .map_err(|error| {
            let message = error.inner().to_string();
            AttrExprParseError {
                input: input.to_owned(),
                offset: error.offset(),
                message: if message.is_empty() {
                    "expected attribute expression".to_owned()
                } else {
                    message
                },
            }
        })
}

fn parse_or(input: &mut &str) -> PResult<AttrExpr> {
    let first = parse_and.parse_next(input)?;
    let rest: Vec<AttrExpr> =
        repeat(0.., preceded(operator("||"), cut_err(parse_and))).parse_next(input)?;
    Ok(rest.into_iter().fold(first, AttrExpr::or))
}

fn parse_and(input: &mut &str) -> PResult<AttrExpr> {
    let first = parse_unary.parse_next(input)?;
    let rest: Vec<AttrExpr> =
        repeat(0.., preceded(operator("&&"), cut_err(parse_unary))).parse_next(input)?;
    Ok(rest.into_iter().fold(first, AttrExpr::and))
}

fn operator<'i>(op: &'static str) -> impl Parser<&'i str, &'i str, ContextError> {
    preceded(multispace0, op)
}

fn parse_unary(input: &mut &str) -> PResult<AttrExpr> {
    preceded(
        multispace0,
        alt((
            preceded('!', cut_err(parse_unary)).map(AttrExpr::not),
            parse_parens,
            parse_atom,
        ))
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute atom, `!`, or `(`",
        ))),
    )
    .parse_next(input)
}

fn parse_parens(input: &mut &str) -> PResult<AttrExpr> {
    delimited(
        '(',
        cut_err(parse_or),
        cut_err(preceded(multispace0, ')'))
            .context(StrContext::Expected(StrContextValue::CharLiteral(')'))),
    )
    .parse_next(input)
}

fn parse_atom(input: &mut &str) -> PResult<AttrExpr> {
    alt((parse_quoted, parse_bare_word))
        .try_map(AttrMatcher::new)
        .map(AttrExpr::Atom)
        .parse_next(input)
}

// Bare words cover typical attributes (`informational`, `group:mainline`,
// `dep:wifi_*`); anything with spaces or operator characters must be quoted.
fn parse_bare_word(input: &mut &str) -> PResult<String> {
    take_while(1.., |c: char| {
        c.is_alphanumeric()
            || matches!(
                c,
                '_' | '-' | ':' | '.' | '/' | '@' | '+' | '*' | '?' | '[' | ']'
            )
    })
    .map(str::to_owned)
    .parse_next(input)
}

fn parse_quoted(input: &mut &str) -> PResult<String> {
    preceded(
        '"',
        cut_err(terminated(
            repeat(0.., parse_quoted_char).fold(String::new, |mut acc, c| {
                acc.push(c);
                acc
            }),
            '"'.context(StrContext::Expected(StrContextValue::CharLiteral('"'))),
        )),
    )
    .parse_next(input)
}

fn parse_quoted_char(input: &mut &str) -> PResult<char> {
    alt((
        preceded(
            '\\',
            cut_err(alt((
                '"'.value('"'),
                '\\'.value('\\'),
                'n'.value('\n'),
                't'.value('\t'),
            )))
            .context(StrContext::Expected(StrContextValue::Description(
                "escape character",
            ))),
        ),
        none_of(['"', '\\']),
    ))
    .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::AttrMatcher;
    use pretty_assertions::assert_eq;

    fn atom(text: &str) -> AttrExpr {
        AttrExpr::Atom(AttrMatcher::new(text.to_owned()).unwrap())
    }

    #[test]
    fn parse_bare_and_quoted_atoms() {
        assert_eq!(parse_expr("informational").unwrap(), atom("informational"));
        assert_eq!(
            parse_expr("\"group:mainline\"").unwrap(),
            atom("group:mainline")
        );
        assert_eq!(parse_expr("  spaced  ").unwrap(), atom("spaced"));
        assert_eq!(
            parse_expr(r#""escaped \"quote\"""#).unwrap(),
            atom("escaped \"quote\"")
        );
    }

    #[test]
    fn parse_operators() {
        assert_eq!(
            parse_expr("a && b").unwrap(),
            AttrExpr::and(atom("a"), atom("b")),
        );
        assert_eq!(
            parse_expr("a || b && !c").unwrap(),
            AttrExpr::or(atom("a"), AttrExpr::and(atom("b"), atom("c").not())),
        );
        assert_eq!(
            parse_expr("(a || b) && c").unwrap(),
            AttrExpr::and(AttrExpr::or(atom("a"), atom("b")), atom("c")),
        );
    }

    #[test]
    fn parse_failure_offsets() {
        assert_eq!(parse_expr("a &&").unwrap_err().offset, 4);
        assert_eq!(parse_expr("(a").unwrap_err().offset, 2);
        assert_eq!(parse_expr("").unwrap_err().offset, 0);
    }

    #[test]
    fn trailing_garbage_rejected() {
        parse_expr("a b").unwrap_err();
        parse_expr("a) && b").unwrap_err();
    }

    #[test]
    fn invalid_glob_rejected() {
        parse_expr("\"dep:[\"").unwrap_err();
    }
}
