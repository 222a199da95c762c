//! termdb surface syntax
//!
//! This crate defines the textual form of sentences (facts and patterns) and
//! of the numeric conditions that can be attached to pattern variables, and
//! provides nom parsers + typed ASTs for both.
//!
//! ```text
//! (likes john, obj mary)                      a fact
//! (!likes john, obj mary)                     a negated fact
//! (likes Person1, obj Person1)                a pattern with a repeated variable
//! (aged Person1, years {Years1: Years1 >= 18}) a numeric condition on a variable
//! Fact1:(wants john, what (eats john, food Food1))
//! ```
//!
//! The parser is purely syntactic. Resolving symbols and variable types
//! against a taxonomy is done by `termdb-core`.

pub mod condition;
pub mod sentence;

use thiserror::Error;

pub use condition::{parse_condition, BinaryOp, Expr, UnaryOp};
pub use sentence::{parse_sentence, Modifier, Operand, Sentence, Word};

pub type Name = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("parse error at column {column}: {message}")]
    Syntax { column: usize, message: String },
}

/// Build a syntax error pointing at the start of `rest` inside `text`.
pub(crate) fn syntax_error(text: &str, rest: &str, message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        column: text.len().saturating_sub(rest.len()) + 1,
        message: message.into(),
    }
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub(crate) fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub(crate) fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> nom::IResult<&'a str, O>
where
    F: FnMut(&'a str) -> nom::IResult<&'a str, O>,
{
    nom::sequence::delimited(
        nom::character::complete::multispace0,
        inner,
        nom::character::complete::multispace0,
    )
}

pub(crate) fn parse_ident(input: &str) -> nom::IResult<&str, &str> {
    use nom::bytes::complete::{take_while, take_while_m_n};
    use nom::combinator::recognize;
    use nom::sequence::pair;

    recognize(pair(
        take_while_m_n(1, 1, is_ident_start),
        take_while(is_ident_continue),
    ))(input)
}
