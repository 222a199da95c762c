//! Sentences: facts and patterns.
//!
//! ```text
//! sentence := [VAR ':'] '(' ['!'] word [operand (',' label operand)*] ')'
//! operand  := '{' VAR ':' condition '}' | sentence | number | word
//! word     := SYMBOL | VAR
//! ```
//!
//! A `VAR` is an identifier starting with an uppercase letter (`Person1`);
//! everything else is a `SYMBOL`. The first operand is the subject and gets
//! the implicit label `subj`.

use std::fmt;

use nom::{
    branch::alt,
    character::complete::{char as pchar, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, recognize, verify},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::condition::{self, Expr};
use crate::{parse_ident, syntax_error, ws, Name, ParseError};

/// Label given to the first operand of a sentence.
pub const SUBJECT_LABEL: &str = "subj";

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Word {
    Symbol(Name),
    Var(Name),
}

impl Word {
    pub fn name(&self) -> &str {
        match self {
            Word::Symbol(name) | Word::Var(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Word(Word),
    Number(i64),
    Sentence(Box<Sentence>),
    /// A variable restricted by a numeric condition: `{Years1: Years1 >= 18}`.
    Set { var: Name, condition: Expr },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifier {
    pub label: Name,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// `Fact1:(...)` binds the whole sentence to `Fact1` when used as a pattern.
    pub binder: Option<Name>,
    pub truth: bool,
    pub verb: Word,
    pub subject: Option<Operand>,
    pub modifiers: Vec<Modifier>,
}

impl Sentence {
    /// All labeled operands, the subject first under [`SUBJECT_LABEL`].
    pub fn labeled_operands(&self) -> impl Iterator<Item = (&str, &Operand)> {
        self.subject
            .iter()
            .map(|s| (SUBJECT_LABEL, s))
            .chain(self.modifiers.iter().map(|m| (m.label.as_str(), &m.value)))
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Word(w) => write!(f, "{w}"),
            Operand::Number(n) => write!(f, "{n}"),
            Operand::Sentence(s) => write!(f, "{s}"),
            Operand::Set { var, condition } => write!(f, "{{{var}: {condition}}}"),
        }
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(binder) = &self.binder {
            write!(f, "{binder}:")?;
        }
        f.write_str("(")?;
        if !self.truth {
            f.write_str("!")?;
        }
        write!(f, "{}", self.verb)?;
        if let Some(subject) = &self.subject {
            write!(f, " {subject}")?;
        }
        for m in &self.modifiers {
            write!(f, ", {} {}", m.label, m.value)?;
        }
        f.write_str(")")
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Parse a single sentence, optionally terminated by `.` or `?`.
pub fn parse_sentence(text: &str) -> Result<Sentence, ParseError> {
    let mut parser = all_consuming(delimited(
        multispace0,
        sentence,
        tuple((
            multispace0,
            opt(alt((pchar('.'), pchar('?')))),
            multispace0,
        )),
    ));
    match parser(text) {
        Ok((_, s)) => Ok(s),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(syntax_error(text, e.input, "expected a sentence `(verb subject, label object)`"))
        }
        Err(nom::Err::Incomplete(_)) => Err(syntax_error(text, "", "incomplete sentence")),
    }
}

pub fn is_var_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_uppercase())
}

fn var_name(input: &str) -> IResult<&str, &str> {
    verify(parse_ident, is_var_name)(input)
}

fn word(input: &str) -> IResult<&str, Word> {
    map(parse_ident, |name: &str| {
        if is_var_name(name) {
            Word::Var(name.to_string())
        } else {
            Word::Symbol(name.to_string())
        }
    })(input)
}

fn number(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(pchar('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

fn set(input: &str) -> IResult<&str, Operand> {
    let (input, _) = pchar('{')(input)?;
    let (input, var) = ws(var_name)(input)?;
    let (input, _) = ws(pchar(':'))(input)?;
    let (input, condition) = condition::expr(input)?;
    let (input, _) = pchar('}')(input)?;
    Ok((
        input,
        Operand::Set {
            var: var.to_string(),
            condition,
        },
    ))
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        set,
        map(sentence, |s| Operand::Sentence(Box::new(s))),
        map(number, Operand::Number),
        map(word, Operand::Word),
    ))(input)
}

fn modifier(input: &str) -> IResult<&str, Modifier> {
    let (input, label) = parse_ident(input)?;
    let (input, _) = multispace1(input)?;
    let (input, value) = operand(input)?;
    Ok((
        input,
        Modifier {
            label: label.to_string(),
            value,
        },
    ))
}

fn sentence(input: &str) -> IResult<&str, Sentence> {
    let (input, binder) = opt(terminated(var_name, ws(pchar(':'))))(input)?;
    let (input, _) = pchar('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, negation) = opt(pchar('!'))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, verb) = word(input)?;
    let (input, subject) = opt(preceded(multispace1, operand))(input)?;
    let (input, modifiers) = if subject.is_some() {
        many0(preceded(ws(pchar(',')), modifier))(input)?
    } else {
        (input, Vec::new())
    };
    let (input, _) = multispace0(input)?;
    let (input, _) = pchar(')')(input)?;
    Ok((
        input,
        Sentence {
            binder: binder.map(str::to_string),
            truth: negation.is_none(),
            verb,
            subject,
            modifiers,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::BinaryOp;

    #[test]
    fn parses_fact_with_modifiers() {
        let s = parse_sentence("(likes john, obj mary).").unwrap();
        assert!(s.truth);
        assert_eq!(s.verb, Word::Symbol("likes".into()));
        let ops: Vec<_> = s.labeled_operands().map(|(l, _)| l.to_string()).collect();
        assert_eq!(ops, vec!["subj", "obj"]);
    }

    #[test]
    fn parses_negation_binder_and_nesting() {
        let s = parse_sentence("Want1:(!wants john, what (eats john, food Food1))?").unwrap();
        assert_eq!(s.binder.as_deref(), Some("Want1"));
        assert!(!s.truth);
        let Operand::Sentence(inner) = &s.modifiers[0].value else {
            panic!("expected a nested sentence");
        };
        assert_eq!(inner.verb, Word::Symbol("eats".into()));
        assert_eq!(
            inner.modifiers[0].value,
            Operand::Word(Word::Var("Food1".into()))
        );
    }

    #[test]
    fn parses_numbers_and_sets() {
        let s = parse_sentence("(aged Person1, years {Years1: Years1 >= 18}, offset -3)").unwrap();
        let Operand::Set { var, condition } = &s.modifiers[0].value else {
            panic!("expected a set operand");
        };
        assert_eq!(var, "Years1");
        assert!(matches!(condition, Expr::Binary { op: BinaryOp::Ge, .. }));
        assert_eq!(s.modifiers[1].value, Operand::Number(-3));
    }

    #[test]
    fn bare_verb_sentence_has_no_operands() {
        let s = parse_sentence("( Exists1 )").unwrap();
        assert_eq!(s.verb, Word::Var("Exists1".into()));
        assert!(s.subject.is_none());
        assert!(s.modifiers.is_empty());
    }

    #[test]
    fn display_round_trips_text() {
        let text = "X1:(!likes john, obj (owns mary, what ball))";
        let s = parse_sentence(text).unwrap();
        assert_eq!(s.to_string(), text);
    }

    #[test]
    fn rejects_unbalanced_parens() {
        assert!(parse_sentence("(likes john, obj mary").is_err());
    }
}
