//! Numeric condition expressions.
//!
//! A condition is attached to a pattern variable (`{Years1: Years1 >= 18}`)
//! and may reference any variable bound elsewhere in the same pattern.
//!
//! Precedence, loosest first:
//!
//! ```text
//! |            disjunction
//! &            conjunction
//! = != < <= > >=  comparison (non-associative)
//! + -          additive
//! * / %        multiplicative
//! - ~          unary negate / not
//! ```

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char as pchar, digit1},
    combinator::{all_consuming, map, map_res, opt, value},
    multi::many0,
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::{parse_ident, syntax_error, ws, Name, ParseError};

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Var(Name),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn var(name: impl Into<Name>) -> Self {
        Expr::Var(name.into())
    }

    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        Expr::Unary {
            op,
            arg: Box::new(arg),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Variable names referenced by the expression, in first-appearance order.
    pub fn variables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Int(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Unary { arg, .. } => arg.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Var(name) => f.write_str(name),
            Expr::Unary { op: UnaryOp::Neg, arg } => write!(f, "-{arg}"),
            Expr::Unary { op: UnaryOp::Not, arg } => write!(f, "~{arg}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

pub fn parse_condition(text: &str) -> Result<Expr, ParseError> {
    match all_consuming(expr)(text) {
        Ok((_, e)) => Ok(e),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(syntax_error(text, e.input, "expected a condition expression"))
        }
        Err(nom::Err::Incomplete(_)) => Err(syntax_error(text, "", "incomplete condition")),
    }
}

fn fold_left(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter()
        .fold(first, |lhs, (op, rhs)| Expr::binary(op, lhs, rhs))
}

pub(crate) fn expr(input: &str) -> IResult<&str, Expr> {
    disjunction(input)
}

fn disjunction(input: &str) -> IResult<&str, Expr> {
    let (input, first) = conjunction(input)?;
    let (input, rest) = many0(pair(value(BinaryOp::Or, ws(pchar('|'))), conjunction))(input)?;
    Ok((input, fold_left(first, rest)))
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (input, first) = comparison(input)?;
    let (input, rest) = many0(pair(value(BinaryOp::And, ws(pchar('&'))), comparison))(input)?;
    Ok((input, fold_left(first, rest)))
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Eq, tag("=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, tail) = opt(pair(ws(comparison_op), additive))(input)?;
    let out = match tail {
        Some((op, rhs)) => Expr::binary(op, lhs, rhs),
        None => lhs,
    };
    Ok((input, out))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = multiplicative(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Add, pchar('+')),
            value(BinaryOp::Sub, pchar('-')),
        ))),
        multiplicative,
    ))(input)?;
    Ok((input, fold_left(first, rest)))
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, pchar('*')),
            value(BinaryOp::Div, pchar('/')),
            value(BinaryOp::Rem, pchar('%')),
        ))),
        unary,
    ))(input)?;
    Ok((input, fold_left(first, rest)))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(pchar('-')), unary), |e| {
            Expr::unary(UnaryOp::Neg, e)
        }),
        map(preceded(ws(pchar('~')), unary), |e| {
            Expr::unary(UnaryOp::Not, e)
        }),
        atom,
    ))(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map_res(digit1, |digits: &str| digits.parse::<i64>().map(Expr::Int)),
        map(parse_ident, |name: &str| Expr::Var(name.to_string())),
        delimited(pchar('('), expr, pchar(')')),
    )))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_binds_tighter_than_conjunction() {
        let e = parse_condition("N >= 18 & N < 65").unwrap();
        assert_eq!(
            e,
            Expr::binary(
                BinaryOp::And,
                Expr::binary(BinaryOp::Ge, Expr::var("N"), Expr::Int(18)),
                Expr::binary(BinaryOp::Lt, Expr::var("N"), Expr::Int(65)),
            )
        );
    }

    #[test]
    fn arithmetic_is_left_associative() {
        let e = parse_condition("A - B - 1 = 0").unwrap();
        assert_eq!(e.to_string(), "(((A - B) - 1) = 0)");
    }

    #[test]
    fn unary_operators_nest() {
        let e = parse_condition("~(N = -3)").unwrap();
        assert_eq!(
            e,
            Expr::unary(
                UnaryOp::Not,
                Expr::binary(
                    BinaryOp::Eq,
                    Expr::var("N"),
                    Expr::unary(UnaryOp::Neg, Expr::Int(3))
                )
            )
        );
    }

    #[test]
    fn variables_are_deduplicated_in_order() {
        let e = parse_condition("B * A > A % 2 | C = B").unwrap();
        assert_eq!(e.variables(), vec!["B", "A", "C"]);
    }

    #[test]
    fn reports_column_of_trailing_garbage() {
        let err = parse_condition("N >= 18 )").unwrap_err();
        let ParseError::Syntax { column, .. } = err;
        assert_eq!(column, 9);
    }
}
