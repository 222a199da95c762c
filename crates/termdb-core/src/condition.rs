//! Numeric conditions compiled against a query's path table.
//!
//! Variable references are replaced by slot indices (positions in the
//! compiled program's path list). Type checking happens once at compile
//! time; evaluation only fails on division by zero or overflow, which makes
//! the condition false for that fact.

use serde::{Deserialize, Serialize};
use termdb_dsl::{BinaryOp, Expr, UnaryOp};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Int,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompiledExpr {
    Int(i64),
    Slot(usize),
    Unary {
        op: UnaryOp,
        arg: Box<CompiledExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<CompiledExpr>,
        rhs: Box<CompiledExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Int(i64),
    Bool(bool),
}

/// Compile `expr`, mapping each variable through `slot_of`.
///
/// The whole expression must be boolean. `slot_of` reports unbound or
/// non-numeric variables.
pub fn compile<F>(expr: &Expr, slot_of: F) -> Result<CompiledExpr>
where
    F: Fn(&str) -> Result<usize>,
{
    let compiled = lower(expr, &slot_of)?;
    match type_of(expr)? {
        Ty::Bool => Ok(compiled),
        Ty::Int => Err(ill_typed(expr, "condition must be a comparison or logical expression")),
    }
}

fn lower<F>(expr: &Expr, slot_of: &F) -> Result<CompiledExpr>
where
    F: Fn(&str) -> Result<usize>,
{
    Ok(match expr {
        Expr::Int(n) => CompiledExpr::Int(*n),
        Expr::Var(name) => CompiledExpr::Slot(slot_of(name)?),
        Expr::Unary { op, arg } => CompiledExpr::Unary {
            op: *op,
            arg: Box::new(lower(arg, slot_of)?),
        },
        Expr::Binary { op, lhs, rhs } => CompiledExpr::Binary {
            op: *op,
            lhs: Box::new(lower(lhs, slot_of)?),
            rhs: Box::new(lower(rhs, slot_of)?),
        },
    })
}

fn ill_typed(expr: &Expr, message: &str) -> Error {
    Error::ConditionType {
        expr: expr.to_string(),
        message: message.to_string(),
    }
}

fn type_of(expr: &Expr) -> Result<Ty> {
    match expr {
        Expr::Int(_) | Expr::Var(_) => Ok(Ty::Int),
        Expr::Unary { op, arg } => {
            let arg_ty = type_of(arg)?;
            match (op, arg_ty) {
                (UnaryOp::Neg, Ty::Int) => Ok(Ty::Int),
                (UnaryOp::Not, Ty::Bool) => Ok(Ty::Bool),
                (UnaryOp::Neg, Ty::Bool) => Err(ill_typed(expr, "`-` needs a number")),
                (UnaryOp::Not, Ty::Int) => Err(ill_typed(expr, "`~` needs a boolean")),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let (l, r) = (type_of(lhs)?, type_of(rhs)?);
            if op.is_arithmetic() || op.is_comparison() {
                if l != Ty::Int || r != Ty::Int {
                    return Err(ill_typed(expr, "operands must be numbers"));
                }
                Ok(if op.is_comparison() { Ty::Bool } else { Ty::Int })
            } else {
                if l != Ty::Bool || r != Ty::Bool {
                    return Err(ill_typed(expr, "operands must be booleans"));
                }
                Ok(Ty::Bool)
            }
        }
    }
}

impl CompiledExpr {
    /// Evaluate with `value_of` reading each slot. Missing values, division by
    /// zero and overflow all yield `false`.
    pub fn holds<F>(&self, value_of: &F) -> bool
    where
        F: Fn(usize) -> Option<i64>,
    {
        matches!(self.eval(value_of), Some(Scalar::Bool(true)))
    }

    fn eval<F>(&self, value_of: &F) -> Option<Scalar>
    where
        F: Fn(usize) -> Option<i64>,
    {
        match self {
            CompiledExpr::Int(n) => Some(Scalar::Int(*n)),
            CompiledExpr::Slot(s) => value_of(*s).map(Scalar::Int),
            CompiledExpr::Unary { op, arg } => match (op, arg.eval(value_of)?) {
                (UnaryOp::Neg, Scalar::Int(n)) => n.checked_neg().map(Scalar::Int),
                (UnaryOp::Not, Scalar::Bool(b)) => Some(Scalar::Bool(!b)),
                _ => None,
            },
            CompiledExpr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(value_of)?;
                let r = rhs.eval(value_of)?;
                match (l, r) {
                    (Scalar::Int(a), Scalar::Int(b)) => int_op(*op, a, b),
                    (Scalar::Bool(a), Scalar::Bool(b)) => match op {
                        BinaryOp::And => Some(Scalar::Bool(a && b)),
                        BinaryOp::Or => Some(Scalar::Bool(a || b)),
                        _ => None,
                    },
                    _ => None,
                }
            }
        }
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Option<Scalar> {
    let out = match op {
        BinaryOp::Add => Scalar::Int(a.checked_add(b)?),
        BinaryOp::Sub => Scalar::Int(a.checked_sub(b)?),
        BinaryOp::Mul => Scalar::Int(a.checked_mul(b)?),
        BinaryOp::Div => Scalar::Int(a.checked_div(b)?),
        BinaryOp::Rem => Scalar::Int(a.checked_rem(b)?),
        BinaryOp::Eq => Scalar::Bool(a == b),
        BinaryOp::Ne => Scalar::Bool(a != b),
        BinaryOp::Lt => Scalar::Bool(a < b),
        BinaryOp::Le => Scalar::Bool(a <= b),
        BinaryOp::Gt => Scalar::Bool(a > b),
        BinaryOp::Ge => Scalar::Bool(a >= b),
        BinaryOp::And | BinaryOp::Or => return None,
    };
    Some(out)
}
