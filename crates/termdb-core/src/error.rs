//! Engine errors.
//!
//! Two classes matter to callers:
//! - malformed input (labels, types, variables, conditions): a caller bug,
//!   never retryable;
//! - backend failures: transient, retrying the whole call is safe.

use thiserror::Error;

use crate::model::FactId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown term `{0}`")]
    UnknownTerm(String),

    #[error("term `{0}` is already defined")]
    DuplicateTerm(String),

    #[error("`{name}` is not a {expected}")]
    NotA { name: String, expected: String },

    #[error("label `{label}` is not declared for verb `{verb}`")]
    UndeclaredLabel { verb: String, label: String },

    #[error("label `{label}` is already present")]
    DuplicateLabel { label: String },

    #[error("value `{value}` for label `{label}` is a `{actual}`, expected a `{expected}`")]
    WrongObjectType {
        label: String,
        value: String,
        actual: String,
        expected: String,
    },

    #[error("predicate is not ground: variable `{0}` is unbound")]
    NotGround(String),

    #[error("path `{path}` does not resolve to a value")]
    UnresolvedPath { path: String },

    #[error("condition references unbound variable `{0}`")]
    UnboundConditionVar(String),

    #[error("condition references non-numeric variable `{0}`")]
    NonNumericConditionVar(String),

    #[error("ill-typed condition `{expr}`: {message}")]
    ConditionType { expr: String, message: String },

    #[error("variable `{name}` is used with conflicting types")]
    ConflictingVar { name: String },

    #[error("unknown fact {0}")]
    UnknownFact(FactId),

    #[error("fact {0} already exists")]
    FactExists(FactId),

    #[error("syntax error: {0}")]
    Syntax(#[from] termdb_dsl::ParseError),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl Error {
    /// True only for backend failures; malformed facts or patterns never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}
