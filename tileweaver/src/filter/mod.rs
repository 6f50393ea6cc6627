//! Filter predicates and their compilation from query parameters.
//!
//! The module splits into the expression model ([`FilterExpression`]),
//! two parsers for the text and JSON filter grammars, the per-collection
//! field resolution ([`FilterableFields`]) and the parameter compiler
//! ([`PredicateCompiler`]) that turns a raw query parameter map into a
//! single combined predicate.

use thiserror::Error;

mod compiler;
mod expr;
mod fields;
mod json;
mod text;

pub use compiler::{
    CompileContext, FilterLanguage, ParameterPredicateBuilder, PredicateCompiler,
    ValidationError, PARAM_FILTER, PARAM_FILTER_LANG, PARAM_Q,
};
pub use expr::{
    ComparisonOp, FilterExpression, Literal, TemporalOperand, TemporalParseError, TemporalValue,
    DATETIME_INTERVAL_SEPARATOR,
};
pub use fields::{FieldMapping, FilterableFields, FIELD_BBOX, FIELD_DATETIME};
pub use json::parse_json;
pub use text::parse_text;

/// A filter expression failed to parse.
#[derive(Debug, Error, PartialEq)]
pub enum FilterParseError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid interval: the start is after the end")]
    InvalidInterval,

    #[error("expected {expected} but found {found} at position {pos}")]
    Unexpected {
        expected: String,
        found: String,
        pos: usize,
    },

    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(String),

    #[error("trailing input after the expression at position {0}")]
    TrailingInput(usize),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' expects {expected}")]
    BadArguments { op: String, expected: String },
}
