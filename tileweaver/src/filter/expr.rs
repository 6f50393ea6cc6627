//! Filter expression trees.
//!
//! A [`FilterExpression`] is the compiled form of every filter a request
//! can carry: spatial, temporal, textual, attribute comparisons, and
//! boolean combinations. Trees are built once per request and never
//! mutated; concurrent readers need no synchronization.
//!
//! The `Display` impl renders the SQL-like text form, which is what log
//! output and error messages show.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::geo::BoundingBox;

/// Separator joining the start/end paths of an interval field.
pub const DATETIME_INTERVAL_SEPARATOR: &str = "/";

/// A scalar literal value in a comparison or membership test.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(true) => write!(f, "TRUE"),
            Self::Bool(false) => write!(f, "FALSE"),
        }
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl ComparisonOp {
    /// The text-grammar spelling of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "<>",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Gte => ">=",
        }
    }
}

/// Errors from parsing temporal request values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemporalParseError {
    /// Not a timestamp, date, `now`, or interval.
    #[error("'{0}' is neither an RFC 3339 timestamp nor an interval")]
    Unparseable(String),

    /// Interval whose start lies after its end.
    #[error("interval start {start} is after its end {end}")]
    StartAfterEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// A temporal literal: an instant, the symbolic `now`, or an interval
/// with optionally open sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporalValue {
    Instant(DateTime<Utc>),
    /// Resolved to the evaluation time by the feature provider.
    Now,
    Interval {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

impl TemporalValue {
    /// Whether this value is an interval (as opposed to a single instant).
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::Interval { .. })
    }

    /// Whether this is the fully open interval `../..`, which matches
    /// every feature and therefore compiles to no predicate at all.
    pub fn is_unbounded(&self) -> bool {
        matches!(
            self,
            Self::Interval {
                start: None,
                end: None
            }
        )
    }

    /// Parses a `datetime` request value.
    ///
    /// Accepts an RFC 3339 timestamp, a plain date (midnight UTC), the
    /// literal `now`, or an interval `a/b` where either side may be `..`
    /// or empty to leave it open.
    pub fn parse(input: &str) -> Result<Self, TemporalParseError> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(Self::Now);
        }
        if let Some((a, b)) = trimmed.split_once('/') {
            let start = Self::parse_open_side(a)?;
            let end = Self::parse_open_side(b)?;
            if let (Some(s), Some(e)) = (start, end) {
                if s > e {
                    return Err(TemporalParseError::StartAfterEnd { start: s, end: e });
                }
            }
            return Ok(Self::Interval { start, end });
        }
        Ok(Self::Instant(Self::parse_instant(trimmed)?))
    }

    fn parse_open_side(side: &str) -> Result<Option<DateTime<Utc>>, TemporalParseError> {
        let side = side.trim();
        if side.is_empty() || side == ".." {
            return Ok(None);
        }
        Self::parse_instant(side).map(Some)
    }

    fn parse_instant(value: &str) -> Result<DateTime<Utc>, TemporalParseError> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Ok(ts.with_timezone(&Utc));
        }
        // A plain date is the start of that day in UTC
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            if let Some(ts) = date.and_hms_opt(0, 0, 0) {
                return Ok(ts.and_utc());
            }
        }
        Err(TemporalParseError::Unparseable(value.to_string()))
    }
}

impl fmt::Display for TemporalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |s: &Option<DateTime<Utc>>| match s {
            Some(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            None => "..".to_string(),
        };
        match self {
            Self::Instant(ts) => write!(f, "{}", ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            Self::Now => write!(f, "now"),
            Self::Interval { start, end } => write!(f, "{}/{}", side(start), side(end)),
        }
    }
}

/// The temporal operand of an `any-interacts` test: a single instant
/// property, or a start/end property pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporalOperand {
    Instant(String),
    Interval { start: String, end: String },
}

impl TemporalOperand {
    /// Builds the operand from a resolved datetime field path, splitting
    /// an interval-joined path into its start/end pair.
    pub fn from_path(path: &str) -> Self {
        match path.split_once(DATETIME_INTERVAL_SEPARATOR) {
            Some((start, end)) => Self::Interval {
                start: start.to_string(),
                end: end.to_string(),
            },
            None => Self::Instant(path.to_string()),
        }
    }

    /// Whether the operand is a start/end pair.
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::Interval { .. })
    }
}

impl fmt::Display for TemporalOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(p) => write!(f, "{}", p),
            Self::Interval { start, end } => write!(f, "INTERVAL({},{})", start, end),
        }
    }
}

/// A boolean-valued predicate tree over feature properties.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    /// Conjunction of two or more predicates.
    And(Vec<FilterExpression>),
    /// Disjunction of two or more predicates.
    Or(Vec<FilterExpression>),
    /// Negation.
    Not(Box<FilterExpression>),
    /// Scalar comparison against a literal.
    Comparison {
        op: ComparisonOp,
        property: String,
        value: Literal,
    },
    /// Pattern match; `wildcard` is the character standing for "any
    /// sequence" in the pattern (`%` in the text grammar, `*` in
    /// attribute parameters).
    Like {
        property: String,
        pattern: String,
        wildcard: char,
    },
    /// Membership in a literal list.
    In {
        property: String,
        values: Vec<Literal>,
    },
    /// Spatial intersection with an envelope.
    SIntersects {
        property: String,
        envelope: BoundingBox,
    },
    /// Temporal interaction (overlap in any form) with a temporal value.
    TAnyInteracts {
        operand: TemporalOperand,
        value: TemporalValue,
    },
    /// Temporal equality with a temporal value.
    TEquals {
        property: String,
        value: TemporalValue,
    },
}

impl FilterExpression {
    /// Combines predicates with AND, collapsing the trivial cases:
    /// an empty list yields `None` and a single predicate is returned
    /// without a wrapper.
    pub fn and(mut predicates: Vec<FilterExpression>) -> Option<FilterExpression> {
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(FilterExpression::And(predicates)),
        }
    }

    /// Combines predicates with OR, with the same collapsing rules as
    /// [`FilterExpression::and`].
    pub fn or(mut predicates: Vec<FilterExpression>) -> Option<FilterExpression> {
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(FilterExpression::Or(predicates)),
        }
    }

    /// Collects every property name the tree references, in sorted order.
    ///
    /// Used to validate explicit filters against the filterable fields of
    /// a collection.
    pub fn referenced_properties(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::And(parts) | Self::Or(parts) => {
                for part in parts {
                    part.collect_properties(out);
                }
            }
            Self::Not(inner) => inner.collect_properties(out),
            Self::Comparison { property, .. }
            | Self::Like { property, .. }
            | Self::In { property, .. }
            | Self::SIntersects { property, .. }
            | Self::TEquals { property, .. } => {
                out.insert(property);
            }
            Self::TAnyInteracts { operand, .. } => match operand {
                TemporalOperand::Instant(p) => {
                    out.insert(p);
                }
                TemporalOperand::Interval { start, end } => {
                    out.insert(start);
                    out.insert(end);
                }
            },
        }
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(parts) => write_joined(f, parts, " AND "),
            Self::Or(parts) => write_joined(f, parts, " OR "),
            Self::Not(inner) => write!(f, "NOT ({})", inner),
            Self::Comparison {
                op,
                property,
                value,
            } => write!(f, "{} {} {}", property, op.as_str(), value),
            Self::Like {
                property, pattern, ..
            } => write!(f, "{} LIKE '{}'", property, pattern.replace('\'', "''")),
            Self::In { property, values } => {
                write!(f, "{} IN (", property)?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, ")")
            }
            Self::SIntersects { property, envelope } => write!(
                f,
                "INTERSECTS({}, ENVELOPE({},{},{},{}))",
                property, envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y
            ),
            Self::TAnyInteracts { operand, value } => {
                write!(f, "{} ANYINTERACTS {}", operand, value)
            }
            Self::TEquals { property, value } => write!(f, "{} TEQUALS {}", property, value),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    parts: &[FilterExpression],
    sep: &str,
) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", part)?;
    }
    write!(f, ")")
}
