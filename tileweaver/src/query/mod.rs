//! Feature query assembly for tile requests.
//!
//! [`TileQueryBuilder`] is the entry point: it resolves the target
//! collection's filterable fields, compiles the request parameters,
//! applies the zoom-dependent [`ZoomRules`] and emits a
//! [`FeatureQuery`]. The free functions here parse the common paging
//! parameters that arrive alongside the filters.

mod builder;
mod rules;

pub use builder::{
    ExtentError, ExtentProvider, FeatureQuery, QueryError, TileQueryBuilder, TileQueryConfig,
    DEFAULT_FEATURE_LIMIT, MAX_FEATURE_LIMIT, MIN_FEATURE_LIMIT,
};
pub use rules::{LevelRange, PredefinedFilter, PropertyRule, ZoomRules};

use crate::filter::ValidationError;

/// Parses a `limit` parameter against explicit bounds.
///
/// # Arguments
///
/// * `value` - The raw parameter value, absent means the default
/// * `minimum` - Smallest accepted value
/// * `default_value` - Used when the parameter is absent
/// * `maximum` - Largest accepted value
pub fn parse_limit(
    value: Option<&str>,
    minimum: u32,
    default_value: u32,
    maximum: u32,
) -> Result<u32, ValidationError> {
    let Some(raw) = value else {
        return Ok(default_value);
    };
    let parsed = parse_integer("limit", raw)?;
    check_bounds("limit", parsed, minimum as i64, maximum as i64)?;
    Ok(parsed as u32)
}

/// Parses an `offset` parameter; absent means zero.
pub fn parse_offset(value: Option<&str>) -> Result<u32, ValidationError> {
    let Some(raw) = value else {
        return Ok(0);
    };
    let parsed = parse_integer("offset", raw)?;
    check_bounds("offset", parsed, 0, u32::MAX as i64)?;
    Ok(parsed as u32)
}

fn parse_integer(parameter: &str, raw: &str) -> Result<i64, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| ValidationError::NotAnInteger {
            parameter: parameter.to_string(),
            value: raw.to_string(),
        })
}

fn check_bounds(parameter: &str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min {
        return Err(ValidationError::BelowMinimum {
            parameter: parameter.to_string(),
            min,
            value,
        });
    }
    if value > max {
        return Err(ValidationError::AboveMaximum {
            parameter: parameter.to_string(),
            max,
            value,
        });
    }
    Ok(())
}
