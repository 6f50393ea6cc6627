//! Query parameter to predicate compilation.
//!
//! The compiler walks an unordered map of query parameters through a
//! fixed list of [`ParameterPredicateBuilder`] strategies and combines
//! everything they produce into a single AND predicate. Strategies run
//! in a fixed precedence order and each strategy sees its recognized
//! keys in sorted order, so the same parameters always compile to the
//! same tree regardless of map iteration order.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::filter::expr::{
    ComparisonOp, FilterExpression, Literal, TemporalOperand, TemporalValue,
};
use crate::filter::fields::{FilterableFields, FIELD_BBOX, FIELD_DATETIME};
use crate::filter::json::parse_json;
use crate::filter::text::parse_text;
use crate::filter::FilterParseError;
use crate::geo::{BoundingBox, Crs, MAX_LAT, MAX_LON, MIN_LAT, MIN_LON};

/// Reserved name of the explicit filter expression parameter.
pub const PARAM_FILTER: &str = "filter";
/// Reserved name of the filter language selector parameter.
pub const PARAM_FILTER_LANG: &str = "filter-lang";
/// Reserved name of the free-text search parameter.
pub const PARAM_Q: &str = "q";

/// A query parameter failed validation.
///
/// These are terminal: a request carrying an invalid parameter is
/// rejected outright, never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("The parameter 'bbox' is invalid: it must have exactly four values, found {0}")]
    BboxValueCount(usize),

    #[error("The parameter 'bbox' is invalid: '{0}' is not a number")]
    BboxNumber(String),

    #[error("The parameter 'bbox' is invalid: unknown coordinate reference system '{0}'")]
    BboxCrs(String),

    #[error("The parameter 'bbox' is invalid: longitude {0} is outside the range [-180, 180]")]
    BboxLongitude(f64),

    #[error("The parameter 'bbox' is invalid: latitude {0} is outside the range [-90, 90]")]
    BboxLatitude(f64),

    #[error(
        "The parameter 'bbox' is invalid: the first latitude {min} is greater than the second latitude {max}"
    )]
    BboxLatitudeOrder { min: f64, max: f64 },

    #[error("Invalid value for query parameter 'datetime': {0}")]
    Datetime(String),

    #[error("Unknown value for query parameter 'filter-lang': '{0}'")]
    FilterLang(String),

    #[error("The parameter '{parameter}' is invalid: {source}")]
    Filter {
        parameter: String,
        #[source]
        source: FilterParseError,
    },

    #[error("Unknown or forbidden properties used: {}", .properties.join(", "))]
    UnknownProperties { properties: Vec<String> },

    #[error("Invalid value for query parameter '{parameter}': '{value}' is not an integer")]
    NotAnInteger { parameter: String, value: String },

    #[error(
        "Invalid value for query parameter '{parameter}': the value must be at least {min}, found {value}"
    )]
    BelowMinimum { parameter: String, min: i64, value: i64 },

    #[error(
        "Invalid value for query parameter '{parameter}': the value must be at most {max}, found {value}"
    )]
    AboveMaximum { parameter: String, max: i64, value: i64 },

    #[error("Collection '{0}' has no primary geometry and cannot be filtered spatially")]
    NotTileable(String),

    #[error("Collection '{0}' is not known")]
    UnknownCollection(String),

    #[error("A dataset tile address cannot be turned into a single-collection query")]
    DatasetAddress,
}

/// Grammar selector for explicit filter parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterLanguage {
    #[default]
    CqlText,
    CqlJson,
}

impl FilterLanguage {
    /// Parses the value of the `filter-lang` parameter.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "cql-text" => Ok(Self::CqlText),
            "cql-json" => Ok(Self::CqlJson),
            other => Err(ValidationError::FilterLang(other.to_string())),
        }
    }

    /// Reads the language selector out of a parameter map, defaulting
    /// to the text grammar when absent.
    pub fn from_parameters(
        parameters: &HashMap<String, String>,
    ) -> Result<Self, ValidationError> {
        match parameters.get(PARAM_FILTER_LANG) {
            Some(value) => Self::parse(value),
            None => Ok(Self::default()),
        }
    }

    fn parse_filter(&self, value: &str) -> Result<FilterExpression, FilterParseError> {
        match self {
            Self::CqlText => parse_text(value),
            Self::CqlJson => parse_json(value),
        }
    }
}

/// Inputs shared by all builders during one compilation.
pub struct CompileContext<'a> {
    /// Resolved filterable fields of the target collection.
    pub fields: &'a FilterableFields,
    /// Names of parameters carrying explicit filter expressions.
    pub filter_parameters: &'a HashSet<String>,
    /// Grammar for explicit filter expressions.
    pub language: FilterLanguage,
    /// Property paths searched by the free-text parameter.
    pub q_fields: &'a [String],
}

/// One parameter family's predicate construction strategy.
///
/// Implementations must be stateless with respect to the compilation:
/// everything request-specific arrives through the context.
pub trait ParameterPredicateBuilder: Send + Sync {
    /// Whether this builder claims the given parameter key.
    fn recognizes(&self, key: &str, ctx: &CompileContext<'_>) -> bool;

    /// Builds the predicate for one claimed parameter.
    ///
    /// `Ok(None)` means the parameter contributes nothing for this
    /// collection, for example because the field it targets is not
    /// available. That is a silent skip, not an error.
    fn build(
        &self,
        key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError>;
}

/// Builds the spatial predicate from the `bbox` parameter.
struct BboxBuilder;

impl ParameterPredicateBuilder for BboxBuilder {
    fn recognizes(&self, key: &str, _ctx: &CompileContext<'_>) -> bool {
        key == FIELD_BBOX
    }

    fn build(
        &self,
        _key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        let Some(geometry) = ctx.fields.path(FIELD_BBOX) else {
            return Ok(None);
        };

        let mut parts: Vec<&str> = value.split(',').map(str::trim).collect();
        let crs = if parts.len() == 5 {
            match parts.pop() {
                Some(raw) => {
                    Crs::parse(raw).ok_or_else(|| ValidationError::BboxCrs(raw.to_string()))?
                }
                None => Crs::CRS84,
            }
        } else {
            Crs::CRS84
        };
        if parts.len() != 4 {
            return Err(ValidationError::BboxValueCount(parts.len()));
        }

        let mut coords = [0.0f64; 4];
        for (slot, raw) in coords.iter_mut().zip(&parts) {
            *slot = raw
                .parse()
                .map_err(|_| ValidationError::BboxNumber(raw.to_string()))?;
        }

        if crs == Crs::CRS84 {
            for lon in [coords[0], coords[2]] {
                if !(MIN_LON..=MAX_LON).contains(&lon) {
                    return Err(ValidationError::BboxLongitude(lon));
                }
            }
            for lat in [coords[1], coords[3]] {
                if !(MIN_LAT..=MAX_LAT).contains(&lat) {
                    return Err(ValidationError::BboxLatitude(lat));
                }
            }
            if coords[1] > coords[3] {
                return Err(ValidationError::BboxLatitudeOrder {
                    min: coords[1],
                    max: coords[3],
                });
            }
            // min_x > max_x stays legal: the box crosses the antimeridian
        }

        Ok(Some(FilterExpression::SIntersects {
            property: geometry.to_string(),
            envelope: BoundingBox::new(coords[0], coords[1], coords[2], coords[3], crs),
        }))
    }
}

/// Builds the temporal predicate from the `datetime` parameter.
struct DatetimeBuilder;

impl ParameterPredicateBuilder for DatetimeBuilder {
    fn recognizes(&self, key: &str, _ctx: &CompileContext<'_>) -> bool {
        key == FIELD_DATETIME
    }

    fn build(
        &self,
        _key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        let Some(path) = ctx.fields.path(FIELD_DATETIME) else {
            return Ok(None);
        };

        let value = TemporalValue::parse(value)
            .map_err(|e| ValidationError::Datetime(e.to_string()))?;
        if value.is_unbounded() {
            // A fully open interval matches everything
            return Ok(None);
        }

        let operand = TemporalOperand::from_path(path);
        Ok(Some(if operand.is_interval() || value.is_interval() {
            FilterExpression::TAnyInteracts { operand, value }
        } else {
            FilterExpression::TEquals {
                property: path.to_string(),
                value,
            }
        }))
    }
}

/// Builds the free-text predicate from the `q` parameter.
struct TextSearchBuilder;

impl ParameterPredicateBuilder for TextSearchBuilder {
    fn recognizes(&self, key: &str, _ctx: &CompileContext<'_>) -> bool {
        key == PARAM_Q
    }

    fn build(
        &self,
        _key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        if ctx.q_fields.is_empty() {
            return Ok(None);
        }
        let terms: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(None);
        }

        let mut predicates = Vec::with_capacity(ctx.q_fields.len() * terms.len());
        for field in ctx.q_fields {
            for term in &terms {
                predicates.push(FilterExpression::Like {
                    property: field.clone(),
                    pattern: format!("%{}%", term),
                    wildcard: '%',
                });
            }
        }
        Ok(FilterExpression::or(predicates))
    }
}

/// Parses and validates explicit filter expression parameters.
struct ExplicitFilterBuilder;

impl ParameterPredicateBuilder for ExplicitFilterBuilder {
    fn recognizes(&self, key: &str, ctx: &CompileContext<'_>) -> bool {
        ctx.filter_parameters.contains(key)
    }

    fn build(
        &self,
        key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        let expr = ctx
            .language
            .parse_filter(value)
            .map_err(|source| ValidationError::Filter {
                parameter: key.to_string(),
                source,
            })?;

        let unknown: Vec<String> = expr
            .referenced_properties()
            .into_iter()
            .filter(|p| !ctx.fields.is_resolvable(p))
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::UnknownProperties {
                properties: unknown,
            });
        }

        Ok(Some(expr))
    }
}

/// Builds equality and wildcard predicates from plain attribute
/// parameters, one per declared filterable field.
struct AttributeBuilder;

impl ParameterPredicateBuilder for AttributeBuilder {
    fn recognizes(&self, key: &str, ctx: &CompileContext<'_>) -> bool {
        ctx.fields.contains(key)
    }

    fn build(
        &self,
        key: &str,
        value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        let Some(path) = ctx.fields.path(key) else {
            return Ok(None);
        };

        Ok(Some(if value.contains('*') {
            FilterExpression::Like {
                property: path.to_string(),
                pattern: value.to_string(),
                wildcard: '*',
            }
        } else {
            FilterExpression::Comparison {
                op: ComparisonOp::Eq,
                property: path.to_string(),
                value: Literal::String(value.to_string()),
            }
        }))
    }
}

/// Compiles query parameters into a single combined predicate.
pub struct PredicateCompiler {
    builders: Vec<Box<dyn ParameterPredicateBuilder>>,
    q_fields: Vec<String>,
}

impl Default for PredicateCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl PredicateCompiler {
    /// Creates a compiler with the standard builders, in precedence
    /// order: bbox, datetime, free-text search, explicit filters,
    /// plain attributes.
    pub fn new() -> Self {
        Self {
            builders: vec![
                Box::new(BboxBuilder),
                Box::new(DatetimeBuilder),
                Box::new(TextSearchBuilder),
                Box::new(ExplicitFilterBuilder),
                Box::new(AttributeBuilder),
            ],
            q_fields: Vec::new(),
        }
    }

    /// Sets the property paths searched by the `q` parameter.
    pub fn with_q_fields(mut self, fields: Vec<String>) -> Self {
        self.q_fields = fields;
        self
    }

    /// Replaces the builder list, for deployments with custom
    /// parameter families. Order is precedence.
    pub fn with_builders(mut self, builders: Vec<Box<dyn ParameterPredicateBuilder>>) -> Self {
        self.builders = builders;
        self
    }

    /// Compiles the given parameters against one collection's fields.
    ///
    /// Each parameter key is claimed by at most one builder; a key no
    /// builder recognizes is ignored, since parameter maps also carry
    /// paging and formatting parameters that are none of our business.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Raw query parameters, unordered
    /// * `fields` - Resolved filterable fields of the collection
    /// * `filter_parameters` - Parameter names carrying explicit filters
    /// * `language` - Grammar for explicit filters
    ///
    /// # Returns
    ///
    /// The combined predicate, or `None` when nothing contributed one.
    pub fn compile(
        &self,
        parameters: &HashMap<String, String>,
        fields: &FilterableFields,
        filter_parameters: &HashSet<String>,
        language: FilterLanguage,
    ) -> Result<Option<FilterExpression>, ValidationError> {
        let ctx = CompileContext {
            fields,
            filter_parameters,
            language,
            q_fields: &self.q_fields,
        };

        // Sorted view makes per-builder key order deterministic
        let sorted: BTreeMap<&str, &str> = parameters
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut predicates = Vec::new();
        for builder in &self.builders {
            for (key, value) in &sorted {
                if claimed.contains(key) || !builder.recognizes(key, &ctx) {
                    continue;
                }
                claimed.insert(key);
                if let Some(expr) = builder.build(key, value, &ctx)? {
                    debug!(parameter = %key, "compiled query parameter into a predicate");
                    predicates.push(expr);
                }
            }
        }

        Ok(FilterExpression::and(predicates))
    }
}
