//! Tile query construction.
//!
//! [`TileQueryBuilder`] turns a tile address plus raw query parameters
//! into a [`FeatureQuery`] against the collection's feature source.
//! The builder owns a cache of resolved filterable fields keyed by API
//! id and configuration version, so schema resolution does not run on
//! every tile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::filter::{
    parse_text, FieldMapping, FilterExpression, FilterLanguage, FilterParseError,
    FilterableFields, PredicateCompiler, ValidationError, PARAM_FILTER,
};
use crate::geo::{BoundingBox, Crs, CrsUnit};
use crate::query::rules::ZoomRules;
use crate::schema::SchemaSource;
use crate::tile::{TileAddress, TileMatrixError, TileMatrixSet};

/// Default cap on features returned per tile query.
pub const DEFAULT_FEATURE_LIMIT: u32 = 100_000;
/// Smallest accepted feature limit.
pub const MIN_FEATURE_LIMIT: u32 = 1;
/// Largest accepted feature limit.
pub const MAX_FEATURE_LIMIT: u32 = 10_000_000;

/// Supplies the spatial extent of a collection, transformed to a
/// target CRS.
///
/// `Ok(None)` means the collection has no declared extent; the tile
/// bounds are then used unclipped.
pub trait ExtentProvider: Send + Sync {
    fn spatial_extent(
        &self,
        collection_id: &str,
        crs: Crs,
    ) -> Result<Option<BoundingBox>, ExtentError>;
}

/// An extent lookup or transformation failed.
///
/// Extent failures are never fatal for query construction; the caller
/// falls back to the untransformed tile bounds.
#[derive(Debug, Error)]
pub enum ExtentError {
    #[error("the spatial extent could not be transformed to {crs}: {reason}")]
    Transform { crs: Crs, reason: String },

    #[error("the extent source failed: {0}")]
    Source(String),
}

/// A fully assembled feature query for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureQuery {
    /// Feature type to query, usually the collection id.
    pub feature_type: String,
    /// Combined predicate, `None` when nothing constrains the query
    /// beyond the feature type.
    pub filter: Option<FilterExpression>,
    /// Properties to select; empty means all.
    pub properties: Vec<String>,
    /// Maximum number of features to return.
    pub limit: u32,
    /// Number of features to skip.
    pub offset: u32,
    /// CRS the geometries are requested in.
    pub crs: Crs,
    /// Decimal places to round coordinates to, when configured for the
    /// CRS unit.
    pub coordinate_precision: Option<u32>,
}

/// Tuning knobs for tile feature queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileQueryConfig {
    limit: u32,
    feature_type: Option<String>,
    filter_parameters: HashSet<String>,
    coordinate_precision: BTreeMap<String, u32>,
    field_mappings: BTreeMap<String, BTreeMap<String, FieldMapping>>,
}

impl Default for TileQueryConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_FEATURE_LIMIT,
            feature_type: None,
            filter_parameters: [PARAM_FILTER.to_string()].into_iter().collect(),
            coordinate_precision: BTreeMap::new(),
            field_mappings: BTreeMap::new(),
        }
    }
}

impl TileQueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the feature limit, clamped to the accepted range.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(MIN_FEATURE_LIMIT, MAX_FEATURE_LIMIT);
        self
    }

    /// Overrides the feature type; by default the collection id is
    /// queried.
    pub fn with_feature_type(mut self, feature_type: impl Into<String>) -> Self {
        self.feature_type = Some(feature_type.into());
        self
    }

    /// Declares an additional parameter name carrying explicit filter
    /// expressions. `filter` is always declared.
    pub fn with_filter_parameter(mut self, name: impl Into<String>) -> Self {
        self.filter_parameters.insert(name.into());
        self
    }

    /// Sets the coordinate precision for one CRS unit name, e.g.
    /// `meter` or `degree`.
    pub fn with_coordinate_precision(mut self, unit: impl Into<String>, decimals: u32) -> Self {
        self.coordinate_precision.insert(unit.into(), decimals);
        self
    }

    /// Sets the statically configured filterable fields of one
    /// collection.
    pub fn with_field_mappings(
        mut self,
        collection_id: impl Into<String>,
        mappings: BTreeMap<String, FieldMapping>,
    ) -> Self {
        self.field_mappings.insert(collection_id.into(), mappings);
        self
    }

    fn precision_for(&self, unit: CrsUnit) -> Option<u32> {
        match unit {
            CrsUnit::Metre => self
                .coordinate_precision
                .get("meter")
                .or_else(|| self.coordinate_precision.get("metre"))
                .copied(),
            CrsUnit::Degree => self.coordinate_precision.get("degree").copied(),
            CrsUnit::Unknown => None,
        }
    }
}

/// A tile query could not be built.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Matrix(#[from] TileMatrixError),

    #[error("the predefined filter for level {level} is invalid: {source}")]
    PredefinedFilter {
        level: u8,
        #[source]
        source: FilterParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldsCacheKey {
    api_id: String,
    api_version: u64,
    collection_id: String,
}

/// Builds feature queries for tile requests.
pub struct TileQueryBuilder {
    schemas: Arc<dyn SchemaSource>,
    extents: Arc<dyn ExtentProvider>,
    compiler: PredicateCompiler,
    config: TileQueryConfig,
    fields_cache: DashMap<FieldsCacheKey, Arc<FilterableFields>>,
}

impl TileQueryBuilder {
    /// Creates a builder with a default predicate compiler.
    ///
    /// # Arguments
    ///
    /// * `schemas` - Source of collection feature schemas
    /// * `extents` - Source of collection spatial extents
    /// * `config` - Query tuning knobs
    pub fn new(
        schemas: Arc<dyn SchemaSource>,
        extents: Arc<dyn ExtentProvider>,
        config: TileQueryConfig,
    ) -> Self {
        Self {
            schemas,
            extents,
            compiler: PredicateCompiler::new(),
            config,
            fields_cache: DashMap::new(),
        }
    }

    /// Replaces the predicate compiler, for deployments with custom
    /// parameter families or text search fields.
    pub fn with_compiler(mut self, compiler: PredicateCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// Drops all cached field resolutions of one API, typically after
    /// its configuration changed.
    pub fn invalidate(&self, api_id: &str) {
        self.fields_cache.retain(|key, _| key.api_id != api_id);
    }

    /// The resolved filterable fields for one collection, cached per
    /// API id and configuration version.
    pub fn filterable_fields(
        &self,
        api_id: &str,
        api_version: u64,
        collection_id: &str,
    ) -> Result<Arc<FilterableFields>, ValidationError> {
        let key = FieldsCacheKey {
            api_id: api_id.to_string(),
            api_version,
            collection_id: collection_id.to_string(),
        };
        if let Some(cached) = self.fields_cache.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let schema = self
            .schemas
            .schema(collection_id)
            .ok_or_else(|| ValidationError::UnknownCollection(collection_id.to_string()))?;
        let empty = BTreeMap::new();
        let configured = self
            .config
            .field_mappings
            .get(collection_id)
            .unwrap_or(&empty);
        let fields = Arc::new(FilterableFields::for_collection(&schema, configured));
        self.fields_cache.insert(key, Arc::clone(&fields));
        Ok(fields)
    }

    /// Builds the feature query for one tile.
    ///
    /// The combined predicate ANDs three groups, in order: whatever the
    /// request parameters compiled to, the predefined filter of the
    /// zoom level, and last the spatial predicate for the tile bounds
    /// clipped to the collection extent.
    ///
    /// # Arguments
    ///
    /// * `address` - The tile being queried; must name a collection
    /// * `api_version` - Configuration version, for field caching
    /// * `parameters` - Raw query parameters of the request
    /// * `rules` - Zoom-dependent filter and property rules
    /// * `matrix_set` - The tiling scheme the address refers to
    #[instrument(skip_all, fields(tile = %address))]
    pub fn build_query(
        &self,
        address: &TileAddress,
        api_version: u64,
        parameters: &HashMap<String, String>,
        rules: &ZoomRules,
        matrix_set: &TileMatrixSet,
    ) -> Result<FeatureQuery, QueryError> {
        let collection_id = address
            .collection_id()
            .ok_or(ValidationError::DatasetAddress)?;

        let schema = self
            .schemas
            .schema(collection_id)
            .ok_or_else(|| ValidationError::UnknownCollection(collection_id.to_string()))?;
        let geometry = schema
            .primary_geometry()
            .ok_or_else(|| ValidationError::NotTileable(collection_id.to_string()))?
            .to_string();

        let tile_bounds =
            matrix_set.tile_bounds(address.level(), address.row(), address.col())?;
        let envelope = match self.extents.spatial_extent(collection_id, matrix_set.crs()) {
            Ok(Some(extent)) => tile_bounds.clip(&extent),
            Ok(None) => tile_bounds,
            Err(error) => {
                // Clipping is an optimization, not a correctness
                // requirement; fall back to the full tile bounds.
                debug!(collection = collection_id, %error, "extent lookup failed, using unclipped tile bounds");
                tile_bounds
            }
        };

        let fields = self.filterable_fields(address.api_id(), api_version, collection_id)?;
        let language = FilterLanguage::from_parameters(parameters)?;
        let requested = self.compiler.compile(
            parameters,
            &fields,
            &self.config.filter_parameters,
            language,
        )?;

        let predefined = rules
            .predefined_filter(matrix_set.id(), address.level())
            .map(|text| {
                parse_text(text).map_err(|source| QueryError::PredefinedFilter {
                    level: address.level(),
                    source,
                })
            })
            .transpose()?;

        let spatial = FilterExpression::SIntersects {
            property: geometry,
            envelope,
        };

        let mut parts = Vec::new();
        parts.extend(requested);
        parts.extend(predefined);
        parts.push(spatial);

        let precision = self.config.precision_for(matrix_set.crs().unit());
        if precision.is_none() && matrix_set.crs().unit() == CrsUnit::Unknown {
            debug!(crs = %matrix_set.crs(), "unknown CRS unit, coordinates are not rounded");
        }

        Ok(FeatureQuery {
            feature_type: self
                .config
                .feature_type
                .clone()
                .unwrap_or_else(|| collection_id.to_string()),
            filter: FilterExpression::and(parts),
            properties: rules.properties(matrix_set.id(), address.level()),
            limit: self.config.limit,
            offset: 0,
            crs: matrix_set.crs(),
            coordinate_precision: precision,
        })
    }
}
