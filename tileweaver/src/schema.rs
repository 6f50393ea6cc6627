//! Collection schema model.
//!
//! The schema subset the filter machinery needs from a collection: which
//! property is the primary geometry, and whether the primary temporal
//! property is a single instant or a start/end interval pair. The full
//! schema lives with the feature provider; a [`SchemaSource`] hands this
//! projection to the tile query builder per collection.

use serde::{Deserialize, Serialize};

/// Temporal shape of a collection's primary temporal property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalSchema {
    /// One instant-valued property.
    Instant(String),
    /// A start/end property pair forming an interval.
    Interval { start: String, end: String },
}

/// Filter-relevant schema of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    primary_geometry: Option<String>,
    primary_temporal: Option<TemporalSchema>,
}

impl CollectionSchema {
    /// Creates an empty schema with no primary properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary geometry property path.
    pub fn with_primary_geometry(mut self, path: impl Into<String>) -> Self {
        self.primary_geometry = Some(path.into());
        self
    }

    /// Sets an instant-valued primary temporal property.
    pub fn with_primary_instant(mut self, path: impl Into<String>) -> Self {
        self.primary_temporal = Some(TemporalSchema::Instant(path.into()));
        self
    }

    /// Sets an interval-valued primary temporal property pair.
    pub fn with_primary_interval(
        mut self,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        self.primary_temporal = Some(TemporalSchema::Interval {
            start: start.into(),
            end: end.into(),
        });
        self
    }

    /// The primary geometry property path, if the schema declares one.
    pub fn primary_geometry(&self) -> Option<&str> {
        self.primary_geometry.as_deref()
    }

    /// The primary temporal property, if the schema declares one.
    pub fn primary_temporal(&self) -> Option<&TemporalSchema> {
        self.primary_temporal.as_ref()
    }
}

/// Source of collection schemas.
///
/// Implemented by the configuration/provider layer outside this crate;
/// lookups are expected to be in-memory and cheap.
pub trait SchemaSource: Send + Sync {
    /// Returns the filter-relevant schema of a collection, or `None` when
    /// the collection is unknown.
    fn schema(&self, collection_id: &str) -> Option<CollectionSchema>;
}
