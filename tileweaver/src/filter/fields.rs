//! Filterable-field resolution.
//!
//! Maps externally visible filter parameter names to property paths in
//! a collection's feature schema. The two well-known names `bbox` and
//! `datetime` are always present; when the schema lacks a primary
//! geometry or temporal property they resolve to
//! [`FieldMapping::NotAvailable`], which downstream predicate builders
//! treat as "skip silently".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::filter::expr::DATETIME_INTERVAL_SEPARATOR;
use crate::schema::{CollectionSchema, TemporalSchema};

/// Well-known name of the spatial filter parameter.
pub const FIELD_BBOX: &str = "bbox";
/// Well-known name of the temporal filter parameter.
pub const FIELD_DATETIME: &str = "datetime";

/// Where a filterable field points in the feature schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldMapping {
    /// Resolves to a concrete property path.
    Path(String),
    /// Declared but unusable for this collection.
    NotAvailable,
}

impl FieldMapping {
    /// The property path, or `None` for [`FieldMapping::NotAvailable`].
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Path(path) => Some(path),
            Self::NotAvailable => None,
        }
    }
}

/// The resolved filterable fields of one collection.
///
/// Iteration order is the sorted field name order, so predicate
/// assembly over these fields is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterableFields {
    fields: BTreeMap<String, FieldMapping>,
}

impl FilterableFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a single field mapping.
    pub fn with_field(mut self, name: impl Into<String>, mapping: FieldMapping) -> Self {
        self.fields.insert(name.into(), mapping);
        self
    }

    /// Resolves the filterable fields for one collection.
    ///
    /// Starts from the statically configured mappings, then derives the
    /// well-known `bbox` and `datetime` entries from the schema. The
    /// derived entries win over configured ones of the same name: the
    /// schema is authoritative for the primary geometry and temporal
    /// properties.
    ///
    /// # Arguments
    ///
    /// * `schema` - The collection's feature schema
    /// * `configured` - Statically configured attribute mappings
    pub fn for_collection(
        schema: &CollectionSchema,
        configured: &BTreeMap<String, FieldMapping>,
    ) -> Self {
        let mut fields = configured.clone();

        let bbox = match schema.primary_geometry() {
            Some(path) => FieldMapping::Path(path.to_string()),
            None => FieldMapping::NotAvailable,
        };
        fields.insert(FIELD_BBOX.to_string(), bbox);

        let datetime = match schema.primary_temporal() {
            Some(TemporalSchema::Instant(path)) => FieldMapping::Path(path.clone()),
            Some(TemporalSchema::Interval { start, end }) => FieldMapping::Path(format!(
                "{}{}{}",
                start, DATETIME_INTERVAL_SEPARATOR, end
            )),
            None => FieldMapping::NotAvailable,
        };
        fields.insert(FIELD_DATETIME.to_string(), datetime);

        Self { fields }
    }

    /// The mapping for `name`, if the field is declared at all.
    pub fn get(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.get(name)
    }

    /// The resolved property path for `name`.
    ///
    /// `None` when the field is undeclared or not available.
    pub fn path(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldMapping::path)
    }

    /// Whether `name` is declared, regardless of availability.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Whether `name` is declared and resolves to a property path.
    pub fn is_resolvable(&self, name: &str) -> bool {
        self.path(name).is_some()
    }

    /// Declared field names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
