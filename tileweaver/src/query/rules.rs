//! Zoom-dependent query rules.
//!
//! Deployments restrict what a tile query selects per zoom level: a
//! predefined filter thins out features at low zoom, and property
//! rules limit which attributes are encoded. Both are declarative
//! configuration keyed by tile matrix set id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An inclusive zoom level range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRange {
    pub min: u8,
    pub max: u8,
}

impl LevelRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    /// Whether `level` falls inside the range. A range with
    /// `min > max` is empty and contains nothing.
    pub fn contains(&self, level: u8) -> bool {
        self.min <= level && level <= self.max
    }
}

/// A filter expression applied to every query within a zoom range.
///
/// The expression uses the text filter grammar. `filter: None`
/// declares the range without constraining it, which matters when a
/// list of rules is searched first-match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedFilter {
    pub range: LevelRange,
    pub filter: Option<String>,
}

impl PredefinedFilter {
    pub fn new(range: LevelRange, filter: impl Into<String>) -> Self {
        Self {
            range,
            filter: Some(filter.into()),
        }
    }

    pub fn unfiltered(range: LevelRange) -> Self {
        Self {
            range,
            filter: None,
        }
    }
}

/// The properties a tile query selects within a zoom range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRule {
    pub range: LevelRange,
    pub properties: Vec<String>,
}

impl PropertyRule {
    pub fn new(range: LevelRange, properties: Vec<String>) -> Self {
        Self { range, properties }
    }
}

/// Per-tiling-scheme filter and property rules for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomRules {
    filters: BTreeMap<String, Vec<PredefinedFilter>>,
    properties: BTreeMap<String, Vec<PropertyRule>>,
}

impl ZoomRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a predefined filter for the given tile matrix set.
    /// Rule order within a set is search order.
    pub fn with_filter(mut self, tile_matrix_set: impl Into<String>, rule: PredefinedFilter) -> Self {
        self.filters
            .entry(tile_matrix_set.into())
            .or_default()
            .push(rule);
        self
    }

    /// Appends a property rule for the given tile matrix set.
    pub fn with_properties(mut self, tile_matrix_set: impl Into<String>, rule: PropertyRule) -> Self {
        self.properties
            .entry(tile_matrix_set.into())
            .or_default()
            .push(rule);
        self
    }

    /// The predefined filter for one zoom level.
    ///
    /// Returns the first rule whose range contains the level and that
    /// actually carries a filter, so a leading unfiltered rule leaves
    /// later levelled rules reachable.
    pub fn predefined_filter(&self, tile_matrix_set: &str, level: u8) -> Option<&str> {
        self.filters
            .get(tile_matrix_set)?
            .iter()
            .find(|rule| rule.range.contains(level) && rule.filter.is_some())
            .and_then(|rule| rule.filter.as_deref())
    }

    /// The properties to select at one zoom level.
    ///
    /// Unions the property lists of every matching rule in rule order,
    /// dropping duplicates. Empty means "no restriction".
    pub fn properties(&self, tile_matrix_set: &str, level: u8) -> Vec<String> {
        let mut selected = Vec::new();
        if let Some(rules) = self.properties.get(tile_matrix_set) {
            for rule in rules.iter().filter(|r| r.range.contains(level)) {
                for property in &rule.properties {
                    if !selected.contains(property) {
                        selected.push(property.clone());
                    }
                }
            }
        }
        selected
    }
}
