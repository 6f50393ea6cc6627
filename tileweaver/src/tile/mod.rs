//! Tile addressing and tiling schemes.
//!
//! A [`TileAddress`] names one cache/generation unit: the API, the
//! contributing collection (or none for a multi-collection tile), the
//! tiling scheme, and the level/row/col position. [`TileMatrixSet`]
//! supplies the geometry of the tiling scheme: tile bounding boxes and
//! bbox-to-tile-range conversion.

mod matrix;

pub use matrix::{TileMatrixError, TileMatrixSet, TileRange};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Layer name used for tiles that merge all collections of an API.
pub const DATASET_LAYER: &str = "__all__";

/// Identifies one tile in one tiling scheme of one API.
///
/// Equality is structural; the type is immutable after construction and
/// usable as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileAddress {
    api_id: String,
    collection_id: Option<String>,
    tile_matrix_set_id: String,
    level: u8,
    row: u32,
    col: u32,
}

impl TileAddress {
    /// Creates the address of a single-collection tile.
    ///
    /// # Arguments
    ///
    /// * `api_id` - The owning API
    /// * `collection_id` - The contributing collection
    /// * `tile_matrix_set_id` - The tiling scheme identifier
    /// * `level` - Zoom level within the scheme
    /// * `row` - Tile row, increasing southward
    /// * `col` - Tile column, increasing eastward
    pub fn for_collection(
        api_id: impl Into<String>,
        collection_id: impl Into<String>,
        tile_matrix_set_id: impl Into<String>,
        level: u8,
        row: u32,
        col: u32,
    ) -> Self {
        Self {
            api_id: api_id.into(),
            collection_id: Some(collection_id.into()),
            tile_matrix_set_id: tile_matrix_set_id.into(),
            level,
            row,
            col,
        }
    }

    /// Creates the address of a multi-collection (dataset) tile.
    pub fn for_dataset(
        api_id: impl Into<String>,
        tile_matrix_set_id: impl Into<String>,
        level: u8,
        row: u32,
        col: u32,
    ) -> Self {
        Self {
            api_id: api_id.into(),
            collection_id: None,
            tile_matrix_set_id: tile_matrix_set_id.into(),
            level,
            row,
            col,
        }
    }

    /// The owning API.
    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    /// The contributing collection, or `None` for a dataset tile.
    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }

    /// The layer directory name: the collection id, or [`DATASET_LAYER`].
    pub fn layer_id(&self) -> &str {
        self.collection_id.as_deref().unwrap_or(DATASET_LAYER)
    }

    /// The tiling scheme identifier.
    pub fn tile_matrix_set_id(&self) -> &str {
        &self.tile_matrix_set_id
    }

    /// Zoom level within the tiling scheme.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Tile row, increasing southward.
    pub fn row(&self) -> u32 {
        self.row
    }

    /// Tile column, increasing eastward.
    pub fn col(&self) -> u32 {
        self.col
    }

    /// Returns the same position addressed for a different collection.
    pub fn with_collection(&self, collection_id: impl Into<String>) -> Self {
        Self {
            api_id: self.api_id.clone(),
            collection_id: Some(collection_id.into()),
            tile_matrix_set_id: self.tile_matrix_set_id.clone(),
            level: self.level,
            row: self.row,
            col: self.col,
        }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.api_id,
            self.layer_id(),
            self.tile_matrix_set_id,
            self.level,
            self.row,
            self.col
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_address() {
        let addr = TileAddress::for_collection("demo", "roads", "WebMercatorQuad", 10, 5, 8);
        assert_eq!(addr.api_id(), "demo");
        assert_eq!(addr.collection_id(), Some("roads"));
        assert_eq!(addr.layer_id(), "roads");
        assert_eq!(addr.level(), 10);
    }

    #[test]
    fn test_dataset_address_layer() {
        let addr = TileAddress::for_dataset("demo", "WebMercatorQuad", 3, 1, 2);
        assert_eq!(addr.collection_id(), None);
        assert_eq!(addr.layer_id(), DATASET_LAYER);
    }

    #[test]
    fn test_display_form() {
        let addr = TileAddress::for_collection("demo", "roads", "WebMercatorQuad", 10, 5, 8);
        assert_eq!(format!("{}", addr), "demo/roads/WebMercatorQuad/10/5/8");
    }

    #[test]
    fn test_structural_equality() {
        let a = TileAddress::for_collection("demo", "roads", "WebMercatorQuad", 10, 5, 8);
        let b = TileAddress::for_collection("demo", "roads", "WebMercatorQuad", 10, 5, 8);
        let c = a.with_collection("buildings");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.collection_id(), Some("buildings"));
    }
}
