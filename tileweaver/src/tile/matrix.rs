//! Tile matrix set geometry.
//!
//! A tile matrix set is a quad pyramid over a fixed CRS extent: each
//! level doubles the grid of the previous one, starting from a
//! configurable level-0 grid (1×1 for `WebMercatorQuad`, 2×1 for
//! `WorldCRS84Quad`). The math here converts between tile positions and
//! bounding boxes; it is the basis for spatial predicates on tile
//! queries and for bbox-scoped cache invalidation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{BoundingBox, Crs};

/// Web Mercator half-extent in metres (EPSG 3857).
const WEB_MERCATOR_MAX: f64 = 20_037_508.342_789_244;

/// MVT coordinate space per tile axis.
const DEFAULT_TILE_EXTENT: u32 = 4096;

/// Deepest level supported by the built-in schemes.
const DEFAULT_MAX_LEVEL: u8 = 24;

/// Errors from tile matrix set math.
#[derive(Debug, Error)]
pub enum TileMatrixError {
    /// Level beyond the deepest level of the scheme.
    #[error("Level {level} exceeds maximum level {max} of tile matrix set '{tile_matrix_set}'")]
    LevelOutOfRange {
        tile_matrix_set: String,
        level: u8,
        max: u8,
    },

    /// Row or column outside the grid at the given level.
    #[error("Tile {row}/{col} outside the {rows}x{cols} grid of '{tile_matrix_set}' at level {level}")]
    AddressOutOfRange {
        tile_matrix_set: String,
        level: u8,
        row: u32,
        col: u32,
        rows: u32,
        cols: u32,
    },

    /// Bounding box given in a different CRS than the scheme uses.
    #[error("Bounding box CRS {given} does not match tile matrix set CRS {expected}")]
    CrsMismatch { given: Crs, expected: Crs },
}

/// An inclusive rectangle of tile positions at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub level: u8,
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: u32,
    pub max_col: u32,
}

impl TileRange {
    /// Whether the given position falls inside this range.
    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.min_row..=self.max_row).contains(&row) && (self.min_col..=self.max_col).contains(&col)
    }

    /// Number of tiles covered by the range.
    pub fn count(&self) -> u64 {
        let rows = (self.max_row - self.min_row + 1) as u64;
        let cols = (self.max_col - self.min_col + 1) as u64;
        rows * cols
    }
}

/// A quad-pyramid tiling scheme over a fixed CRS extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMatrixSet {
    id: String,
    crs: Crs,
    bounds: BoundingBox,
    level0_cols: u32,
    level0_rows: u32,
    max_level: u8,
    tile_extent: u32,
}

impl TileMatrixSet {
    /// The standard Web Mercator quad scheme (EPSG 3857, 1×1 at level 0).
    pub fn web_mercator_quad() -> Self {
        Self {
            id: "WebMercatorQuad".to_string(),
            crs: Crs::WEB_MERCATOR,
            bounds: BoundingBox::new(
                -WEB_MERCATOR_MAX,
                -WEB_MERCATOR_MAX,
                WEB_MERCATOR_MAX,
                WEB_MERCATOR_MAX,
                Crs::WEB_MERCATOR,
            ),
            level0_cols: 1,
            level0_rows: 1,
            max_level: DEFAULT_MAX_LEVEL,
            tile_extent: DEFAULT_TILE_EXTENT,
        }
    }

    /// The world CRS84 quad scheme (lon/lat, 2×1 at level 0).
    pub fn world_crs84_quad() -> Self {
        Self {
            id: "WorldCRS84Quad".to_string(),
            crs: Crs::CRS84,
            bounds: BoundingBox::new(-180.0, -90.0, 180.0, 90.0, Crs::CRS84),
            level0_cols: 2,
            level0_rows: 1,
            max_level: DEFAULT_MAX_LEVEL,
            tile_extent: DEFAULT_TILE_EXTENT,
        }
    }

    /// Creates a custom quad scheme.
    ///
    /// # Arguments
    ///
    /// * `id` - Scheme identifier used in tile addresses
    /// * `bounds` - Full extent of the scheme, in the CRS it carries
    /// * `level0_cols` - Grid columns at level 0
    /// * `level0_rows` - Grid rows at level 0
    /// * `max_level` - Deepest level of the pyramid
    pub fn new(
        id: impl Into<String>,
        bounds: BoundingBox,
        level0_cols: u32,
        level0_rows: u32,
        max_level: u8,
    ) -> Self {
        Self {
            id: id.into(),
            crs: bounds.crs,
            bounds,
            level0_cols,
            level0_rows,
            max_level,
            tile_extent: DEFAULT_TILE_EXTENT,
        }
    }

    /// Overrides the MVT coordinate space per tile.
    pub fn with_tile_extent(mut self, tile_extent: u32) -> Self {
        self.tile_extent = tile_extent;
        self
    }

    /// Scheme identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// CRS of the scheme.
    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Full extent of the scheme.
    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// MVT coordinate space per tile axis.
    pub fn tile_extent(&self) -> u32 {
        self.tile_extent
    }

    /// Deepest level of the pyramid.
    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Grid columns at a level.
    pub fn cols_at(&self, level: u8) -> u32 {
        self.level0_cols << level
    }

    /// Grid rows at a level.
    pub fn rows_at(&self, level: u8) -> u32 {
        self.level0_rows << level
    }

    fn check_level(&self, level: u8) -> Result<(), TileMatrixError> {
        if level > self.max_level {
            return Err(TileMatrixError::LevelOutOfRange {
                tile_matrix_set: self.id.clone(),
                level,
                max: self.max_level,
            });
        }
        Ok(())
    }

    /// Computes the bounding box of one tile, in the scheme's CRS.
    ///
    /// Row 0 is the northernmost row; the returned box is the tile's
    /// exact extent with no buffer.
    pub fn tile_bounds(&self, level: u8, row: u32, col: u32) -> Result<BoundingBox, TileMatrixError> {
        self.check_level(level)?;
        let rows = self.rows_at(level);
        let cols = self.cols_at(level);
        if row >= rows || col >= cols {
            return Err(TileMatrixError::AddressOutOfRange {
                tile_matrix_set: self.id.clone(),
                level,
                row,
                col,
                rows,
                cols,
            });
        }

        let span_x = self.bounds.width() / cols as f64;
        let span_y = self.bounds.height() / rows as f64;
        let min_x = self.bounds.min_x + col as f64 * span_x;
        let max_y = self.bounds.max_y - row as f64 * span_y;

        Ok(BoundingBox::new(
            min_x,
            max_y - span_y,
            min_x + span_x,
            max_y,
            self.crs,
        ))
    }

    /// Computes the range of tiles intersecting a bounding box.
    ///
    /// The box must be in the scheme's CRS. Returns `None` when the box
    /// lies entirely outside the scheme's extent.
    pub fn tile_range(
        &self,
        level: u8,
        bbox: &BoundingBox,
    ) -> Result<Option<TileRange>, TileMatrixError> {
        self.check_level(level)?;
        if bbox.crs != self.crs {
            return Err(TileMatrixError::CrsMismatch {
                given: bbox.crs,
                expected: self.crs,
            });
        }
        if bbox.max_x <= self.bounds.min_x
            || bbox.min_x >= self.bounds.max_x
            || bbox.max_y <= self.bounds.min_y
            || bbox.min_y >= self.bounds.max_y
        {
            return Ok(None);
        }

        let rows = self.rows_at(level);
        let cols = self.cols_at(level);
        let span_x = self.bounds.width() / cols as f64;
        let span_y = self.bounds.height() / rows as f64;

        let clamp = |raw: f64, max: u32| -> u32 { (raw.floor().max(0.0) as u32).min(max - 1) };

        let min_col = clamp((bbox.min_x - self.bounds.min_x) / span_x, cols);
        let max_col = clamp((bbox.max_x - self.bounds.min_x) / span_x, cols);
        let min_row = clamp((self.bounds.max_y - bbox.max_y) / span_y, rows);
        let max_row = clamp((self.bounds.max_y - bbox.min_y) / span_y, rows);

        Ok(Some(TileRange {
            level,
            min_row,
            max_row,
            min_col,
            max_col,
        }))
    }
}
