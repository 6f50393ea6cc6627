//! Tile cache storage.
//!
//! The [`TileStore`] trait is the storage seam of the crate: the
//! compositor, seeders and request handlers all talk to it, while the
//! backends decide where bytes actually live. Two backends ship here,
//! a filesystem store ([`FsTileStore`]) and an in-memory store
//! ([`MemoryTileStore`]) for tests and small deployments.
//!
//! # Empty tiles
//!
//! A zero-length payload is a first-class value, not a missing entry:
//! it records that the tile was produced and contains no features.
//! [`TileStore::is_empty`] distinguishes the two cases without reading
//! payloads.
//!
//! # Dyn Compatibility
//!
//! The trait uses `Pin<Box<dyn Future>>` returns so stores can be held
//! as `Arc<dyn TileStore>` and wrapped polymorphically.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::geo::BoundingBox;
use crate::tile::{TileAddress, TileMatrixError};

mod fs;
mod memory;
mod path;

pub use fs::FsTileStore;
pub use memory::MemoryTileStore;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from tile store operations.
#[derive(Debug, Error)]
pub enum TileStoreError {
    /// I/O failure in the backing storage, passed through untouched.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A region deletion used an address outside the tiling scheme.
    #[error(transparent)]
    Matrix(#[from] TileMatrixError),

    /// A region deletion named a tiling scheme this store cannot map
    /// to a grid.
    #[error("unknown tile matrix set '{0}'")]
    UnknownTileMatrixSet(String),
}

/// Result of a cache cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Number of files or entries removed.
    pub entries_removed: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup: removed {} entries, freed {} bytes in {}ms",
            self.entries_removed, self.bytes_freed, self.duration_ms
        )
    }
}

/// Narrows a region deletion below the API level.
///
/// An unset member means "all". The bounding box must be in the CRS of
/// the tiling scheme whose tiles it selects.
#[derive(Debug, Clone, Default)]
pub struct RegionFilter {
    collection_id: Option<String>,
    tile_matrix_set_id: Option<String>,
    bbox: Option<BoundingBox>,
}

impl RegionFilter {
    /// Matches every tile of the API.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one collection's tiles.
    pub fn collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    /// Restricts to one tiling scheme.
    pub fn tile_matrix_set(mut self, tile_matrix_set_id: impl Into<String>) -> Self {
        self.tile_matrix_set_id = Some(tile_matrix_set_id.into());
        self
    }

    /// Restricts to tiles intersecting a bounding box.
    pub fn bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }

    pub fn tile_matrix_set_id(&self) -> Option<&str> {
        self.tile_matrix_set_id.as_deref()
    }

    pub fn bounding_box(&self) -> Option<&BoundingBox> {
        self.bbox.as_ref()
    }
}

/// Persistent storage of encoded tiles.
///
/// All implementations must be `Send + Sync`; a store is shared across
/// request handlers and background seeders.
pub trait TileStore: Send + Sync {
    /// Whether a tile is present, without reading it.
    fn exists(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>>;

    /// Reads a tile's payload.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the tile is present; zero-length bytes
    ///   are the empty-tile marker
    /// - `Ok(None)` if the tile was never produced
    fn read(&self, address: &TileAddress) -> BoxFuture<'_, Result<Option<Bytes>, TileStoreError>>;

    /// When the tile was last written, `None` if absent.
    fn last_modified(
        &self,
        address: &TileAddress,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, TileStoreError>>;

    /// Whether the tile is the empty-tile marker.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(true))` for a present, zero-length tile
    /// - `Ok(Some(false))` for a present tile with content
    /// - `Ok(None)` for an absent tile
    fn is_empty(&self, address: &TileAddress)
        -> BoxFuture<'_, Result<Option<bool>, TileStoreError>>;

    /// Writes a tile, replacing any previous payload.
    ///
    /// Writing a zero-length payload records the tile as produced and
    /// empty.
    fn write(
        &self,
        address: &TileAddress,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), TileStoreError>>;

    /// Deletes one tile.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the tile existed, `Ok(false)` if it did not.
    fn delete(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>>;

    /// Deletes every tile of an API matched by the filter.
    ///
    /// Deleting with a bounding box requires grid arithmetic: the
    /// store must know the named tiling schemes, and fails with
    /// [`TileStoreError::UnknownTileMatrixSet`] for ones it does not.
    ///
    /// # Returns
    ///
    /// The number of tiles removed.
    fn delete_region(
        &self,
        api_id: &str,
        filter: &RegionFilter,
    ) -> BoxFuture<'_, Result<u64, TileStoreError>>;

    /// Removes stale derived entries, like expired parameterized
    /// variants and leftovers of interrupted writes. Canonical tiles
    /// are never touched.
    fn cleanup(&self) -> BoxFuture<'_, Result<CleanupReport, TileStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_report_display() {
        let report = CleanupReport {
            entries_removed: 3,
            bytes_freed: 2048,
            duration_ms: 17,
        };
        let text = format!("{}", report);
        assert!(text.contains("3 entries"));
        assert!(text.contains("2048 bytes"));
        assert!(text.contains("17ms"));
    }

    #[test]
    fn test_region_filter_builders() {
        let filter = RegionFilter::all()
            .collection("roads")
            .tile_matrix_set("WebMercatorQuad");
        assert_eq!(filter.collection_id(), Some("roads"));
        assert_eq!(filter.tile_matrix_set_id(), Some("WebMercatorQuad"));
        assert!(filter.bounding_box().is_none());
    }

    #[test]
    fn test_store_error_from_io_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TileStoreError = io.into();
        assert!(matches!(err, TileStoreError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
