//! In-memory tile store.
//!
//! Backed by `moka::future::Cache`, weighted by payload size with
//! automatic eviction. Used by tests and small deployments that do not
//! want a disk cache; the semantics match [`FsTileStore`], including
//! the zero-length empty-tile marker and the variant side store.
//!
//! [`FsTileStore`]: crate::cache::FsTileStore

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;

use crate::cache::path::variant_digest;
use crate::cache::{BoxFuture, CleanupReport, RegionFilter, TileStore, TileStoreError};
use crate::tile::{TileAddress, TileMatrixError, TileMatrixSet};

#[derive(Clone)]
struct StoredTile {
    payload: Bytes,
    modified: DateTime<Utc>,
}

struct StoredVariant {
    payload: Bytes,
    stored_at: Instant,
}

/// Tile store held entirely in memory.
pub struct MemoryTileStore {
    tiles: MokaCache<TileAddress, StoredTile>,
    variants: RwLock<HashMap<(TileAddress, String), StoredVariant>>,
    matrix_sets: HashMap<String, TileMatrixSet>,
    variant_ttl: Option<Duration>,
}

impl MemoryTileStore {
    /// Creates a store bounded by total payload bytes.
    pub fn new(max_bytes: u64) -> Self {
        let tiles = MokaCache::builder()
            .weigher(|_address: &TileAddress, tile: &StoredTile| -> u32 {
                tile.payload.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_bytes)
            .build();

        let mut matrix_sets = HashMap::new();
        for set in [
            TileMatrixSet::web_mercator_quad(),
            TileMatrixSet::world_crs84_quad(),
        ] {
            matrix_sets.insert(set.id().to_string(), set);
        }

        Self {
            tiles,
            variants: RwLock::new(HashMap::new()),
            matrix_sets,
            variant_ttl: None,
        }
    }

    /// Registers a tiling scheme for region deletions.
    pub fn with_matrix_set(mut self, matrix_set: TileMatrixSet) -> Self {
        self.matrix_sets
            .insert(matrix_set.id().to_string(), matrix_set);
        self
    }

    /// Enables expiry of parameterized variants during cleanup.
    pub fn with_variant_ttl(mut self, ttl: Duration) -> Self {
        self.variant_ttl = Some(ttl);
        self
    }

    /// Writes a parameterized variant of a tile.
    pub async fn write_variant(
        &self,
        address: &TileAddress,
        parameters: &HashMap<String, String>,
        payload: Bytes,
    ) -> Result<(), TileStoreError> {
        let key = (address.clone(), variant_digest(parameters));
        self.variants.write().insert(
            key,
            StoredVariant {
                payload,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Reads a parameterized variant of a tile, `None` if absent.
    pub async fn read_variant(
        &self,
        address: &TileAddress,
        parameters: &HashMap<String, String>,
    ) -> Result<Option<Bytes>, TileStoreError> {
        let key = (address.clone(), variant_digest(parameters));
        Ok(self
            .variants
            .read()
            .get(&key)
            .map(|variant| variant.payload.clone()))
    }

    async fn delete_region_inner(
        &self,
        api_id: &str,
        filter: &RegionFilter,
    ) -> Result<u64, TileStoreError> {
        let mut selected = Vec::new();
        for (address, _) in self.tiles.iter() {
            if address.api_id() != api_id {
                continue;
            }
            if let Some(collection) = filter.collection_id() {
                if address.collection_id() != Some(collection) {
                    continue;
                }
            }
            if let Some(set_id) = filter.tile_matrix_set_id() {
                if address.tile_matrix_set_id() != set_id {
                    continue;
                }
            }
            if let Some(bbox) = filter.bounding_box() {
                let set_id = address.tile_matrix_set_id();
                let matrix_set = self.matrix_sets.get(set_id).ok_or_else(|| {
                    TileStoreError::UnknownTileMatrixSet(set_id.to_string())
                })?;
                let range = match matrix_set.tile_range(address.level(), bbox) {
                    Ok(Some(range)) => range,
                    Ok(None) => continue,
                    Err(TileMatrixError::LevelOutOfRange { .. }) => continue,
                    Err(e) => return Err(e.into()),
                };
                if !range.contains(address.row(), address.col()) {
                    continue;
                }
            }
            selected.push((*address).clone());
        }

        let mut removed = 0u64;
        for address in selected {
            self.tiles.invalidate(&address).await;
            self.variants.write().retain(|(addr, _), _| addr != &address);
            removed += 1;
        }
        self.tiles.run_pending_tasks().await;
        Ok(removed)
    }

    async fn cleanup_inner(&self) -> Result<CleanupReport, TileStoreError> {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        if let Some(ttl) = self.variant_ttl {
            let mut variants = self.variants.write();
            variants.retain(|_, variant| {
                if variant.stored_at.elapsed() >= ttl {
                    report.entries_removed += 1;
                    report.bytes_freed += variant.payload.len() as u64;
                    false
                } else {
                    true
                }
            });
        }

        self.tiles.run_pending_tasks().await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

impl TileStore for MemoryTileStore {
    fn exists(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>> {
        let address = address.clone();
        Box::pin(async move { Ok(self.tiles.contains_key(&address)) })
    }

    fn read(&self, address: &TileAddress) -> BoxFuture<'_, Result<Option<Bytes>, TileStoreError>> {
        let address = address.clone();
        Box::pin(async move {
            Ok(self.tiles.get(&address).await.map(|tile| tile.payload))
        })
    }

    fn last_modified(
        &self,
        address: &TileAddress,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, TileStoreError>> {
        let address = address.clone();
        Box::pin(async move {
            Ok(self.tiles.get(&address).await.map(|tile| tile.modified))
        })
    }

    fn is_empty(
        &self,
        address: &TileAddress,
    ) -> BoxFuture<'_, Result<Option<bool>, TileStoreError>> {
        let address = address.clone();
        Box::pin(async move {
            Ok(self
                .tiles
                .get(&address)
                .await
                .map(|tile| tile.payload.is_empty()))
        })
    }

    fn write(
        &self,
        address: &TileAddress,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), TileStoreError>> {
        let address = address.clone();
        Box::pin(async move {
            self.tiles
                .insert(
                    address,
                    StoredTile {
                        payload,
                        modified: Utc::now(),
                    },
                )
                .await;
            Ok(())
        })
    }

    fn delete(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>> {
        let address = address.clone();
        Box::pin(async move {
            let existed = self.tiles.contains_key(&address);
            self.tiles.invalidate(&address).await;
            self.variants.write().retain(|(addr, _), _| addr != &address);
            Ok(existed)
        })
    }

    fn delete_region(
        &self,
        api_id: &str,
        filter: &RegionFilter,
    ) -> BoxFuture<'_, Result<u64, TileStoreError>> {
        let api_id = api_id.to_string();
        let filter = filter.clone();
        Box::pin(async move { self.delete_region_inner(&api_id, &filter).await })
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<CleanupReport, TileStoreError>> {
        Box::pin(self.cleanup_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{BoundingBox, Crs};

    fn address(col: u32) -> TileAddress {
        TileAddress::for_collection("osm", "roads", "WebMercatorQuad", 1, 0, col)
    }

    fn store() -> MemoryTileStore {
        MemoryTileStore::new(64 * 1024 * 1024)
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = store();
        let addr = address(0);

        store.write(&addr, Bytes::from_static(b"payload")).await.unwrap();

        assert!(store.exists(&addr).await.unwrap());
        assert_eq!(
            store.read(&addr).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(store.is_empty(&addr).await.unwrap(), Some(false));
        assert!(store.last_modified(&addr).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_absent_tile() {
        let store = store();
        let addr = address(0);

        assert!(!store.exists(&addr).await.unwrap());
        assert_eq!(store.read(&addr).await.unwrap(), None);
        assert_eq!(store.is_empty(&addr).await.unwrap(), None);
        assert!(!store.delete(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_marker_round_trip() {
        let store = store();
        let addr = address(0);

        store.write(&addr, Bytes::new()).await.unwrap();

        assert_eq!(store.is_empty(&addr).await.unwrap(), Some(true));
        assert_eq!(store.read(&addr).await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_delete_also_drops_variants() {
        let store = store();
        let addr = address(0);
        let mut parameters = HashMap::new();
        parameters.insert("name".to_string(), "central".to_string());

        store.write(&addr, Bytes::from_static(b"full")).await.unwrap();
        store
            .write_variant(&addr, &parameters, Bytes::from_static(b"filtered"))
            .await
            .unwrap();

        assert!(store.delete(&addr).await.unwrap());
        assert_eq!(store.read_variant(&addr, &parameters).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_region_by_collection() {
        let store = store();
        let roads = address(0);
        let buildings =
            TileAddress::for_collection("osm", "buildings", "WebMercatorQuad", 1, 0, 0);
        store.write(&roads, Bytes::from_static(b"r")).await.unwrap();
        store.write(&buildings, Bytes::from_static(b"b")).await.unwrap();

        let removed = store
            .delete_region("osm", &RegionFilter::all().collection("roads"))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!store.exists(&roads).await.unwrap());
        assert!(store.exists(&buildings).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_region_by_bbox() {
        let store = store();
        let west = address(0);
        let east = address(1);
        store.write(&west, Bytes::from_static(b"w")).await.unwrap();
        store.write(&east, Bytes::from_static(b"e")).await.unwrap();

        let bbox = BoundingBox::new(
            -20_000_000.0,
            -20_000_000.0,
            -1_000.0,
            20_000_000.0,
            Crs::WEB_MERCATOR,
        );
        let removed = store
            .delete_region("osm", &RegionFilter::all().bbox(bbox))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!store.exists(&west).await.unwrap());
        assert!(store.exists(&east).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_region_ignores_other_apis() {
        let store = store();
        let mine = address(0);
        let other = TileAddress::for_collection("other", "roads", "WebMercatorQuad", 1, 0, 0);
        store.write(&mine, Bytes::from_static(b"m")).await.unwrap();
        store.write(&other, Bytes::from_static(b"o")).await.unwrap();

        let removed = store.delete_region("osm", &RegionFilter::all()).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.exists(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expires_variants() {
        let store = store().with_variant_ttl(Duration::ZERO);
        let addr = address(0);
        let mut parameters = HashMap::new();
        parameters.insert("name".to_string(), "central".to_string());

        store.write(&addr, Bytes::from_static(b"keep")).await.unwrap();
        store
            .write_variant(&addr, &parameters, Bytes::from_static(b"stale"))
            .await
            .unwrap();

        let report = store.cleanup().await.unwrap();

        assert_eq!(report.entries_removed, 1);
        assert!(store.exists(&addr).await.unwrap());
        assert_eq!(store.read_variant(&addr, &parameters).await.unwrap(), None);
    }
}
