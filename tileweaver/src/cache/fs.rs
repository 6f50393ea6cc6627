//! Filesystem tile store.
//!
//! Stores tiles as plain files in the layout described in the path
//! module. Writes go through a staging file and a rename, so a reader
//! never observes a half-written tile. The store keeps a registry of
//! tiling schemes because deleting a region by bounding box needs the
//! grid arithmetic of the scheme the tiles were cut from.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use crate::cache::path::{
    parse_stem, tile_path, variant_digest, variant_path, TILE_EXTENSION,
};
use crate::cache::{BoxFuture, CleanupReport, RegionFilter, TileStore, TileStoreError};
use crate::geo::BoundingBox;
use crate::tile::{TileAddress, TileMatrixError, TileMatrixSet, TileRange};

/// Extension of staging files left behind by interrupted writes.
const STAGING_EXTENSION: &str = "tmp";

/// Tile store rooted at a directory.
pub struct FsTileStore {
    root: PathBuf,
    matrix_sets: HashMap<String, TileMatrixSet>,
    variant_ttl: Option<Duration>,
}

impl FsTileStore {
    /// Creates a store rooted at `root`.
    ///
    /// The two well-known tiling schemes are registered out of the
    /// box; additional ones can be added with
    /// [`FsTileStore::with_matrix_set`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut matrix_sets = HashMap::new();
        for set in [
            TileMatrixSet::web_mercator_quad(),
            TileMatrixSet::world_crs84_quad(),
        ] {
            matrix_sets.insert(set.id().to_string(), set);
        }
        Self {
            root: root.into(),
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
    ///
    /// Variants are derived artifacts: cleanup may expire them, and
    /// region deletions remove them together with their canonical
    /// tile.
    pub async fn write_variant(
        &self,
        address: &TileAddress,
        parameters: &HashMap<String, String>,
        payload: Bytes,
    ) -> Result<(), TileStoreError> {
        let path = variant_path(&self.root, address, &variant_digest(parameters));
        write_file(&path, &payload).await
    }

    /// Reads a parameterized variant of a tile, `None` if absent.
    pub async fn read_variant(
        &self,
        address: &TileAddress,
        parameters: &HashMap<String, String>,
    ) -> Result<Option<Bytes>, TileStoreError> {
        let path = variant_path(&self.root, address, &variant_digest(parameters));
        read_file(&path).await
    }

    async fn delete_region_inner(
        &self,
        api_id: &str,
        filter: &RegionFilter,
    ) -> Result<u64, TileStoreError> {
        let api_dir = self.root.join(api_id);
        let mut removed = 0u64;

        let layer_dirs = match filter.collection_id() {
            Some(collection) => vec![api_dir.join(collection)],
            None => list_dirs(&api_dir).await?,
        };
        for layer_dir in layer_dirs {
            let set_dirs = match filter.tile_matrix_set_id() {
                Some(set_id) => vec![layer_dir.join(set_id)],
                None => list_dirs(&layer_dir).await?,
            };
            for set_dir in set_dirs {
                match filter.bounding_box() {
                    None => removed += remove_tree(&set_dir).await?,
                    Some(bbox) => {
                        let set_id = dir_name(&set_dir).unwrap_or_default();
                        let matrix_set = self.matrix_sets.get(set_id).ok_or_else(|| {
                            TileStoreError::UnknownTileMatrixSet(set_id.to_string())
                        })?;
                        removed += delete_in_bbox(&set_dir, matrix_set, bbox).await?;
                    }
                }
            }
        }

        debug!(api = api_id, removed, "deleted tile region");
        Ok(removed)
    }

    async fn cleanup_inner(&self) -> Result<CleanupReport, TileStoreError> {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if is_staging_file(&path) {
                    remove_counted(&path, &mut report).await?;
                } else if let Some(ttl) = self.variant_ttl {
                    if is_variant_file(&path) && is_older_than(&entry, ttl).await {
                        remove_counted(&path, &mut report).await?;
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        debug!(%report, "tile cache cleanup finished");
        Ok(report)
    }
}

impl TileStore for FsTileStore {
    fn exists(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>> {
        let path = tile_path(&self.root, address);
        Box::pin(async move { Ok(file_metadata(&path).await?.is_some()) })
    }

    fn read(&self, address: &TileAddress) -> BoxFuture<'_, Result<Option<Bytes>, TileStoreError>> {
        let path = tile_path(&self.root, address);
        Box::pin(async move { read_file(&path).await })
    }

    fn last_modified(
        &self,
        address: &TileAddress,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, TileStoreError>> {
        let path = tile_path(&self.root, address);
        Box::pin(async move {
            match file_metadata(&path).await? {
                Some(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
                None => Ok(None),
            }
        })
    }

    fn is_empty(
        &self,
        address: &TileAddress,
    ) -> BoxFuture<'_, Result<Option<bool>, TileStoreError>> {
        let path = tile_path(&self.root, address);
        Box::pin(async move {
            Ok(file_metadata(&path).await?.map(|meta| meta.len() == 0))
        })
    }

    fn write(
        &self,
        address: &TileAddress,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), TileStoreError>> {
        let path = tile_path(&self.root, address);
        let tile = address.to_string();
        Box::pin(async move {
            write_file(&path, &payload).await?;
            debug!(%tile, bytes = payload.len(), "stored tile");
            Ok(())
        })
    }

    fn delete(&self, address: &TileAddress) -> BoxFuture<'_, Result<bool, TileStoreError>> {
        let path = tile_path(&self.root, address);
        Box::pin(async move {
            match fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
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

async fn write_file(path: &Path, payload: &[u8]) -> Result<(), TileStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension(STAGING_EXTENSION);
    fs::write(&staging, payload).await?;
    fs::rename(&staging, path).await?;
    Ok(())
}

async fn read_file(path: &Path) -> Result<Option<Bytes>, TileStoreError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn file_metadata(path: &Path) -> Result<Option<std::fs::Metadata>, TileStoreError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dirs(path: &Path) -> Result<Vec<PathBuf>, TileStoreError> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Removes a directory tree, returning how many tile files it held.
async fn remove_tree(path: &Path) -> Result<u64, TileStoreError> {
    let count = count_tiles(path).await?;
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(count),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn count_tiles(path: &Path) -> Result<u64, TileStoreError> {
    let mut count = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else if is_tile_file(&path) {
                count += 1;
            }
        }
    }
    Ok(count)
}

async fn delete_in_bbox(
    set_dir: &Path,
    matrix_set: &TileMatrixSet,
    bbox: &BoundingBox,
) -> Result<u64, TileStoreError> {
    let mut removed = 0;
    for level_dir in list_dirs(set_dir).await? {
        let Some(level) = dir_name_as::<u8>(&level_dir) else {
            continue;
        };
        let range = match matrix_set.tile_range(level, bbox) {
            Ok(Some(range)) => range,
            Ok(None) => continue,
            // Stray directories beyond the pyramid are not ours to judge
            Err(TileMatrixError::LevelOutOfRange { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        for row_dir in list_dirs(&level_dir).await? {
            let Some(row) = dir_name_as::<u32>(&row_dir) else {
                continue;
            };
            if row < range.min_row || row > range.max_row {
                continue;
            }
            removed += delete_cols_in_range(&row_dir, row, &range).await?;
            // Prune emptied directories, best effort
            let _ = fs::remove_dir(&row_dir).await;
        }
        let _ = fs::remove_dir(&level_dir).await;
    }
    Ok(removed)
}

async fn delete_cols_in_range(
    row_dir: &Path,
    row: u32,
    range: &TileRange,
) -> Result<u64, TileStoreError> {
    let mut removed = 0;
    let mut entries = match fs::read_dir(row_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_tile_file(&path) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((col, _)) = parse_stem(stem) else {
            continue;
        };
        if range.contains(row, col) {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(removed)
}

async fn remove_counted(path: &Path, report: &mut CleanupReport) -> Result<(), TileStoreError> {
    let size = fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path).await {
        Ok(()) => {
            report.entries_removed += 1;
            report.bytes_freed += size;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn is_older_than(entry: &fs::DirEntry, ttl: Duration) -> bool {
    match entry.metadata().await.and_then(|meta| meta.modified()) {
        Ok(modified) => modified.elapsed().map_or(false, |age| age >= ttl),
        Err(_) => false,
    }
}

fn is_tile_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == TILE_EXTENSION)
}

fn is_staging_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == STAGING_EXTENSION)
}

fn is_variant_file(path: &Path) -> bool {
    is_tile_file(path)
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .map_or(false, |stem| stem.contains('_'))
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn dir_name_as<T: std::str::FromStr>(path: &Path) -> Option<T> {
    dir_name(path)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Crs;
    use tempfile::tempdir;

    fn address(col: u32) -> TileAddress {
        TileAddress::for_collection("osm", "roads", "WebMercatorQuad", 1, 0, col)
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
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
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);

        assert!(!store.exists(&addr).await.unwrap());
        assert_eq!(store.read(&addr).await.unwrap(), None);
        assert_eq!(store.is_empty(&addr).await.unwrap(), None);
        assert_eq!(store.last_modified(&addr).await.unwrap(), None);
        assert!(!store.delete(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_marker_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);

        store.write(&addr, Bytes::new()).await.unwrap();

        assert!(store.exists(&addr).await.unwrap());
        assert_eq!(store.is_empty(&addr).await.unwrap(), Some(true));
        assert_eq!(store.read(&addr).await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_payload() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);

        store.write(&addr, Bytes::from_static(b"old")).await.unwrap();
        store.write(&addr, Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(
            store.read(&addr).await.unwrap(),
            Some(Bytes::from_static(b"new"))
        );
    }

    #[tokio::test]
    async fn test_delete_removes_the_tile() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);

        store.write(&addr, Bytes::from_static(b"payload")).await.unwrap();
        assert!(store.delete(&addr).await.unwrap());
        assert!(!store.exists(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_staging_file_remains_after_write() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);

        store.write(&addr, Bytes::from_static(b"payload")).await.unwrap();

        let staged = tile_path(dir.path(), &addr).with_extension(STAGING_EXTENSION);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_variants_live_beside_the_canonical_tile() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);
        let mut parameters = HashMap::new();
        parameters.insert("name".to_string(), "central".to_string());

        store.write(&addr, Bytes::from_static(b"full")).await.unwrap();
        store
            .write_variant(&addr, &parameters, Bytes::from_static(b"filtered"))
            .await
            .unwrap();

        assert_eq!(
            store.read(&addr).await.unwrap(),
            Some(Bytes::from_static(b"full"))
        );
        assert_eq!(
            store.read_variant(&addr, &parameters).await.unwrap(),
            Some(Bytes::from_static(b"filtered"))
        );
        assert_eq!(
            store.read_variant(&addr, &HashMap::new()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_region_whole_api() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        store.write(&address(0), Bytes::from_static(b"a")).await.unwrap();
        store.write(&address(1), Bytes::from_static(b"b")).await.unwrap();
        let other_api = TileAddress::for_collection("other", "roads", "WebMercatorQuad", 1, 0, 0);
        store.write(&other_api, Bytes::from_static(b"c")).await.unwrap();

        let removed = store.delete_region("osm", &RegionFilter::all()).await.unwrap();

        assert_eq!(removed, 2);
        assert!(!store.exists(&address(0)).await.unwrap());
        assert!(store.exists(&other_api).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_region_by_collection() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
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
    async fn test_delete_region_by_bbox_removes_only_intersecting_tiles() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let west = address(0);
        let east = address(1);
        let south_east = TileAddress::for_collection("osm", "roads", "WebMercatorQuad", 1, 1, 1);
        for addr in [&west, &east, &south_east] {
            store.write(addr, Bytes::from_static(b"t")).await.unwrap();
        }

        // Western hemisphere of the Web Mercator world
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
        assert!(store.exists(&south_east).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_region_bbox_with_unknown_scheme_fails() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let odd = TileAddress::for_collection("osm", "roads", "FantasyQuad", 1, 0, 0);
        store.write(&odd, Bytes::from_static(b"t")).await.unwrap();

        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::WEB_MERCATOR);
        let result = store
            .delete_region("osm", &RegionFilter::all().bbox(bbox))
            .await;

        assert!(matches!(
            result.unwrap_err(),
            TileStoreError::UnknownTileMatrixSet(id) if id == "FantasyQuad"
        ));
    }

    #[tokio::test]
    async fn test_delete_region_missing_api_removes_nothing() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let removed = store
            .delete_region("ghost", &RegionFilter::all())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_staging_leftovers_and_expired_variants() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path()).with_variant_ttl(Duration::ZERO);
        let addr = address(0);
        let mut parameters = HashMap::new();
        parameters.insert("name".to_string(), "central".to_string());

        store.write(&addr, Bytes::from_static(b"keep")).await.unwrap();
        store
            .write_variant(&addr, &parameters, Bytes::from_static(b"stale"))
            .await
            .unwrap();
        let orphan = tile_path(dir.path(), &addr).with_extension(STAGING_EXTENSION);
        tokio::fs::write(&orphan, b"half-written").await.unwrap();

        let report = store.cleanup().await.unwrap();

        assert_eq!(report.entries_removed, 2);
        assert!(report.bytes_freed > 0);
        assert!(store.exists(&addr).await.unwrap());
        assert!(!orphan.exists());
        assert_eq!(store.read_variant(&addr, &parameters).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_without_ttl_keeps_variants() {
        let dir = tempdir().unwrap();
        let store = FsTileStore::new(dir.path());
        let addr = address(0);
        let mut parameters = HashMap::new();
        parameters.insert("name".to_string(), "central".to_string());
        store
            .write_variant(&addr, &parameters, Bytes::from_static(b"fresh"))
            .await
            .unwrap();

        let report = store.cleanup().await.unwrap();

        assert_eq!(report.entries_removed, 0);
        assert!(store
            .read_variant(&addr, &parameters)
            .await
            .unwrap()
            .is_some());
    }
}
