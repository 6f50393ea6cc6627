//! Integration tests for the tile pipeline.
//!
//! These tests verify the complete flow from raw request parameters to
//! a merged multi-layer tile:
//! - Request parameters → predicate compilation → per-collection query
//! - Single-layer tile persistence through the filesystem store
//! - Multi-layer composition with empty markers, retries and deletes
//!
//! Run with: `cargo test --test multi_layer_tile`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tileweaver::cache::{FsTileStore, RegionFilter, TileStore};
use tileweaver::compose::{
    decode_tile, DecodedFeature, LayerSource, MultiLayerTileBuilder, TileCompositor,
};
use tileweaver::filter::FilterExpression;
use tileweaver::geo::{BoundingBox, Crs};
use tileweaver::query::{
    ExtentError, ExtentProvider, LevelRange, PredefinedFilter, PropertyRule, TileQueryBuilder,
    TileQueryConfig, ZoomRules,
};
use tileweaver::retry::RetryPolicy;
use tileweaver::schema::{CollectionSchema, SchemaSource};
use tileweaver::tile::{TileAddress, TileMatrixSet};

// ============================================================================
// Fixtures
// ============================================================================

const API: &str = "topo-api";
const API_VERSION: u64 = 1;

/// Schemas for a small topographic dataset.
struct TopoSchemas;

impl SchemaSource for TopoSchemas {
    fn schema(&self, collection_id: &str) -> Option<CollectionSchema> {
        match collection_id {
            "roads" | "buildings" | "waterways" => Some(
                CollectionSchema::new()
                    .with_primary_geometry("geometry")
                    .with_primary_instant("updated"),
            ),
            _ => None,
        }
    }
}

/// Extent provider without any recorded extents; tile bounds are used
/// unclipped.
struct NoExtents;

impl ExtentProvider for NoExtents {
    fn spatial_extent(
        &self,
        _collection_id: &str,
        _crs: Crs,
    ) -> Result<Option<BoundingBox>, ExtentError> {
        Ok(None)
    }
}

/// The tile every test works on, per collection.
fn address(collection: &str) -> TileAddress {
    TileAddress::for_collection(API, collection, "WebMercatorQuad", 9, 200, 300)
}

fn query_builder() -> TileQueryBuilder {
    let config = TileQueryConfig::new()
        .with_limit(5000)
        .with_coordinate_precision("metre", 2);
    TileQueryBuilder::new(Arc::new(TopoSchemas), Arc::new(NoExtents), config)
}

fn zoom_rules() -> ZoomRules {
    ZoomRules::new()
        .with_filter(
            "WebMercatorQuad",
            PredefinedFilter::new(LevelRange::new(0, 12), "class = 'major'"),
        )
        .with_properties(
            "WebMercatorQuad",
            PropertyRule::new(
                LevelRange::new(0, 24),
                vec!["class".to_string(), "surface".to_string()],
            ),
        )
}

/// Encodes a single-layer tile with one line feature, the way an
/// upstream feature provider would hand it to the store.
fn single_layer_tile(layer: &str) -> Bytes {
    let mut builder = MultiLayerTileBuilder::new(4096);
    builder.add_feature(DecodedFeature {
        layer: layer.to_string(),
        extent: Some(4096),
        id: Some(1),
        geom_type: Some(2),
        geometry: vec![9, 4, 4, 10, 20, 20],
        attributes: Vec::new(),
    });
    builder.into_bytes()
}

fn layer_names(bytes: &Bytes) -> Vec<String> {
    let mut names: Vec<String> = decode_tile(bytes)
        .unwrap()
        .into_iter()
        .map(|feature| feature.layer)
        .collect();
    names.dedup();
    names
}

// ============================================================================
// Integration Tests
// ============================================================================

/// The full path: compile a filtered request into per-collection
/// queries, persist the resulting single-layer tiles, merge them.
#[tokio::test]
async fn test_request_to_merged_tile_flow() {
    let matrix = TileMatrixSet::web_mercator_quad();
    let builder = query_builder();
    let rules = zoom_rules();
    let parameters = HashMap::from([("filter".to_string(), "surface = 'paved'".to_string())]);

    // Step 1: Build a query per contributing collection.
    for collection in ["roads", "buildings"] {
        let query = builder
            .build_query(&address(collection), API_VERSION, &parameters, &rules, &matrix)
            .expect("query should compile");

        assert_eq!(query.feature_type, collection);
        assert_eq!(query.limit, 5000);
        assert_eq!(query.properties, vec!["class", "surface"]);
        assert_eq!(query.crs, Crs::WEB_MERCATOR);
        assert_eq!(query.coordinate_precision, Some(2));

        // Request filter, predefined filter, then the spatial clause.
        match query.filter {
            Some(FilterExpression::And(parts)) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(parts[2], FilterExpression::SIntersects { .. }));
            }
            other => panic!("expected a three-part conjunction, got {other:?}"),
        }
    }

    // Step 2: Persist what the feature provider produced; buildings
    // legitimately has nothing in this tile.
    let workdir = TempDir::new().unwrap();
    let store = Arc::new(FsTileStore::new(workdir.path()));
    store
        .write(&address("roads"), single_layer_tile("roads"))
        .await
        .unwrap();
    store.write(&address("buildings"), Bytes::new()).await.unwrap();

    assert_eq!(store.is_empty(&address("roads")).await.unwrap(), Some(false));
    assert_eq!(
        store.is_empty(&address("buildings")).await.unwrap(),
        Some(true)
    );

    // Step 3: Merge into the multi-layer tile.
    let compositor = TileCompositor::new(Arc::clone(&store) as Arc<dyn TileStore>);
    let sources = BTreeMap::from([
        ("roads".to_string(), LayerSource::cached(address("roads"))),
        (
            "buildings".to_string(),
            LayerSource::cached(address("buildings")),
        ),
    ]);

    let merged = compositor
        .merge(&matrix, sources, CancellationToken::new())
        .await
        .expect("merge should succeed");

    assert!(merged.is_complete, "both collections were accounted for");
    assert_eq!(layer_names(&merged.bytes), vec!["roads".to_string()]);

    // Step 4: A complete result is cacheable under the dataset address.
    let dataset = TileAddress::for_dataset(API, "WebMercatorQuad", 9, 200, 300);
    store.write(&dataset, merged.bytes.clone()).await.unwrap();
    assert_eq!(store.read(&dataset).await.unwrap(), Some(merged.bytes));
}

/// A collection whose tile never shows up leaves the merge incomplete;
/// the other layers are still usable.
#[tokio::test]
async fn test_straggling_collection_yields_incomplete_tile() {
    let workdir = TempDir::new().unwrap();
    let store = Arc::new(FsTileStore::new(workdir.path()));
    store
        .write(&address("roads"), single_layer_tile("roads"))
        .await
        .unwrap();

    let compositor = TileCompositor::new(Arc::clone(&store) as Arc<dyn TileStore>)
        .with_retry(RetryPolicy::fixed(4, Duration::ZERO));
    let sources = BTreeMap::from([
        ("roads".to_string(), LayerSource::cached(address("roads"))),
        (
            "waterways".to_string(),
            LayerSource::cached(address("waterways")),
        ),
    ]);

    let merged = compositor
        .merge(
            &TileMatrixSet::web_mercator_quad(),
            sources,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!merged.is_complete);
    assert_eq!(layer_names(&merged.bytes), vec!["roads".to_string()]);
}

/// Region deletion drops a collection's tiles from the store; a
/// subsequent merge sees them as missing rather than empty.
#[tokio::test]
async fn test_region_delete_then_merge() {
    let workdir = TempDir::new().unwrap();
    let store = Arc::new(FsTileStore::new(workdir.path()));
    store
        .write(&address("roads"), single_layer_tile("roads"))
        .await
        .unwrap();
    store
        .write(&address("buildings"), single_layer_tile("buildings"))
        .await
        .unwrap();

    let deleted = store
        .delete_region(API, &RegionFilter::all().collection("buildings"))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(!store.exists(&address("buildings")).await.unwrap());
    assert!(store.exists(&address("roads")).await.unwrap());

    let compositor = TileCompositor::new(Arc::clone(&store) as Arc<dyn TileStore>)
        .with_retry(RetryPolicy::None);
    let sources = BTreeMap::from([
        ("roads".to_string(), LayerSource::cached(address("roads"))),
        (
            "buildings".to_string(),
            LayerSource::cached(address("buildings")),
        ),
    ]);

    let merged = compositor
        .merge(
            &TileMatrixSet::web_mercator_quad(),
            sources,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!merged.is_complete);
    assert_eq!(layer_names(&merged.bytes), vec!["roads".to_string()]);
}
