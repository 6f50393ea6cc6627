//! TileWeaver - Vector tile query compilation, caching and composition
//!
//! This library provides the tile-serving core of an OGC API style
//! service: it compiles request parameters into per-collection feature
//! queries, persists the generated single-layer tiles, and merges them
//! into multi-layer tiles.
//!
//! # Data Flow
//!
//! Request parameters pass through the [`filter::PredicateCompiler`]
//! into a [`filter::FilterExpression`], which the
//! [`query::TileQueryBuilder`] combines with zoom-level rules and the
//! tile's own bounding box into a [`query::FeatureQuery`]. An external
//! feature provider executes that query; the resulting tile bytes live
//! in a [`cache::TileStore`], from which the [`compose::TileCompositor`]
//! assembles multi-layer tiles.
//!
//! ```ignore
//! use tileweaver::cache::FsTileStore;
//! use tileweaver::compose::{LayerSource, TileCompositor};
//! use tileweaver::tile::{TileAddress, TileMatrixSet};
//!
//! let store = Arc::new(FsTileStore::new(cache_root));
//! let compositor = TileCompositor::new(store);
//!
//! let sources = BTreeMap::from([
//!     ("roads".to_string(), LayerSource::cached(roads_address)),
//!     ("buildings".to_string(), LayerSource::cached(buildings_address)),
//! ]);
//! let merged = compositor
//!     .merge(&TileMatrixSet::web_mercator_quad(), sources, cancellation)
//!     .await?;
//! ```

pub mod cache;
pub mod compose;
pub mod filter;
pub mod geo;
pub mod query;
pub mod retry;
pub mod schema;
pub mod tile;

/// Version of the TileWeaver library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
