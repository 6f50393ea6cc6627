//! Multi-layer tile composition.
//!
//! A multi-layer tile is assembled from the cached single-layer tiles
//! of its contributing collections. [`decode_tile`] and
//! [`MultiLayerTileBuilder`] handle the deterministic decode and
//! re-encode; the [`TileCompositor`] drives the store reads, the retry
//! loop that bridges concurrent generation, and corruption handling.

mod codec;
mod compositor;

pub use codec::{decode_tile, CodecError, DecodedFeature, MultiLayerTileBuilder, MVT_VERSION};
pub use compositor::{ComposeError, LayerSource, MergedTile, TileCompositor};
