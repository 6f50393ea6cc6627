//! Filesystem layout of the tile cache.
//!
//! Tiles live under
//! `<root>/<api>/<layer>/<tile matrix set>/<level>/<row>/<col>.mvt`,
//! where `<layer>` is the collection id or the dataset layer marker.
//! A parameterized variant of a tile sits next to the canonical file
//! as `<col>_<digest>.mvt`, with the digest derived from the sorted
//! query parameters so equivalent requests share one file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::tile::TileAddress;

/// File extension of stored tiles.
pub(crate) const TILE_EXTENSION: &str = "mvt";

/// Hex digits of the parameter digest kept in variant file names.
const VARIANT_DIGEST_LEN: usize = 12;

/// The directory holding one tile's row.
pub(crate) fn tile_dir(root: &Path, address: &TileAddress) -> PathBuf {
    root.join(address.api_id())
        .join(address.layer_id())
        .join(address.tile_matrix_set_id())
        .join(address.level().to_string())
        .join(address.row().to_string())
}

/// The canonical file path of a tile.
pub(crate) fn tile_path(root: &Path, address: &TileAddress) -> PathBuf {
    tile_dir(root, address).join(format!("{}.{}", address.col(), TILE_EXTENSION))
}

/// The file path of a parameterized variant of a tile.
pub(crate) fn variant_path(root: &Path, address: &TileAddress, digest: &str) -> PathBuf {
    tile_dir(root, address).join(format!(
        "{}_{}.{}",
        address.col(),
        digest,
        TILE_EXTENSION
    ))
}

/// Digest over the query parameters that produced a variant.
///
/// Parameters are hashed in sorted key order, so the digest does not
/// depend on map iteration order.
pub(crate) fn variant_digest(parameters: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&str, &str)> = parameters
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    let digest = hasher.finalize();

    let mut out = String::with_capacity(VARIANT_DIGEST_LEN);
    for byte in digest.iter().take(VARIANT_DIGEST_LEN / 2) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Splits a tile file stem into its column and optional variant
/// digest. Returns `None` for files that are not tiles.
pub(crate) fn parse_stem(stem: &str) -> Option<(u32, Option<&str>)> {
    match stem.split_once('_') {
        Some((col, digest)) => col.parse().ok().map(|c| (c, Some(digest))),
        None => stem.parse().ok().map(|c| (c, None)),
    }
}
