//! Vector tile decoding and multi-layer assembly.
//!
//! Single-layer tiles arrive as encoded protobuf bytes. [`decode_tile`]
//! unpacks them into per-feature records with their attribute pairs
//! resolved against the layer's key/value tables. The
//! [`MultiLayerTileBuilder`] accumulates such records into one
//! multi-layer tile, re-interning keys and values per layer so repeated
//! attributes share table entries, and emits layers in name order so
//! the same contributions always encode to the same bytes.
//!
//! Geometry commands are carried through untouched. Merging never
//! re-projects or re-quantizes coordinates; a feature's `geometry`
//! vector lands in the output exactly as it was decoded.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use geozero::mvt::{tile, Tile};
use prost::Message;
use thiserror::Error;

/// Vector tile schema version written by the builder.
pub const MVT_VERSION: u32 = 2;

/// Why a byte payload could not be decoded as a vector tile.
///
/// Any of these means the payload is corrupt rather than merely empty;
/// callers are expected to evict the offending cache entry.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The protobuf envelope itself failed to parse.
    #[error("bytes do not decode as a vector tile: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A feature carried an odd number of attribute tags.
    #[error("layer '{layer}' has a feature with an odd attribute tag count")]
    TagPairs { layer: String },

    /// A feature tag pointed past the layer's key or value table.
    #[error("layer '{layer}' references attribute entry {index} beyond its table")]
    TagIndex { layer: String, index: u32 },
}

/// One feature lifted out of a single-layer tile.
///
/// Attributes are resolved to owned `(key, value)` pairs; `geometry`
/// holds the raw command integers of the source encoding.
#[derive(Debug, Clone)]
pub struct DecodedFeature {
    /// Name of the layer the feature came from.
    pub layer: String,
    /// Coordinate extent of the source layer, when it carried one.
    pub extent: Option<u32>,
    /// Source feature id, when present.
    pub id: Option<u64>,
    /// Raw geometry type discriminant of the source feature.
    pub geom_type: Option<i32>,
    /// Geometry command sequence, passed through unmodified.
    pub geometry: Vec<u32>,
    /// Attribute pairs in source tag order.
    pub attributes: Vec<(String, tile::Value)>,
}

/// Decodes an encoded vector tile into its features.
///
/// Features are returned in layer order, then feature order, exactly as
/// they appear in the payload. Tag pairs are resolved eagerly so a
/// malformed tag table is caught here rather than at re-encode time.
///
/// # Arguments
///
/// * `bytes` - The encoded tile. Must be non-empty; zero-length payloads
///   are the empty-tile marker and have no features to decode.
///
/// # Returns
///
/// The decoded features, or a [`CodecError`] describing the corruption.
pub fn decode_tile(bytes: &[u8]) -> Result<Vec<DecodedFeature>, CodecError> {
    let decoded = Tile::decode(bytes)?;

    let mut features = Vec::new();
    for layer in decoded.layers {
        let name = layer.name;
        let extent = layer.extent;
        let keys = layer.keys;
        let values = layer.values;

        for feature in layer.features {
            if feature.tags.len() % 2 != 0 {
                return Err(CodecError::TagPairs { layer: name });
            }

            let mut attributes = Vec::with_capacity(feature.tags.len() / 2);
            for pair in feature.tags.chunks(2) {
                let key = keys.get(pair[0] as usize).ok_or(CodecError::TagIndex {
                    layer: name.clone(),
                    index: pair[0],
                })?;
                let value = values.get(pair[1] as usize).ok_or(CodecError::TagIndex {
                    layer: name.clone(),
                    index: pair[1],
                })?;
                attributes.push((key.clone(), value.clone()));
            }

            features.push(DecodedFeature {
                layer: name.clone(),
                extent,
                id: feature.id,
                geom_type: feature.r#type,
                geometry: feature.geometry,
                attributes,
            });
        }
    }

    Ok(features)
}

/// Accumulates decoded features into one multi-layer tile.
///
/// Layers are keyed by name; the first feature added under a name fixes
/// that layer's extent (falling back to the builder default when the
/// source layer carried none). Keys and values are interned per layer,
/// so two features sharing an attribute share a table entry no matter
/// which source tile they came from.
#[derive(Debug)]
pub struct MultiLayerTileBuilder {
    default_extent: u32,
    layers: BTreeMap<String, LayerBuilder>,
}

impl MultiLayerTileBuilder {
    /// Creates an empty builder producing layers of `default_extent`
    /// coordinate units unless a source layer specifies its own.
    pub fn new(default_extent: u32) -> Self {
        Self {
            default_extent,
            layers: BTreeMap::new(),
        }
    }

    /// Adds one feature under its originating layer name.
    pub fn add_feature(&mut self, feature: DecodedFeature) {
        let extent = feature.extent.unwrap_or(self.default_extent);
        let layer = self
            .layers
            .entry(feature.layer)
            .or_insert_with(|| LayerBuilder::new(extent));

        let mut tags = Vec::with_capacity(feature.attributes.len() * 2);
        for (key, value) in feature.attributes {
            tags.push(layer.intern_key(key));
            tags.push(layer.intern_value(value));
        }

        layer.features.push(tile::Feature {
            id: feature.id,
            tags,
            r#type: feature.geom_type,
            geometry: feature.geometry,
        });
    }

    /// Number of layers accumulated so far.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Total number of features across all layers.
    pub fn feature_count(&self) -> usize {
        self.layers.values().map(|layer| layer.features.len()).sum()
    }

    /// Encodes the accumulated layers, sorted by name.
    ///
    /// A builder holding no layers encodes to zero bytes, which doubles
    /// as the empty-tile marker understood by the stores.
    pub fn into_bytes(self) -> Bytes {
        if self.layers.is_empty() {
            return Bytes::new();
        }

        let layers = self
            .layers
            .into_iter()
            .map(|(name, layer)| layer.into_layer(name))
            .collect();
        let encoded = Tile { layers };
        Bytes::from(encoded.encode_to_vec())
    }
}

/// Per-layer accumulation state with key/value interning.
#[derive(Debug)]
struct LayerBuilder {
    extent: u32,
    features: Vec<tile::Feature>,
    keys: Vec<String>,
    values: Vec<tile::Value>,
    key_index: HashMap<String, u32>,
    value_index: HashMap<Vec<u8>, u32>,
}

impl LayerBuilder {
    fn new(extent: u32) -> Self {
        Self {
            extent,
            features: Vec::new(),
            keys: Vec::new(),
            values: Vec::new(),
            key_index: HashMap::new(),
            value_index: HashMap::new(),
        }
    }

    fn intern_key(&mut self, key: String) -> u32 {
        if let Some(&index) = self.key_index.get(&key) {
            return index;
        }
        let index = self.keys.len() as u32;
        self.key_index.insert(key.clone(), index);
        self.keys.push(key);
        index
    }

    // Values carry floats, so dedup is keyed on encoded bytes rather
    // than on the value itself.
    fn intern_value(&mut self, value: tile::Value) -> u32 {
        let fingerprint = value.encode_to_vec();
        if let Some(&index) = self.value_index.get(&fingerprint) {
            return index;
        }
        let index = self.values.len() as u32;
        self.value_index.insert(fingerprint, index);
        self.values.push(value);
        index
    }

    fn into_layer(self, name: String) -> tile::Layer {
        tile::Layer {
            version: MVT_VERSION,
            name,
            features: self.features,
            keys: self.keys,
            values: self.values,
            extent: Some(self.extent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_value(text: &str) -> tile::Value {
        tile::Value {
            string_value: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn int_value(number: i64) -> tile::Value {
        tile::Value {
            int_value: Some(number),
            ..Default::default()
        }
    }

    fn line_feature(layer: &str, id: u64, attributes: Vec<(String, tile::Value)>) -> DecodedFeature {
        DecodedFeature {
            layer: layer.to_string(),
            extent: Some(4096),
            id: Some(id),
            geom_type: Some(tile::GeomType::Linestring as i32),
            // MoveTo(2,2), LineTo(10,10)
            geometry: vec![9, 4, 4, 10, 20, 20],
            attributes,
        }
    }

    #[test]
    fn test_round_trip_preserves_features() {
        let mut builder = MultiLayerTileBuilder::new(4096);
        builder.add_feature(line_feature(
            "roads",
            7,
            vec![("surface".to_string(), string_value("paved"))],
        ));
        let bytes = builder.into_bytes();

        let features = decode_tile(&bytes).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].layer, "roads");
        assert_eq!(features[0].id, Some(7));
        assert_eq!(features[0].extent, Some(4096));
        assert_eq!(features[0].geom_type, Some(tile::GeomType::Linestring as i32));
        assert_eq!(features[0].geometry, vec![9, 4, 4, 10, 20, 20]);
        assert_eq!(features[0].attributes.len(), 1);
        assert_eq!(features[0].attributes[0].0, "surface");
        assert_eq!(features[0].attributes[0].1, string_value("paved"));
    }

    #[test]
    fn test_shared_attributes_share_table_entries() {
        let mut builder = MultiLayerTileBuilder::new(4096);
        builder.add_feature(line_feature(
            "roads",
            1,
            vec![
                ("surface".to_string(), string_value("paved")),
                ("lanes".to_string(), int_value(2)),
            ],
        ));
        builder.add_feature(line_feature(
            "roads",
            2,
            vec![
                ("surface".to_string(), string_value("paved")),
                ("lanes".to_string(), int_value(4)),
            ],
        ));

        let decoded = Tile::decode(&builder.into_bytes()[..]).unwrap();
        assert_eq!(decoded.layers.len(), 1);

        let layer = &decoded.layers[0];
        assert_eq!(layer.version, MVT_VERSION);
        assert_eq!(layer.keys, vec!["surface".to_string(), "lanes".to_string()]);
        // "paved", 2 and 4: the repeated string is interned once.
        assert_eq!(layer.values.len(), 3);
        assert_eq!(layer.features[0].tags, vec![0, 0, 1, 1]);
        assert_eq!(layer.features[1].tags, vec![0, 0, 1, 2]);
    }

    #[test]
    fn test_layers_encode_in_name_order() {
        let mut forward = MultiLayerTileBuilder::new(4096);
        forward.add_feature(line_feature("buildings", 1, Vec::new()));
        forward.add_feature(line_feature("roads", 2, Vec::new()));

        let mut reversed = MultiLayerTileBuilder::new(4096);
        reversed.add_feature(line_feature("roads", 2, Vec::new()));
        reversed.add_feature(line_feature("buildings", 1, Vec::new()));

        assert_eq!(forward.into_bytes(), reversed.into_bytes());
    }

    #[test]
    fn test_empty_builder_encodes_to_empty_marker() {
        let builder = MultiLayerTileBuilder::new(4096);
        assert_eq!(builder.layer_count(), 0);
        assert!(builder.into_bytes().is_empty());
    }

    #[test]
    fn test_default_extent_applies_when_source_has_none() {
        let mut builder = MultiLayerTileBuilder::new(512);
        let mut feature = line_feature("roads", 1, Vec::new());
        feature.extent = None;
        builder.add_feature(feature);

        let decoded = Tile::decode(&builder.into_bytes()[..]).unwrap();
        assert_eq!(decoded.layers[0].extent, Some(512));
    }

    #[test]
    fn test_truncated_bytes_are_corrupt() {
        let mut builder = MultiLayerTileBuilder::new(4096);
        builder.add_feature(line_feature(
            "roads",
            1,
            vec![("surface".to_string(), string_value("paved"))],
        ));
        let bytes = builder.into_bytes();

        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode_tile(truncated),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_tag_index_beyond_table_is_corrupt() {
        let raw = Tile {
            layers: vec![tile::Layer {
                version: MVT_VERSION,
                name: "roads".to_string(),
                features: vec![tile::Feature {
                    id: Some(1),
                    tags: vec![0, 9],
                    r#type: Some(tile::GeomType::Point as i32),
                    geometry: vec![9, 0, 0],
                }],
                keys: vec!["surface".to_string()],
                values: vec![string_value("paved")],
                extent: Some(4096),
            }],
        };

        let result = decode_tile(&raw.encode_to_vec());
        assert!(matches!(
            result,
            Err(CodecError::TagIndex { ref layer, index: 9 }) if layer == "roads"
        ));
    }

    #[test]
    fn test_odd_tag_count_is_corrupt() {
        let raw = Tile {
            layers: vec![tile::Layer {
                version: MVT_VERSION,
                name: "roads".to_string(),
                features: vec![tile::Feature {
                    id: None,
                    tags: vec![0],
                    r#type: Some(tile::GeomType::Point as i32),
                    geometry: vec![9, 0, 0],
                }],
                keys: vec!["surface".to_string()],
                values: vec![string_value("paved")],
                extent: Some(4096),
            }],
        };

        let result = decode_tile(&raw.encode_to_vec());
        assert!(matches!(
            result,
            Err(CodecError::TagPairs { ref layer }) if layer == "roads"
        ));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let build = || {
            let mut builder = MultiLayerTileBuilder::new(4096);
            builder.add_feature(line_feature(
                "roads",
                1,
                vec![("surface".to_string(), string_value("paved"))],
            ));
            builder.add_feature(line_feature("waterways", 2, Vec::new()));
            builder.into_bytes()
        };

        assert_eq!(build(), build());
    }
}
