//! Coordinate reference systems and bounding boxes.
//!
//! Provides the small geometry vocabulary shared by the filter compiler,
//! the tile query builder, and the tile store: CRS identifiers with a
//! unit-of-measure classification, and axis-aligned bounding boxes with
//! the clipping math used for tile queries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Minimum valid WGS84 longitude in degrees.
pub const MIN_LON: f64 = -180.0;

/// Maximum valid WGS84 longitude in degrees.
pub const MAX_LON: f64 = 180.0;

/// Minimum valid WGS84 latitude in degrees.
pub const MIN_LAT: f64 = -90.0;

/// Maximum valid WGS84 latitude in degrees.
pub const MAX_LAT: f64 = 90.0;

/// Unit of measure of a CRS axis.
///
/// Drives the coordinate-precision hint on tile queries: linear units map
/// to a "meter"/"metre" precision entry, angular units to "degree".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrsUnit {
    /// Linear axis unit (projected CRS).
    Metre,
    /// Angular axis unit (geographic CRS).
    Degree,
    /// Unit not covered by the built-in table.
    Unknown,
}

impl fmt::Display for CrsUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metre => write!(f, "metre"),
            Self::Degree => write!(f, "degree"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A coordinate reference system identified by its EPSG code.
///
/// Axis order is not modeled; bounding boxes in geographic CRSs are always
/// expressed longitude-first, matching the request parameter convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs {
    code: u32,
}

impl Crs {
    /// WGS84 longitude/latitude (OGC CRS84, EPSG 4326).
    pub const CRS84: Crs = Crs { code: 4326 };

    /// Web Mercator (EPSG 3857), the CRS of the default tiling scheme.
    pub const WEB_MERCATOR: Crs = Crs { code: 3857 };

    /// Creates a CRS from an EPSG code.
    pub const fn epsg(code: u32) -> Self {
        Self { code }
    }

    /// Returns the EPSG code.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Classifies the axis unit of this CRS.
    ///
    /// The table covers the geographic and projected systems commonly used
    /// for tiling; anything else reports [`CrsUnit::Unknown`] so callers
    /// can skip unit-dependent behavior instead of guessing.
    pub fn unit(&self) -> CrsUnit {
        match self.code {
            // Geographic (angular) systems
            4326 | 4258 | 4269 => CrsUnit::Degree,
            // Mercator family and common national projected systems
            3857 | 3395 | 2056 | 27700 => CrsUnit::Metre,
            // ETRS89 / UTM zones
            25828..=25838 => CrsUnit::Metre,
            // WGS84 / UTM zones, north and south
            32601..=32660 | 32701..=32760 => CrsUnit::Metre,
            _ => CrsUnit::Unknown,
        }
    }

    /// Parses a CRS identifier as used in query parameters.
    ///
    /// Accepts the `EPSG:<code>` shorthand plus the OGC URI and URN
    /// forms for EPSG codes and for CRS84. Bare numbers are rejected;
    /// a stray numeric value must not silently turn into a CRS.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        for alias in [
            "CRS84",
            "OGC:CRS84",
            "http://www.opengis.net/def/crs/OGC/1.3/CRS84",
            "urn:ogc:def:crs:OGC:1.3:CRS84",
        ] {
            if value.eq_ignore_ascii_case(alias) {
                return Some(Self::CRS84);
            }
        }

        if value.len() >= 5 && value[..5].eq_ignore_ascii_case("EPSG:") {
            return value[5..].parse().ok().map(Self::epsg);
        }
        if let Some(rest) = value.strip_prefix("http://www.opengis.net/def/crs/EPSG/") {
            return rest.rsplit('/').next()?.parse().ok().map(Self::epsg);
        }
        if let Some(rest) = value.strip_prefix("urn:ogc:def:crs:EPSG:") {
            return rest.rsplit(':').next()?.parse().ok().map(Self::epsg);
        }
        None
    }
}

impl Default for Crs {
    fn default() -> Self {
        Self::CRS84
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.code)
    }
}

/// An axis-aligned bounding box in a known CRS.
///
/// For geographic CRSs the axes are longitude (x) and latitude (y).
/// `min_x > max_x` is legal in CRS84 and denotes a box crossing the
/// antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub crs: Crs,
}

impl BoundingBox {
    /// Creates a bounding box from corner coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs,
        }
    }

    /// Clips this box against another box in the same CRS.
    ///
    /// Takes the component-wise maximum of the minima and minimum of the
    /// maxima. Used to restrict a tile's bounding box to the area where
    /// data exists, which keeps CRS transforms stable at large scales.
    ///
    /// Disjoint inputs produce an inverted (empty) box; a spatial
    /// predicate over an empty box matches nothing, which is the intended
    /// outcome for tiles entirely outside the data extent.
    pub fn clip(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
            crs: self.crs,
        }
    }

    /// Width of the box along the x axis.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the box along the y axis.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{}] ({})",
            self.min_x, self.min_y, self.max_x, self.max_y, self.crs
        )
    }
}
