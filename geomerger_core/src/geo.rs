//! Planar geo distances.
//!
//! Lengths of a degree of latitude/longitude are taken from the usual
//! WGS84 cosine series evaluated at the first point's latitude; the two
//! scaled deltas are then combined as if the earth were locally flat.
//! Good enough for deltas below roughly one degree of latitude.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// A geo coordinate (lat/lon in degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// The coordinate as a `[lat, lon]` vector, for component-wise math.
    #[inline]
    pub fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.lat, self.lon)
    }

    #[inline]
    pub fn from_vector(v: Vector2<f64>) -> Self {
        Self::new(v.x, v.y)
    }
}

/// Length of a degree of latitude in meters at `lat`.
pub fn meters_per_degree_lat(lat: f64) -> f64 {
    let lat_rad = lat.to_radians();
    111_132.92 - 559.82 * (2.0 * lat_rad).cos() + 1.175 * (4.0 * lat_rad).cos()
        - 0.0023 * (6.0 * lat_rad).cos()
}

/// Length of a degree of longitude in meters at `lat`.
pub fn meters_per_degree_lon(lat: f64) -> f64 {
    let lat_rad = lat.to_radians();
    111_412.84 * lat_rad.cos() - 93.5 * (3.0 * lat_rad).cos() + 0.118 * (5.0 * lat_rad).cos()
}

/// Euclidean distance in meters between `a` and `b`.
///
/// Both degree lengths are evaluated at `a.lat`, so accuracy decreases with
/// absolute latitude and with the latitude delta between the two points.
pub fn distance_m(a: &Coordinate, b: &Coordinate) -> f64 {
    let delta = Vector2::new(
        (a.lat - b.lat) * meters_per_degree_lat(a.lat),
        (a.lon - b.lon) * meters_per_degree_lon(a.lat),
    );
    delta.norm()
}

/// Offsets `origin` by `north_m`/`east_m` meters using the same degree lengths.
pub fn offset_m(origin: &Coordinate, north_m: f64, east_m: f64) -> Coordinate {
    Coordinate::new(
        origin.lat + north_m / meters_per_degree_lat(origin.lat),
        origin.lon + east_m / meters_per_degree_lon(origin.lat),
    )
}
