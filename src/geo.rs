//! Geographic primitives: WGS-84 points, great-circle distance, the
//! `"lat;lng"` header format and point-in-polygon for boundary lookup.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Earth radius in meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Checked constructor for coordinates coming from clients.
    pub fn checked(lat: f64, lng: f64) -> Result<Self, EngineError> {
        if !lat.is_finite() || !lng.is_finite() || lat.abs() > 90.0 || lng.abs() > 180.0 {
            return Err(EngineError::invalid(format!(
                "coordinates out of range: {lat};{lng}"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lng = (other.lng - self.lng).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().min(1.0).asin()
    }

    pub fn within(&self, center: &GeoPoint, radius_m: f64) -> bool {
        self.distance_to(center) <= radius_m
    }
}

/// Parses the location header: `"lat;lng"` in decimal degrees.
impl FromStr for GeoPoint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(';').collect();
        if fields.len() != 2 {
            return Err(EngineError::invalid(format!("malformed location: {s:?}")));
        }
        let lat: f64 = fields[0]
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid(format!("malformed latitude: {:?}", fields[0])))?;
        let lng: f64 = fields[1]
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid(format!("malformed longitude: {:?}", fields[1])))?;
        GeoPoint::checked(lat, lng)
    }
}

/// A boundary geometry as stored: GeoJSON `Polygon` or `MultiPolygon`
/// coordinates, `[lng, lat]` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Vec<[f64; 2]>>),
    MultiPolygon(Vec<Vec<Vec<[f64; 2]>>>),
}

impl Geometry {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        match self {
            Geometry::Polygon(rings) => polygon_contains(rings, point),
            Geometry::MultiPolygon(polygons) => {
                polygons.iter().any(|rings| polygon_contains(rings, point))
            }
        }
    }
}

// First ring is the shell, the rest are holes.
fn polygon_contains(rings: &[Vec<[f64; 2]>], point: &GeoPoint) -> bool {
    let Some((shell, holes)) = rings.split_first() else {
        return false;
    };
    ring_contains(shell, point) && !holes.iter().any(|hole| ring_contains(hole, point))
}

fn ring_contains(ring: &[[f64; 2]], point: &GeoPoint) -> bool {
    let (x, y) = (point.lng, point.lat);
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
