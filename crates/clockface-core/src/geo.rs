//! Great-circle distance and geofence checks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius used by the Haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Default attendance geofence radius, in meters.
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 100.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("invalid coordinate: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject non-finite or out-of-range values.
    pub fn validate(&self) -> Result<(), GeoError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(GeoError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// Haversine distance between two coordinates, in meters.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> Result<f64, GeoError> {
    a.validate()?;
    b.validate()?;

    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1.0 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();

    Ok(EARTH_RADIUS_M * c)
}

/// Authorized area around a fixed anchor. Server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub anchor: Coordinate,
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(anchor: Coordinate, radius_m: f64) -> Self {
        Self { anchor, radius_m }
    }

    /// Distance from the anchor and whether it falls inside the radius.
    pub fn check(&self, position: Coordinate) -> Result<(f64, bool), GeoError> {
        let d = distance_meters(self.anchor, position)?;
        Ok((d, d <= self.radius_m))
    }
}
