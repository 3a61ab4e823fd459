//! Geographic primitives: quantized cache keys, user locations, distances.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Earth's mean radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Number of decimal places kept when quantizing coordinates.
/// Three places is roughly a 100 m cell.
const KEY_PRECISION: f64 = 1000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordError {
    #[error("Latitude must be between -90 and 90, got: {0}")]
    InvalidLatitude(f64),

    #[error("Longitude must be between -180 and 180, got: {0}")]
    InvalidLongitude(f64),
}

/// Quantized identifier for a ~100 m geographic cell.
///
/// Many nearby exact coordinates map to the same key. This is the unit of
/// cache addressing for pharmacy results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationKey(String);

impl LocationKey {
    pub fn from_coords(lat: f64, lon: f64) -> Self {
        Self(format!("{:.3},{:.3}", quantize(lat), quantize(lon)))
    }

    /// Wrap an already-formatted key, e.g. one read back from a snapshot.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Center of the cell this key addresses, if the key is well formed.
    pub fn center(&self) -> Option<(f64, f64)> {
        let (lat, lon) = self.0.split_once(',')?;
        Some((lat.parse().ok()?, lon.parse().ok()?))
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round to the key precision. Adding 0.0 folds -0.0 into 0.0 so cells
/// touching the equator or prime meridian don't get two spellings.
fn quantize(value: f64) -> f64 {
    (value * KEY_PRECISION).round() / KEY_PRECISION + 0.0
}

/// Great-circle distance in kilometers (haversine).
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// The user's last known position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
}

impl UserLocation {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordError> {
        validate(latitude, longitude)?;
        Ok(Self {
            latitude,
            longitude,
            city: None,
            country: None,
            address: None,
        })
    }

    pub fn with_place(mut self, city: Option<String>, country: Option<String>) -> Self {
        self.city = city;
        self.country = country;
        self
    }

    pub fn key(&self) -> LocationKey {
        LocationKey::from_coords(self.latitude, self.longitude)
    }

    pub fn distance_to(&self, other: &UserLocation) -> f64 {
        distance_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

pub fn validate(lat: f64, lon: f64) -> Result<(), CoordError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CoordError::InvalidLatitude(lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(CoordError::InvalidLongitude(lon));
    }
    Ok(())
}
