use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::location::distance_km;

/// Fallback display name for unnamed pharmacies
const DEFAULT_NAME: &str = "Pharmacie";

/// A pharmacy returned by a nearby search.
///
/// `distance_km` is relative to the query point that produced (or read back)
/// the record, so it is recomputed whenever a cached result is served for a
/// different exact position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PharmacyRecord {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub distance_km: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Building outline as `[lat, lon]` pairs for area-type entries.
    #[serde(default)]
    pub geometry: Vec<[f64; 2]>,
}

impl PharmacyRecord {
    pub fn new(id: impl Into<String>, name: Option<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
            latitude,
            longitude,
            address: None,
            phone: None,
            opening_hours: None,
            distance_km: 0.0,
            tags: HashMap::new(),
            geometry: Vec::new(),
        }
    }

    pub fn compute_distance_from(&mut self, lat: f64, lon: f64) {
        self.distance_km = distance_km(lat, lon, self.latitude, self.longitude);
    }

    pub fn formatted_distance(&self) -> String {
        if self.distance_km < 1.0 {
            format!("{:.0} m", self.distance_km * 1000.0)
        } else {
            format!("{:.2} km", self.distance_km)
        }
    }

    pub fn has_geometry(&self) -> bool {
        !self.geometry.is_empty()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Recompute distances relative to `(lat, lon)` and order nearest first.
pub fn rank_by_distance(records: &mut [PharmacyRecord], lat: f64, lon: f64) {
    for record in records.iter_mut() {
        record.compute_distance_from(lat, lon);
    }
    records.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name() {
        let p = PharmacyRecord::new("node/1", None, 0.0, 0.0);
        assert_eq!(p.name, "Pharmacie");
    }

    #[test]
    fn test_formatted_distance() {
        let mut p = PharmacyRecord::new("node/1", Some("A".into()), 0.0, 0.0);
        p.distance_km = 0.4321;
        assert_eq!(p.formatted_distance(), "432 m");
        p.distance_km = 2.5;
        assert_eq!(p.formatted_distance(), "2.50 km");
    }

    #[test]
    fn test_rank_by_distance_orders_nearest_first() {
        let mut records = vec![
            PharmacyRecord::new("far", None, 33.60, -7.58),
            PharmacyRecord::new("near", None, 33.574, -7.590),
        ];
        rank_by_distance(&mut records, 33.5731, -7.5898);
        assert_eq!(records[0].id, "near");
        assert!(records[0].distance_km < records[1].distance_km);
    }
}
