use serde::{Deserialize, Serialize};

/// Last map view: center, zoom and search text. Kept as a single slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapViewState {
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: u8,
    pub last_search: Option<String>,
}

impl MapViewState {
    pub fn new(latitude: f64, longitude: f64, zoom: u8, last_search: Option<String>) -> Self {
        Self {
            latitude,
            longitude,
            zoom,
            last_search,
        }
    }
}
