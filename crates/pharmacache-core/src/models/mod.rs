//! Data models for the geo cache.
//!
//! - `LocationKey`, `UserLocation`: quantized cache keys and user position
//! - `PharmacyRecord`: a pharmacy search result
//! - `MapViewState`: last map view
//! - `TileCoordinate`: slippy-map tile address

pub mod location;
pub mod map_state;
pub mod pharmacy;
pub mod tile;

pub use location::{distance_km, CoordError, LocationKey, UserLocation};
pub use map_state::MapViewState;
pub use pharmacy::{rank_by_distance, PharmacyRecord};
pub use tile::TileCoordinate;
