//! Slippy-map tile addressing (Web Mercator).

use std::f64::consts::PI;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Highest zoom level accepted by the tile store.
pub const MAX_ZOOM: u8 = 19;

/// A tile in the standard `(zoom, x, y)` slippy-map grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoordinate {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Tile containing `(lat, lon)` at `zoom`.
    ///
    /// Both axes are clamped to `[0, 2^zoom - 1]`, so polar latitudes and
    /// the antimeridian land on the edge tiles instead of falling off the grid.
    pub fn from_lat_lon(lat: f64, lon: f64, zoom: u8) -> Self {
        let n = tiles_per_axis(zoom) as f64;
        let max = tiles_per_axis(zoom) as i64 - 1;

        let x = ((lon + 180.0) / 360.0 * n).floor();

        let lat_rad = lat.to_radians();
        let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();

        // `as i64` saturates on infinities and maps NaN to 0
        Self {
            zoom,
            x: (x as i64).clamp(0, max) as u32,
            y: (y as i64).clamp(0, max) as u32,
        }
    }

    /// Whether `x`/`y` are inside the grid for this zoom.
    pub fn is_valid(&self) -> bool {
        self.zoom <= MAX_ZOOM
            && u64::from(self.x) < tiles_per_axis(self.zoom)
            && u64::from(self.y) < tiles_per_axis(self.zoom)
    }

    /// Relative path of this tile under a cache root: `zoom/x/y.png`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.zoom.to_string())
            .join(self.x.to_string())
            .join(format!("{}.png", self.y))
    }

    /// Square neighbourhood of `radius` tiles around `self`, skipping cells
    /// outside the grid.
    pub fn neighbourhood(&self, radius: u32) -> Vec<TileCoordinate> {
        let n = tiles_per_axis(self.zoom) as i64;
        let r = i64::from(radius);
        let (cx, cy) = (i64::from(self.x), i64::from(self.y));

        let mut tiles = Vec::new();
        for x in (cx - r)..=(cx + r) {
            for y in (cy - r)..=(cy + r) {
                if x >= 0 && y >= 0 && x < n && y < n {
                    tiles.push(TileCoordinate::new(self.zoom, x as u32, y as u32));
                }
            }
        }
        tiles
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

pub fn tiles_per_axis(zoom: u8) -> u64 {
    1u64 << zoom.min(MAX_ZOOM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_york_city_at_zoom_16() {
        let tile = TileCoordinate::from_lat_lon(40.7128, -74.0060, 16);
        assert_eq!(tile.x, 19295);
        assert_eq!(tile.y, 24640);
        assert_eq!(tile.zoom, 16);
    }

    #[test]
    fn test_casablanca_at_zoom_13() {
        let tile = TileCoordinate::from_lat_lon(33.5731, -7.5898, 13);
        assert_eq!(tile.x, 3923);
        assert_eq!(tile.y, 3284);
    }

    #[test]
    fn test_poles_are_clamped() {
        let north = TileCoordinate::from_lat_lon(90.0, 0.0, 4);
        let south = TileCoordinate::from_lat_lon(-90.0, 0.0, 4);
        assert_eq!(north.y, 0);
        assert_eq!(south.y, 15);
    }

    #[test]
    fn test_antimeridian_is_clamped() {
        let tile = TileCoordinate::from_lat_lon(0.0, 180.0, 3);
        assert_eq!(tile.x, 7);
        assert!(tile.is_valid());
    }

    #[test]
    fn test_relative_path() {
        let tile = TileCoordinate::new(13, 3923, 3284);
        assert_eq!(tile.relative_path(), PathBuf::from("13/3923/3284.png"));
    }

    #[test]
    fn test_neighbourhood_skips_out_of_grid() {
        let corner = TileCoordinate::new(2, 0, 0);
        let tiles = corner.neighbourhood(1);
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().all(|t| t.is_valid()));

        let middle = TileCoordinate::new(10, 500, 500);
        assert_eq!(middle.neighbourhood(2).len(), 25);
    }

    #[test]
    fn test_is_valid() {
        assert!(TileCoordinate::new(0, 0, 0).is_valid());
        assert!(!TileCoordinate::new(0, 1, 0).is_valid());
        assert!(!TileCoordinate::new(MAX_ZOOM + 1, 0, 0).is_valid());
    }
}
