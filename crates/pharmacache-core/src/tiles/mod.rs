//! Offline map tiles: upstream fetching, on-disk storage with background
//! prefetch, and a loopback origin that serves the cached files.

mod origin;
mod source;
pub(crate) mod store;

pub use origin::{parse_tile_path, OriginError, TileOrigin};
pub use source::{HttpTileSource, TileError, TileSource};
pub use store::{PrefetchProgress, PrefetchReport, PrefetchSettings, TileStore};
