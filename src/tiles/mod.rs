//! Tile providers: direct, cached, in-memory and thresholded access to one
//! resolution level.

pub mod cache;
pub mod provider;
pub mod threshold;

pub use cache::{CacheStats, TileCache};
pub use provider::{BlockTileProvider, DirectTileProvider, TileProvider};
pub use threshold::ThresholdedTileProvider;
