//! # Bigimage - Tiled transcoding of very large images
//!
//! Bigimage loads, downsamples and re-encodes images too large to hold in
//! memory comfortably. Every operation is cut into a grid of tiles that a
//! bounded worker pool decodes, resamples and places under an explicit
//! memory ceiling.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bigimage::prelude::*;
//!
//! let codec = RasterCodec::new();
//! let importer = LargeImageImporter::new(&codec, EngineConfig::default());
//! let request = ImportRequest::new("slide.tif")
//!     .with_region(Rect::new(1000, 1000, 4096, 4096))
//!     .with_resolution(Resolution::Level(2));
//! let image = importer.import(&request)?;
//! println!("{}", image.pixels.size());
//! # Ok::<(), bigimage::core::error::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: geometry values, pixel blocks, errors and configuration
//! - [`planning`]: tile grids and memory-driven tile sizing
//! - [`execution`]: worker pool, reader pool, progress and cancellation
//! - [`codec`]: the boundary to pixel codecs, with in-memory and raster backends
//! - [`tiles`]: tile providers, including the two-level cache
//! - [`assembly`]: canvas assembly and tiled output
//! - [`pipeline`]: import, export, pyramid and slicing operations

#![warn(clippy::all)]

pub mod assembly;
pub mod codec;
pub mod core;
pub mod execution;
pub mod pipeline;
pub mod planning;
pub mod tiles;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use bigimage::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::buffer::PixelBlock;
    pub use crate::core::config::{Compression, EngineConfig};
    pub use crate::core::region::{Rect, Size};
    pub use crate::core::types::{ChannelLayout, ImageGeometry, PixelSize, SampleType};

    // Errors
    pub use crate::core::error::{ConfigError, EngineError, EngineResult, TileError, TileResult};

    // Planning
    pub use crate::planning::budget::{plan_tile_size, MemoryBudget, TileSizing};
    pub use crate::planning::grid::{plan_grid, Tile, TileGrid};

    // Execution
    pub use crate::execution::pool::ReaderPool;
    pub use crate::execution::progress::{
        CancellationToken, LogProgressSink, ProgressSink, ProgressTracker, ProgressUpdate,
    };
    pub use crate::execution::scheduler::{JobContext, TileScheduler};

    // Codecs
    pub use crate::codec::{
        MemoryCodec, PixelCodec, RasterCodec, RegionReader, RegionWriter, SeriesDescriptor,
        SourceMetadata,
    };

    // Tiles and assembly
    pub use crate::assembly::{Canvas, TiledWriter};
    pub use crate::tiles::{
        BlockTileProvider, CacheStats, DirectTileProvider, ThresholdedTileProvider, TileCache,
        TileProvider,
    };

    // Operations
    pub use crate::pipeline::{
        ImportRequest, LargeImageImporter, PyramidDriver, Resolution, SliceOptions, TileExporter,
        TileSlicer,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
