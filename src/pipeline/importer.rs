//! Import of a region of a large image into memory.
//!
//! The import plans a grid at the requested level, fits the tile size to the
//! memory ceiling, then decodes tiles on the worker pool through a bounded
//! pool of readers and places them on a shared canvas.

use crate::assembly::canvas::Canvas;
use crate::codec::{PixelCodec, SourceMetadata, StagePosition};
use crate::core::buffer::PixelBlock;
use crate::core::config::EngineConfig;
use crate::core::error::{ConfigError, EngineResult};
use crate::core::region::{align_up, Rect, Size};
use crate::core::types::ImageGeometry;
use crate::execution::pool::ReaderPool;
use crate::execution::progress::{CancellationToken, ProgressSink, ProgressTracker};
use crate::execution::scheduler::TileScheduler;
use crate::planning::budget::{plan_tile_size, Backoff, MemoryBudget, MemoryTracker, TileSizing};
use crate::planning::grid::{plan_grid, scale_factor, TileGrid};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Highest level a cap search will try.
const MAX_LEVEL: u32 = 31;

/// Target resolution of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Downsample by `2^r`.
    Level(u32),
    /// Smallest downsampling that fits within the given size.
    FitWithin(Size),
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Level(0)
    }
}

impl Resolution {
    /// Pyramid level for a region of `size`.
    pub fn level_for(&self, size: Size) -> Result<u32, ConfigError> {
        match *self {
            Resolution::Level(level) if level > MAX_LEVEL => Err(ConfigError::LevelRange {
                start: level,
                end: MAX_LEVEL,
            }),
            Resolution::Level(level) => Ok(level),
            Resolution::FitWithin(max) => {
                if max.is_empty() {
                    return Err(ConfigError::EmptyRegion);
                }
                Ok((0..=MAX_LEVEL)
                    .find(|&r| max.contains(size.scaled_to_level(r)))
                    .unwrap_or(MAX_LEVEL))
            }
        }
    }
}

/// What to import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub path: PathBuf,
    /// Region in full-resolution pixels; `None` or empty for the whole image
    pub region: Option<Rect>,
    pub resolution: Resolution,
    /// Tile size; defaults to the native tile of the source
    pub tile: Option<Size>,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            region: None,
            resolution: Resolution::default(),
            tile: None,
        }
    }

    pub fn with_region(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_tile(mut self, tile: Size) -> Self {
        self.tile = Some(tile);
        self
    }
}

/// Resolved geometry of an import, computed before any pixel is decoded.
#[derive(Debug, Clone)]
pub struct ImportPlan {
    /// Region clipped to the image
    pub region: Rect,
    pub level: u32,
    pub grid: TileGrid,
    pub sizing: TileSizing,
    /// Geometry of the imported image
    pub geometry: ImageGeometry,
}

/// An imported region and its physical placement.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedImage {
    pub pixels: PixelBlock,
    /// Geometry with pixel size scaled by the level
    pub geometry: ImageGeometry,
    pub level: u32,
    pub region: Rect,
    /// Stage position of the region origin
    pub position: StagePosition,
    pub name: String,
}

/// Intersect a requested region with the image.
pub fn normalize_region(region: Option<Rect>, bounds: Rect) -> Result<Rect, ConfigError> {
    match region {
        None => Ok(bounds),
        Some(r) if r.is_empty() => Ok(bounds),
        Some(r) if !r.has_valid_extent() => Err(ConfigError::RegionOutOfBounds { region: r, bounds }),
        Some(r) => bounds
            .intersection(&r)
            .ok_or(ConfigError::RegionOutOfBounds { region: r, bounds }),
    }
}

/// Region importer.
pub struct LargeImageImporter<'a> {
    codec: &'a dyn PixelCodec,
    config: EngineConfig,
    token: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl<'a> LargeImageImporter<'a> {
    pub fn new(codec: &'a dyn PixelCodec, config: EngineConfig) -> Self {
        Self {
            codec,
            config,
            token: CancellationToken::new(),
            sink: None,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resolve region, level, tile size and grid for `request` against `metadata`.
    pub fn plan(&self, metadata: &SourceMetadata, request: &ImportRequest) -> EngineResult<ImportPlan> {
        if let Some(tile) = request.tile {
            if tile.is_empty() {
                return Err(ConfigError::InvalidTileSize {
                    width: tile.width,
                    height: tile.height,
                }
                .into());
            }
        }
        let geometry = metadata.geometry;
        let region = normalize_region(request.region, geometry.bounds())?;
        let level = request.resolution.level_for(region.size())?;
        let scale = scale_factor(level).min(u32::MAX as u64) as u32;

        let nominal = request.tile.unwrap_or_else(|| {
            Size::new(
                self.config.nominal_tile_edge(metadata.native_tile.width),
                self.config.nominal_tile_edge(metadata.native_tile.height),
            )
        });
        let start = Size::new(
            align_up(nominal.width.min(region.width), scale),
            align_up(nominal.height.min(region.height), scale),
        );

        let out_size = region.size().scaled_to_level(level);
        let out_geometry = geometry
            .resized(out_size)
            .with_pixel_size(metadata.pixel_size().at_level(level));
        let budget = MemoryBudget::new(
            self.config.effective_ceiling(),
            self.config.effective_workers(),
            geometry.bytes_per_pixel(),
        );
        let sizing = plan_tile_size(&budget, start, level, geometry.bytes_for(out_size))?;
        let grid = plan_grid(region, sizing.source_tile, level)?;

        Ok(ImportPlan {
            region,
            level,
            grid,
            sizing,
            geometry: out_geometry,
        })
    }

    /// Decode the requested region.
    pub fn import(&self, request: &ImportRequest) -> EngineResult<ImportedImage> {
        let pool = ReaderPool::open(self.codec, &request.path, self.config.effective_decoders())?;
        let result = self.import_with(&pool, request);
        let closed = pool.close();
        let image = result?;
        closed?;
        Ok(image)
    }

    fn import_with(&self, pool: &ReaderPool, request: &ImportRequest) -> EngineResult<ImportedImage> {
        let metadata = pool.metadata();
        let plan = self.plan(metadata, request)?;
        let grid = &plan.grid;
        let level = plan.level;
        log::info!(
            "importing {} of {} at level {}: {}x{} tiles of {} -> {}",
            plan.region,
            display_name(&request.path, metadata),
            level,
            grid.cols(),
            grid.rows(),
            grid.tile_size(),
            grid.dest_size()
        );

        let geometry = metadata.geometry;
        let canvas = Canvas::new(grid, geometry.channels, geometry.sample_type);
        let budget = MemoryBudget::new(
            self.config.effective_ceiling(),
            self.config.effective_workers(),
            geometry.bytes_per_pixel(),
        );
        let tracker = MemoryTracker::new(plan.sizing.remaining);
        let backoff = Backoff::from_millis(
            self.config.memory_poll_initial_ms,
            self.config.memory_poll_max_ms,
        );

        let mut progress = ProgressTracker::new(grid.len()).with_token(self.token.clone());
        if let Some(sink) = &self.sink {
            progress = progress.with_sink(sink.clone());
        }

        TileScheduler::new(self.config.effective_workers()).run(grid.tiles(), &progress, |ctx| {
            let tile = ctx.tile();
            let _reservation = tracker.reserve(
                budget.tile_cost(tile.source.size(), level),
                ctx.token(),
                backoff,
            )?;
            let block = {
                let mut reader = pool.acquire(ctx.token())?;
                reader.read_region(tile.source, level)?
            };
            ctx.checkpoint()?;
            canvas.place(tile, &block)?;
            Ok(())
        })?;
        log::debug!("peak tile memory {} bytes", tracker.peak_usage());

        let pixel_size = metadata.pixel_size();
        let origin = metadata.position;
        Ok(ImportedImage {
            pixels: canvas.into_block()?,
            geometry: plan.geometry,
            level,
            region: plan.region,
            position: StagePosition {
                x: origin.x + plan.region.x as f64 * pixel_size.x,
                y: origin.y + plan.region.y as f64 * pixel_size.y,
                z: origin.z,
            },
            name: metadata.name.clone(),
        })
    }
}

fn display_name(path: &Path, metadata: &SourceMetadata) -> String {
    if metadata.name.is_empty() {
        path.display().to_string()
    } else {
        metadata.name.clone()
    }
}
