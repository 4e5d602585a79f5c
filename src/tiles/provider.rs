//! Tile-by-tile access to one resolution level of an image.
//!
//! Providers address tiles by grid position at a fixed level. Edge tiles are
//! clipped to the level image, so every returned block has exactly the size
//! of its [`TileProvider::tile_rect`].

use crate::core::buffer::PixelBlock;
use crate::core::error::{EngineResult, TileError};
use crate::core::region::{Rect, Size};
use crate::core::types::ImageGeometry;
use crate::execution::pool::ReaderPool;
use crate::execution::progress::CancellationToken;
use crate::planning::grid::scale_factor;

/// Source of fixed-size tiles over one resolution level.
pub trait TileProvider: Send + Sync {
    /// Geometry of the level image.
    fn geometry(&self) -> ImageGeometry;

    /// Nominal tile size.
    fn tile_size(&self) -> Size;

    /// Decode the tile at (`col`, `row`).
    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock>;

    /// Number of tile columns.
    fn cols(&self) -> u32 {
        self.geometry().width.div_ceil(self.tile_size().width.max(1))
    }

    /// Number of tile rows.
    fn rows(&self) -> u32 {
        self.geometry().height.div_ceil(self.tile_size().height.max(1))
    }

    /// Level-space rectangle of a tile, clipped to the image. `None` outside
    /// the grid.
    fn tile_rect(&self, col: u32, row: u32) -> Option<Rect> {
        let tile = self.tile_size();
        if col >= self.cols() || row >= self.rows() {
            return None;
        }
        let nominal = Rect::new(col * tile.width, row * tile.height, tile.width, tile.height);
        self.geometry().bounds().intersection(&nominal)
    }
}

/// Rectangle of the full-resolution image that downsamples to `rect` at `level`.
pub(crate) fn source_rect(rect: Rect, level: u32, full: Size) -> Rect {
    let scale = scale_factor(level);
    let clip = |v: u64, max: u32| v.min(max as u64) as u32;
    let x0 = clip(rect.x as u64 * scale, full.width);
    let y0 = clip(rect.y as u64 * scale, full.height);
    let x1 = clip(rect.right() as u64 * scale, full.width);
    let y1 = clip(rect.bottom() as u64 * scale, full.height);
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

pub(crate) fn outside_grid(col: u32, row: u32) -> TileError {
    TileError::decode(
        Rect::new(col, row, 0, 0),
        format!("tile ({}, {}) is outside the grid", col, row),
    )
}

/// Tiles decoded straight from pooled readers, one codec call per tile.
pub struct DirectTileProvider {
    pool: ReaderPool,
    level: u32,
    tile: Size,
    token: CancellationToken,
}

impl DirectTileProvider {
    pub fn new(pool: ReaderPool, level: u32, tile: Size) -> Self {
        Self {
            pool,
            level,
            tile,
            token: CancellationToken::new(),
        }
    }

    /// Abort blocked reader waits once `token` is set.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn pool(&self) -> &ReaderPool {
        &self.pool
    }

    /// Decode a level-space rectangle.
    pub fn read_level_rect(&self, rect: Rect) -> EngineResult<PixelBlock> {
        let full = self.pool.metadata().geometry.size();
        let source = source_rect(rect, self.level, full);
        let mut reader = self.pool.acquire(&self.token)?;
        Ok(reader.read_region(source, self.level)?)
    }

    /// Close the pooled readers.
    pub fn close(self) -> EngineResult<()> {
        self.pool.close().map(|_| ())
    }
}

impl TileProvider for DirectTileProvider {
    fn geometry(&self) -> ImageGeometry {
        self.pool.metadata().geometry.at_level(self.level)
    }

    fn tile_size(&self) -> Size {
        self.tile
    }

    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock> {
        let rect = self.tile_rect(col, row).ok_or_else(|| outside_grid(col, row))?;
        self.read_level_rect(rect)
    }
}

/// Tiles cut from an image already in memory.
pub struct BlockTileProvider {
    block: PixelBlock,
    geometry: ImageGeometry,
    tile: Size,
}

impl BlockTileProvider {
    pub fn new(block: PixelBlock, tile: Size) -> EngineResult<Self> {
        let geometry = ImageGeometry::new(
            block.width(),
            block.height(),
            block.channels(),
            block.sample_type(),
        )?;
        Ok(Self {
            block,
            geometry,
            tile,
        })
    }

    pub fn block(&self) -> &PixelBlock {
        &self.block
    }
}

impl TileProvider for BlockTileProvider {
    fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    fn tile_size(&self) -> Size {
        self.tile
    }

    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock> {
        let rect = self.tile_rect(col, row).ok_or_else(|| outside_grid(col, row))?;
        Ok(self.block.crop(rect)?)
    }
}
