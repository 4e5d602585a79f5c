//! Tile-grid planning.
//!
//! [`plan_grid`] cuts a source region into row-major tiles and maps each one
//! to its rectangle on the downsampled canvas. Both sets of rectangles
//! partition their space exactly: edge tiles shrink to the remainder and no
//! tile is ever empty.

use crate::core::error::ConfigError;
use crate::core::region::{align_up, scale_ceil, Rect, Size};
use serde::{Deserialize, Serialize};

/// One unit of work: a source rectangle and the canvas rectangle it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Grid column
    pub col: u32,
    /// Grid row
    pub row: u32,
    /// Row-major position in the grid
    pub index: usize,
    /// Rectangle in source-pixel space (absolute image coordinates)
    pub source: Rect,
    /// Rectangle on the destination canvas (canvas coordinates)
    pub dest: Rect,
}

/// Ordered tiles covering a region at one pyramid level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileGrid {
    tiles: Vec<Tile>,
    cols: u32,
    rows: u32,
    tile_size: Size,
    region: Rect,
    level: u32,
    dest_size: Size,
}

impl TileGrid {
    /// Tiles in row-major order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Tile at (`col`, `row`).
    pub fn tile(&self, col: u32, row: u32) -> Option<&Tile> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        self.tiles.get((row * self.cols + col) as usize)
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Nominal source tile size (edge tiles may be smaller).
    pub fn tile_size(&self) -> Size {
        self.tile_size
    }

    /// Nominal destination tile size.
    pub fn dest_tile_size(&self) -> Size {
        self.tile_size.scaled_to_level(self.level)
    }

    /// Source region being covered.
    pub fn region(&self) -> Rect {
        self.region
    }

    /// Pyramid level the grid targets.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Canvas size: `ceil(region / 2^level)`.
    pub fn dest_size(&self) -> Size {
        self.dest_size
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }
}

impl<'a> IntoIterator for &'a TileGrid {
    type Item = &'a Tile;
    type IntoIter = std::slice::Iter<'a, Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

/// Integer scale factor `2^level`, saturated to u32.
pub fn scale_factor(level: u32) -> u64 {
    1u64 << level.min(32)
}

/// Plan the tiles covering `region` with nominal tile `tile` at pyramid `level`.
///
/// A nominal tile that is not a multiple of `2^level` is rounded up to the next
/// multiple so that every tile starts on a whole destination pixel.
pub fn plan_grid(region: Rect, tile: Size, level: u32) -> Result<TileGrid, ConfigError> {
    if region.is_empty() {
        return Err(ConfigError::EmptyRegion);
    }
    if tile.is_empty() {
        return Err(ConfigError::InvalidTileSize {
            width: tile.width,
            height: tile.height,
        });
    }
    let scale = scale_factor(level);
    if (tile.width as u64) < scale || (tile.height as u64) < scale {
        return Err(ConfigError::TileSmallerThanScale {
            tile,
            scale: scale.min(u32::MAX as u64) as u32,
        });
    }

    let scale = scale as u32;
    let tile = Size::new(align_up(tile.width, scale), align_up(tile.height, scale));
    let cols = region.width.div_ceil(tile.width);
    let rows = region.height.div_ceil(tile.height);

    let mut tiles = Vec::with_capacity(cols as usize * rows as usize);
    for row in 0..rows {
        let y = row * tile.height;
        let height = tile.height.min(region.height - y);
        for col in 0..cols {
            let x = col * tile.width;
            let width = tile.width.min(region.width - x);
            let dest_x = scale_ceil(x, level);
            let dest_y = scale_ceil(y, level);
            tiles.push(Tile {
                col,
                row,
                index: tiles.len(),
                source: Rect::new(region.x + x, region.y + y, width, height),
                dest: Rect::new(
                    dest_x,
                    dest_y,
                    scale_ceil(x + width, level) - dest_x,
                    scale_ceil(y + height, level) - dest_y,
                ),
            });
        }
    }

    Ok(TileGrid {
        tiles,
        cols,
        rows,
        tile_size: tile,
        region,
        level,
        dest_size: region.size().scaled_to_level(level),
    })
}
