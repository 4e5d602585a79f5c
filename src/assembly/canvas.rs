//! In-memory destination canvas.
//!
//! The canvas is split into one full-width band per grid row. A tile copy
//! locks only its own band, so workers on different rows never contend. Tile
//! bookkeeping (which tiles landed, which area is dirty) sits behind one small
//! lock taken once per tile.

use crate::core::buffer::PixelBlock;
use crate::core::error::{TileError, TileResult};
use crate::core::region::{Rect, Size};
use crate::core::types::SampleType;
use crate::planning::grid::{Tile, TileGrid};
use parking_lot::Mutex;

struct Band {
    y: u32,
    block: Mutex<PixelBlock>,
}

#[derive(Default)]
struct CanvasState {
    placed: Vec<bool>,
    count: usize,
    dirty: Option<Rect>,
}

/// Destination image assembled from tiles placed in any order.
pub struct Canvas {
    size: Size,
    channels: usize,
    sample_type: SampleType,
    bands: Vec<Band>,
    cols: u32,
    state: Mutex<CanvasState>,
}

impl Canvas {
    /// Zeroed canvas for the destination of `grid`.
    pub fn new(grid: &TileGrid, channels: usize, sample_type: SampleType) -> Self {
        let size = grid.dest_size();
        let bands = (0..grid.rows())
            .filter_map(|row| grid.tile(0, row))
            .map(|tile| Band {
                y: tile.dest.y,
                block: Mutex::new(PixelBlock::new(
                    Size::new(size.width, tile.dest.height),
                    channels,
                    sample_type,
                )),
            })
            .collect();
        Self {
            size,
            channels,
            sample_type,
            bands,
            cols: grid.cols(),
            state: Mutex::new(CanvasState {
                placed: vec![false; grid.len()],
                ..CanvasState::default()
            }),
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Bytes the canvas holds.
    pub fn byte_len(&self) -> u64 {
        self.size.area() * self.channels as u64 * self.sample_type.byte_width() as u64
    }

    /// Copy `block` into the canvas at `tile.dest`. The block must match the
    /// destination exactly and each tile may land once.
    pub fn place(&self, tile: &Tile, block: &PixelBlock) -> TileResult<()> {
        if block.size() != tile.dest.size() {
            return Err(TileError::SizeMismatch {
                expected: tile.dest.size(),
                actual: block.size(),
            });
        }
        if block.channels() != self.channels || block.sample_type() != self.sample_type {
            return Err(TileError::encode(
                tile.dest,
                format!(
                    "tile has {} channel(s) of {}, canvas has {} of {}",
                    block.channels(),
                    block.sample_type(),
                    self.channels,
                    self.sample_type
                ),
            ));
        }
        let band = self
            .bands
            .get(tile.row as usize)
            .filter(|_| tile.col < self.cols)
            .ok_or_else(|| TileError::encode(tile.dest, "tile is not part of this canvas"))?;

        {
            let mut state = self.state.lock();
            match state.placed.get_mut(tile.index) {
                Some(placed) if !*placed => *placed = true,
                Some(_) => return Err(TileError::encode(tile.dest, "tile placed twice")),
                None => return Err(TileError::encode(tile.dest, "tile is not part of this canvas")),
            }
        }

        let copied = tile
            .dest
            .y
            .checked_sub(band.y)
            .ok_or_else(|| TileError::encode(tile.dest, "tile is above its band"))
            .and_then(|y| block.copy_into(&mut band.block.lock(), tile.dest.x, y));

        let mut state = self.state.lock();
        if let Err(e) = copied {
            // Release the claim so a corrected tile can still land.
            if let Some(placed) = state.placed.get_mut(tile.index) {
                *placed = false;
            }
            return Err(e);
        }
        state.count += 1;
        state.dirty = Some(match state.dirty {
            Some(dirty) => dirty.union(&tile.dest),
            None => tile.dest,
        });
        Ok(())
    }

    /// Number of tiles placed so far.
    pub fn placed(&self) -> usize {
        self.state.lock().count
    }

    /// True once every tile of the grid has landed.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.count == state.placed.len()
    }

    /// Smallest rectangle covering every placed tile.
    pub fn dirty_bounds(&self) -> Option<Rect> {
        self.state.lock().dirty
    }

    /// Join the bands into one image.
    pub fn into_block(self) -> TileResult<PixelBlock> {
        let mut planes = vec![Vec::with_capacity(self.byte_len() as usize / self.channels.max(1)); self.channels];
        for band in self.bands {
            for (c, plane) in band.block.into_inner().into_planes().into_iter().enumerate() {
                planes[c].extend_from_slice(&plane);
            }
        }
        PixelBlock::from_planes(self.size, self.sample_type, planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::progress::{ProgressTracker, ProgressUpdate};
    use crate::execution::scheduler::TileScheduler;
    use crate::planning::grid::plan_grid;
    use std::sync::Arc;

    fn source(size: Size) -> PixelBlock {
        PixelBlock::from_fn(size, 3, SampleType::U8, |c, x, y| ((x + y * 3 + c as u32 * 17) % 256) as f64)
    }

    #[test]
    fn test_ten_tiles_assembled_by_four_workers() {
        let image = source(Size::new(50, 20));
        let grid = plan_grid(Rect::new(0, 0, 50, 20), Size::square(10), 0).unwrap();
        assert_eq!(grid.len(), 10);
        let canvas = Canvas::new(&grid, 3, SampleType::U8);

        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = notified.clone();
        let progress = ProgressTracker::new(grid.len()).with_callback(Box::new(move |u| {
            if let ProgressUpdate::TileCompleted { processed, .. } = u {
                sink.lock().push(processed);
            }
        }));
        TileScheduler::new(4)
            .run(grid.tiles(), &progress, |ctx| {
                let tile = ctx.tile();
                let block = image.crop(tile.source)?;
                canvas.place(tile, &block)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(notified.lock().len(), 10);
        assert_eq!(progress.processed(), 10);
        assert!(canvas.is_complete());
        assert_eq!(canvas.dirty_bounds(), Some(Rect::new(0, 0, 50, 20)));
        assert_eq!(canvas.into_block().unwrap(), image);
    }

    #[test]
    fn test_downsampled_tiles_fill_scaled_canvas() {
        let image = source(Size::new(37, 23));
        let grid = plan_grid(Rect::new(0, 0, 37, 23), Size::square(8), 1).unwrap();
        let canvas = Canvas::new(&grid, 3, SampleType::U8);
        for tile in grid.iter().rev() {
            let block = image.crop(tile.source).unwrap().downsample(1);
            canvas.place(tile, &block).unwrap();
        }
        let out = canvas.into_block().unwrap();
        assert_eq!(out.size(), Size::new(19, 12));
        assert_eq!(out, image.downsample(1));
    }

    #[test]
    fn test_rejects_wrong_size_and_double_placement() {
        let grid = plan_grid(Rect::new(0, 0, 20, 10), Size::square(10), 0).unwrap();
        let canvas = Canvas::new(&grid, 1, SampleType::U8);
        let tile = grid.tile(1, 0).unwrap();
        let small = PixelBlock::new(Size::new(9, 10), 1, SampleType::U8);
        assert!(matches!(
            canvas.place(tile, &small),
            Err(TileError::SizeMismatch { .. })
        ));
        let block = PixelBlock::new(Size::square(10), 1, SampleType::U8);
        canvas.place(tile, &block).unwrap();
        assert!(canvas.place(tile, &block).is_err());
        assert_eq!(canvas.placed(), 1);
        assert!(!canvas.is_complete());
        let wrong_type = PixelBlock::new(Size::square(10), 1, SampleType::U16);
        assert!(canvas.place(grid.tile(0, 0).unwrap(), &wrong_type).is_err());
    }

    #[test]
    fn test_failed_copy_leaves_tile_unplaced() {
        let grid = plan_grid(Rect::new(0, 0, 20, 10), Size::square(10), 0).unwrap();
        let canvas = Canvas::new(&grid, 1, SampleType::U8);
        let first = *grid.tile(0, 0).unwrap();
        let off_canvas = Tile {
            dest: Rect::new(15, 0, 10, 10),
            ..first
        };
        let block = PixelBlock::new(Size::square(10), 1, SampleType::U8);
        assert!(matches!(
            canvas.place(&off_canvas, &block),
            Err(TileError::SizeMismatch { .. })
        ));
        assert_eq!(canvas.placed(), 0);
        assert_eq!(canvas.dirty_bounds(), None);

        canvas.place(&first, &block).unwrap();
        assert_eq!(canvas.placed(), 1);
        assert_eq!(canvas.dirty_bounds(), Some(Rect::new(0, 0, 10, 10)));
    }
}
