//! Streaming tiles into an output container.
//!
//! A [`TiledWriter`] owns one codec writer for one series. It announces the
//! series once, then accepts tiles from any thread, cutting each tile into
//! the planes of the series' channel layout.

use crate::codec::{RegionWriter, SeriesDescriptor, TileDescriptor};
use crate::core::buffer::PixelBlock;
use crate::core::error::{EngineResult, TileError, TileResult};
use crate::core::region::Rect;
use crate::core::types::ChannelLayout;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Writer for one tiled output series.
pub struct TiledWriter {
    writer: Mutex<Box<dyn RegionWriter>>,
    series: SeriesDescriptor,
    layout: ChannelLayout,
    cols: u32,
    planes_written: AtomicUsize,
}

impl std::fmt::Debug for TiledWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledWriter")
            .field("series", &self.series)
            .field("planes_written", &self.planes_written())
            .finish()
    }
}

impl TiledWriter {
    /// Start `series` on `writer`. The writer is closed if the series cannot
    /// be started.
    pub fn begin(mut writer: Box<dyn RegionWriter>, series: SeriesDescriptor) -> EngineResult<Self> {
        if let Err(e) = writer.begin_series(&series) {
            if let Err(close_err) = writer.close() {
                log::warn!("failed to close writer: {}", close_err);
            }
            return Err(e);
        }
        let layout = series.layout;
        let cols = series.geometry.width.div_ceil(series.tile.width.max(1));
        log::debug!(
            "series {} tiled {} ({:?} channels)",
            series.geometry,
            series.tile,
            layout
        );
        Ok(Self {
            writer: Mutex::new(writer),
            series,
            layout,
            cols,
            planes_written: AtomicUsize::new(0),
        })
    }

    pub fn series(&self) -> &SeriesDescriptor {
        &self.series
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Planes written per tile.
    pub fn plane_count(&self) -> usize {
        self.layout.plane_count(self.series.geometry.channels)
    }

    /// Number of `write_region` calls issued.
    pub fn planes_written(&self) -> usize {
        self.planes_written.load(Ordering::SeqCst)
    }

    /// Descriptor of grid tile (`col`, `row`).
    pub fn descriptor(&self, col: u32, row: u32) -> TileDescriptor {
        TileDescriptor {
            col,
            row,
            index: (row as usize) * (self.cols as usize) + col as usize,
            tile: self.series.tile,
        }
    }

    /// Fit `block` to `dest`: larger blocks are cropped, smaller ones rejected.
    fn fit(&self, block: &PixelBlock, dest: Rect) -> TileResult<PixelBlock> {
        let geometry = &self.series.geometry;
        if block.channels() != geometry.channels || block.sample_type() != geometry.sample_type {
            return Err(TileError::encode(
                dest,
                format!(
                    "tile has {} channel(s) of {}, series has {} of {}",
                    block.channels(),
                    block.sample_type(),
                    geometry.channels,
                    geometry.sample_type
                ),
            ));
        }
        if block.width() < dest.width || block.height() < dest.height {
            return Err(TileError::SizeMismatch {
                expected: dest.size(),
                actual: block.size(),
            });
        }
        if block.size() == dest.size() {
            Ok(block.clone())
        } else {
            block.crop(Rect::from_size(dest.size()))
        }
    }

    /// Write every plane of one tile.
    pub fn write_tile(&self, tile: &TileDescriptor, dest: Rect, block: &PixelBlock) -> TileResult<()> {
        let fitted = self.fit(block, dest)?;
        let planes = fitted.to_layout_planes(self.layout);
        let mut writer = self.writer.lock();
        for (channel, plane) in planes.iter().enumerate() {
            writer.write_region(channel, plane, tile, dest)?;
            self.planes_written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Write plane `plane` of one tile. For fused layouts the only plane is 0.
    pub fn write_plane(
        &self,
        plane: usize,
        tile: &TileDescriptor,
        dest: Rect,
        block: &PixelBlock,
    ) -> TileResult<()> {
        if plane >= self.plane_count() {
            return Err(TileError::encode(dest, format!("no plane {}", plane)));
        }
        let fitted = self.fit(block, dest)?;
        let bytes = match self.layout {
            ChannelLayout::Separate => fitted.plane(plane).to_vec(),
            ChannelLayout::Fused => fitted.to_interleaved(),
        };
        self.writer.lock().write_region(plane, &bytes, tile, dest)?;
        self.planes_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Finalize the container.
    pub fn close(self) -> EngineResult<()> {
        log::debug!("closing series after {} plane write(s)", self.planes_written());
        self.writer.into_inner().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MemoryCodec, PixelCodec};
    use crate::core::config::Compression;
    use crate::core::region::Size;
    use crate::core::types::{ImageGeometry, SampleType};
    use std::path::Path;

    fn open(codec: &MemoryCodec, channels: usize, ty: SampleType) -> TiledWriter {
        let geometry = ImageGeometry::new(20, 10, channels, ty).unwrap();
        let series = SeriesDescriptor::new(geometry, Size::new(8, 8), Compression::Lzw);
        TiledWriter::begin(codec.create(Path::new("out.img")).unwrap(), series).unwrap()
    }

    #[test]
    fn test_layout_follows_channel_rule() {
        let codec = MemoryCodec::new();
        let rgb8 = open(&codec, 3, SampleType::U8);
        assert_eq!(rgb8.layout(), ChannelLayout::Fused);
        assert_eq!(rgb8.plane_count(), 1);
        rgb8.close().unwrap();

        let rgb16 = open(&codec, 3, SampleType::U16);
        assert_eq!(rgb16.layout(), ChannelLayout::Separate);
        assert_eq!(rgb16.plane_count(), 3);
        rgb16.close().unwrap();
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_oversized_tiles_are_cropped() {
        let codec = MemoryCodec::new();
        let writer = open(&codec, 1, SampleType::U8);
        let block = PixelBlock::from_fn(Size::new(8, 8), 1, SampleType::U8, |_, x, y| (x + y * 8) as f64);
        // edge tile of a 20x10 image
        let dest = Rect::new(16, 8, 4, 2);
        writer.write_tile(&writer.descriptor(2, 1), dest, &block).unwrap();
        writer.close().unwrap();

        let out = codec.output("out.img").unwrap();
        assert_eq!(out.series.len(), 1);
        assert_eq!(out.writes[0].rect, dest);
        assert_eq!(out.writes[0].tile.index, 5);
        let written = out.block.unwrap();
        assert_eq!(written.sample(0, 19, 9), block.sample(0, 3, 1));
    }

    #[test]
    fn test_undersized_tile_is_size_mismatch() {
        let codec = MemoryCodec::new();
        let writer = open(&codec, 2, SampleType::U8);
        let block = PixelBlock::new(Size::new(3, 8), 2, SampleType::U8);
        let err = writer
            .write_tile(&writer.descriptor(0, 0), Rect::new(0, 0, 8, 8), &block)
            .unwrap_err();
        assert!(matches!(err, TileError::SizeMismatch { .. }));
        assert!(err.is_encode());
        writer.close().unwrap();
    }

    #[test]
    fn test_separate_planes_written_per_channel() {
        let codec = MemoryCodec::new();
        let writer = open(&codec, 2, SampleType::U8);
        let block = PixelBlock::from_fn(Size::new(8, 8), 2, SampleType::U8, |c, _, _| c as f64 + 1.0);
        writer.write_tile(&writer.descriptor(0, 0), Rect::new(0, 0, 8, 8), &block).unwrap();
        writer.write_plane(1, &writer.descriptor(1, 0), Rect::new(8, 0, 8, 8), &block).unwrap();
        assert!(writer.write_plane(2, &writer.descriptor(1, 0), Rect::new(8, 0, 8, 8), &block).is_err());
        assert_eq!(writer.planes_written(), 3);
        writer.close().unwrap();

        let out = codec.output("out.img").unwrap();
        let channels: Vec<_> = out.writes.iter().map(|w| w.channel).collect();
        assert_eq!(channels, vec![0, 1, 1]);
        let written = out.block.unwrap();
        assert_eq!(written.sample(1, 9, 0), 2.0);
        assert_eq!(written.sample(0, 9, 0), 0.0);
    }
}
