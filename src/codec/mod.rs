//! Pixel codec boundary.
//!
//! The engine never interprets a file format. It opens readers and writers
//! through a [`PixelCodec`] and moves [`PixelBlock`]s and raw tile bytes across
//! these traits, one call per tile.

pub mod memory;
pub mod raster;

pub use memory::{MemoryCodec, WriteRecord, WrittenImage};
pub use raster::RasterCodec;

use crate::core::buffer::PixelBlock;
use crate::core::config::Compression;
use crate::core::error::{EngineResult, TileError, TileResult};
use crate::core::region::{Rect, Size};
use crate::core::types::{ChannelLayout, ImageGeometry, PixelSize};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stage position of the image origin, in physical units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// What a reader knows about its image before decoding any pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Full-resolution geometry
    pub geometry: ImageGeometry,
    /// Native tile size; empty when the container is not tiled
    pub native_tile: Size,
    /// Image name
    pub name: String,
    /// Stage position of pixel (0, 0)
    pub position: StagePosition,
}

impl SourceMetadata {
    pub fn new(geometry: ImageGeometry) -> Self {
        Self {
            geometry,
            native_tile: Size::default(),
            name: String::new(),
            position: StagePosition::default(),
        }
    }

    pub fn with_native_tile(mut self, tile: Size) -> Self {
        self.native_tile = tile;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_position(mut self, position: StagePosition) -> Self {
        self.position = position;
        self
    }

    /// Physical pixel size, 1 on every axis when unknown.
    pub fn pixel_size(&self) -> PixelSize {
        self.geometry.pixel_size.unwrap_or_default()
    }
}

/// Instructions for one output series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    /// Geometry of the whole series
    pub geometry: ImageGeometry,
    /// Nominal tile width and height
    pub tile: Size,
    /// Rows per strip (equal to the tile height)
    pub rows_per_strip: u32,
    pub compression: Compression,
    /// Separate planes or fused channels
    pub layout: ChannelLayout,
}

impl SeriesDescriptor {
    /// Descriptor for `geometry` cut into `tile`-sized tiles. The layout is
    /// derived from the geometry.
    pub fn new(geometry: ImageGeometry, tile: Size, compression: Compression) -> Self {
        Self {
            geometry,
            tile,
            rows_per_strip: tile.height,
            compression,
            layout: geometry.channel_layout(),
        }
    }

    /// True when channels are written as separate planes.
    pub fn separate_channels(&self) -> bool {
        self.layout == ChannelLayout::Separate
    }
}

/// Position of one written tile in its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileDescriptor {
    pub col: u32,
    pub row: u32,
    /// Row-major tile number
    pub index: usize,
    /// Nominal tile size of the series
    pub tile: Size,
}

/// An open source image.
pub trait RegionReader: Send {
    fn metadata(&self) -> &SourceMetadata;

    /// Decode `rect` (full-resolution coordinates) downsampled by `2^level`.
    /// The result is `ceil(rect / 2^level)` pixels.
    fn read_region(&mut self, rect: Rect, level: u32) -> TileResult<PixelBlock>;

    /// Release the handle.
    fn close(self: Box<Self>) -> EngineResult<()>;
}

/// An open output container.
pub trait RegionWriter: Send {
    /// Start a series. Called once before any tile is written.
    fn begin_series(&mut self, series: &SeriesDescriptor) -> EngineResult<()>;

    /// Write one plane of one tile. `channel` is 0 for fused layouts, where
    /// `bytes` holds interleaved samples.
    fn write_region(
        &mut self,
        channel: usize,
        bytes: &[u8],
        tile: &TileDescriptor,
        rect: Rect,
    ) -> TileResult<()>;

    /// Finalize the container.
    fn close(self: Box<Self>) -> EngineResult<()>;
}

/// Factory for readers and writers of one container family.
pub trait PixelCodec: Send + Sync {
    fn open(&self, path: &Path) -> EngineResult<Box<dyn RegionReader>>;

    fn create(&self, path: &Path) -> EngineResult<Box<dyn RegionWriter>>;
}

/// Decode a whole image through `codec`.
pub fn read_all(codec: &dyn PixelCodec, path: &Path) -> EngineResult<PixelBlock> {
    let mut reader = codec.open(path)?;
    let bounds = reader.metadata().geometry.bounds();
    let block = reader.read_region(bounds, 0);
    reader.close()?;
    Ok(block?)
}

/// Encode `block` as a single-tile series through `codec`.
pub fn write_all(
    codec: &dyn PixelCodec,
    path: &Path,
    block: &PixelBlock,
    compression: Compression,
) -> EngineResult<()> {
    let geometry = ImageGeometry::new(
        block.width(),
        block.height(),
        block.channels(),
        block.sample_type(),
    )?;
    let series = SeriesDescriptor::new(geometry, block.size(), compression);
    let mut writer = codec.create(path)?;
    let result = write_block(writer.as_mut(), &series, block);
    let closed = writer.close();
    result?;
    closed
}

fn write_block(
    writer: &mut dyn RegionWriter,
    series: &SeriesDescriptor,
    block: &PixelBlock,
) -> EngineResult<()> {
    writer.begin_series(series)?;
    let descriptor = TileDescriptor {
        col: 0,
        row: 0,
        index: 0,
        tile: series.tile,
    };
    let rect = Rect::from_size(block.size());
    for (channel, plane) in block.to_layout_planes(series.layout).iter().enumerate() {
        writer.write_region(channel, plane, &descriptor, rect)?;
    }
    Ok(())
}

/// Copy one written plane into `canvas` at `rect`. Separate layouts carry one
/// channel per call; fused layouts carry every channel interleaved.
pub(crate) fn place_plane(
    canvas: &mut PixelBlock,
    layout: ChannelLayout,
    channel: usize,
    bytes: &[u8],
    rect: Rect,
) -> TileResult<()> {
    if !rect.is_within_bounds(canvas.width(), canvas.height()) {
        return Err(TileError::SizeMismatch {
            expected: canvas.size(),
            actual: Size::new(rect.right(), rect.bottom()),
        });
    }
    if rect.is_empty() {
        return Ok(());
    }
    match layout {
        ChannelLayout::Separate => {
            if channel >= canvas.channels() {
                return Err(TileError::encode(rect, format!("no channel {}", channel)));
            }
            let bw = canvas.sample_type().byte_width();
            let row_bytes = rect.width as usize * bw;
            if bytes.len() != row_bytes * rect.height as usize {
                return Err(TileError::encode(rect, "plane length does not match rectangle"));
            }
            let stride = canvas.width() as usize * bw;
            let target = canvas.plane_mut(channel);
            for (row, src) in bytes.chunks_exact(row_bytes).enumerate() {
                let at = (rect.y as usize + row) * stride + rect.x as usize * bw;
                target[at..at + row_bytes].copy_from_slice(src);
            }
            Ok(())
        }
        ChannelLayout::Fused => {
            if channel != 0 {
                return Err(TileError::encode(rect, "fused layout has a single plane"));
            }
            let tile = PixelBlock::from_interleaved(
                rect.size(),
                canvas.channels(),
                canvas.sample_type(),
                bytes,
            )
            .map_err(|e| TileError::encode(rect, e.to_string()))?;
            tile.copy_into(canvas, rect.x, rect.y)
        }
    }
}
