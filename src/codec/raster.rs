//! Codec for ordinary raster files (PNG, TIFF, JPEG, ...) via the `image` crate.
//!
//! These formats carry no native tiling, so the whole file is decoded once per
//! codec instance and every reader crops from that copy. Writers collect tiles
//! into a canvas and encode it on `close`.

use super::{
    place_plane, PixelCodec, RegionReader, RegionWriter, SeriesDescriptor, SourceMetadata,
    TileDescriptor,
};
use crate::core::buffer::PixelBlock;
use crate::core::config::Compression;
use crate::core::error::{ConfigError, EngineResult, TileError, TileResult};
use crate::core::region::{Rect, Size};
use crate::core::types::{ImageGeometry, SampleType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct DecodedImage {
    block: PixelBlock,
    metadata: SourceMetadata,
}

/// `image`-crate backed codec. Clones share decoded images.
#[derive(Clone, Default)]
pub struct RasterCodec {
    decoded: Arc<Mutex<HashMap<PathBuf, Arc<DecodedImage>>>>,
}

impl RasterCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(&self, path: &Path) -> EngineResult<Arc<DecodedImage>> {
        let mut decoded = self.decoded.lock();
        if let Some(image) = decoded.get(path) {
            return Ok(image.clone());
        }
        if !path.is_file() {
            return Err(ConfigError::InvalidPath(path.to_path_buf()).into());
        }
        let image = image::open(path)?;
        log::debug!(
            "decoded {} ({}x{}, {:?})",
            path.display(),
            image.width(),
            image.height(),
            image.color()
        );
        let block = block_from_image(image)?;
        let geometry = ImageGeometry::new(
            block.width(),
            block.height(),
            block.channels(),
            block.sample_type(),
        )?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = Arc::new(DecodedImage {
            block,
            metadata: SourceMetadata::new(geometry).with_name(name),
        });
        decoded.insert(path.to_path_buf(), entry.clone());
        Ok(entry)
    }
}

impl PixelCodec for RasterCodec {
    fn open(&self, path: &Path) -> EngineResult<Box<dyn RegionReader>> {
        Ok(Box::new(RasterReader {
            image: self.decode(path)?,
        }))
    }

    fn create(&self, path: &Path) -> EngineResult<Box<dyn RegionWriter>> {
        if path.extension().is_none() {
            return Err(ConfigError::InvalidPath(path.to_path_buf()).into());
        }
        Ok(Box::new(RasterWriter {
            path: path.to_path_buf(),
            series: None,
            canvas: None,
        }))
    }
}

struct RasterReader {
    image: Arc<DecodedImage>,
}

impl RegionReader for RasterReader {
    fn metadata(&self) -> &SourceMetadata {
        &self.image.metadata
    }

    fn read_region(&mut self, rect: Rect, level: u32) -> TileResult<PixelBlock> {
        let block = self
            .image
            .block
            .crop(rect)
            .map_err(|e| TileError::decode(rect, e.to_string()))?;
        Ok(block.downsample(level))
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}

struct RasterWriter {
    path: PathBuf,
    series: Option<SeriesDescriptor>,
    canvas: Option<PixelBlock>,
}

impl RegionWriter for RasterWriter {
    fn begin_series(&mut self, series: &SeriesDescriptor) -> EngineResult<()> {
        if series.compression != Compression::None {
            log::debug!(
                "{}: compression is chosen by the file format",
                self.path.display()
            );
        }
        let geometry = series.geometry;
        self.canvas = Some(PixelBlock::new(
            geometry.size(),
            geometry.channels,
            geometry.sample_type,
        ));
        self.series = Some(series.clone());
        Ok(())
    }

    fn write_region(
        &mut self,
        channel: usize,
        bytes: &[u8],
        _tile: &TileDescriptor,
        rect: Rect,
    ) -> TileResult<()> {
        let layout = match &self.series {
            Some(series) => series.layout,
            None => return Err(TileError::encode(rect, "write before begin_series")),
        };
        match self.canvas.as_mut() {
            Some(canvas) => place_plane(canvas, layout, channel, bytes, rect),
            None => Err(TileError::encode(rect, "write before begin_series")),
        }
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        let this = *self;
        let Some(canvas) = this.canvas else {
            return Ok(());
        };
        let image = image_from_block(&canvas)?;
        image.save(&this.path)?;
        log::debug!("wrote {} ({})", this.path.display(), canvas.size());
        Ok(())
    }
}

/// Convert a decoded `image` buffer into planar storage.
pub fn block_from_image(image: DynamicImage) -> TileResult<PixelBlock> {
    let size = Size::new(image.width(), image.height());
    let (channels, sample_type, bytes) = match image {
        DynamicImage::ImageLuma8(b) => (1, SampleType::U8, b.into_raw()),
        DynamicImage::ImageLumaA8(b) => (2, SampleType::U8, b.into_raw()),
        DynamicImage::ImageRgb8(b) => (3, SampleType::U8, b.into_raw()),
        DynamicImage::ImageRgba8(b) => (4, SampleType::U8, b.into_raw()),
        DynamicImage::ImageLuma16(b) => (1, SampleType::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
        DynamicImage::ImageLumaA16(b) => (2, SampleType::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
        DynamicImage::ImageRgb16(b) => (3, SampleType::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
        DynamicImage::ImageRgba16(b) => (4, SampleType::U16, bytemuck::cast_slice(b.as_raw()).to_vec()),
        DynamicImage::ImageRgb32F(b) => (3, SampleType::F32, bytemuck::cast_slice(b.as_raw()).to_vec()),
        DynamicImage::ImageRgba32F(b) => (4, SampleType::F32, bytemuck::cast_slice(b.as_raw()).to_vec()),
        other => (4, SampleType::U8, other.to_rgba8().into_raw()),
    };
    PixelBlock::from_interleaved(size, channels, sample_type, &bytes)
}

fn samples<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Convert planar storage into an `image` buffer for encoding.
pub fn image_from_block(block: &PixelBlock) -> TileResult<DynamicImage> {
    let (w, h) = (block.width(), block.height());
    let bytes = block.to_interleaved();
    let image = match (block.sample_type(), block.channels()) {
        (SampleType::U8, 1) => ImageBuffer::<Luma<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageLuma8),
        (SampleType::U8, 2) => ImageBuffer::<LumaA<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageLumaA8),
        (SampleType::U8, 3) => ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageRgb8),
        (SampleType::U8, 4) => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, bytes).map(DynamicImage::ImageRgba8),
        (SampleType::U16, 1) => ImageBuffer::<Luma<u16>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageLuma16),
        (SampleType::U16, 2) => ImageBuffer::<LumaA<u16>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageLumaA16),
        (SampleType::U16, 3) => ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageRgb16),
        (SampleType::U16, 4) => ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageRgba16),
        (SampleType::F32, 3) => ImageBuffer::<Rgb<f32>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageRgb32F),
        (SampleType::F32, 4) => ImageBuffer::<Rgba<f32>, _>::from_raw(w, h, samples(&bytes)).map(DynamicImage::ImageRgba32F),
        _ => None,
    };
    image.ok_or_else(|| {
        TileError::encode(
            Rect::from_size(block.size()),
            format!(
                "cannot encode {} channel(s) of {} samples",
                block.channels(),
                block.sample_type()
            ),
        )
    })
}
