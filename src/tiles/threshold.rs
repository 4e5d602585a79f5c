//! Class thresholding over another provider.

use super::provider::TileProvider;
use crate::core::buffer::PixelBlock;
use crate::core::error::{ConfigError, EngineResult};
use crate::core::region::Size;
use crate::core::types::{ImageGeometry, SampleType};

/// Maps every pixel to the number of thresholds strictly below the mean of its
/// channels. Output tiles are single-channel `u8`.
pub struct ThresholdedTileProvider<P> {
    inner: P,
    thresholds: Vec<f64>,
    invert: bool,
}

impl<P: TileProvider> ThresholdedTileProvider<P> {
    /// Thresholds must be finite and non-empty; they are sorted here. At most
    /// 255 thresholds fit the `u8` output.
    pub fn new(inner: P, thresholds: &[f64], invert: bool) -> Result<Self, ConfigError> {
        if thresholds.is_empty()
            || thresholds.len() > u8::MAX as usize
            || thresholds.iter().any(|t| !t.is_finite())
        {
            return Err(ConfigError::InvalidThresholds);
        }
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_by(f64::total_cmp);
        Ok(Self {
            inner,
            thresholds,
            invert,
        })
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    /// Class of one averaged value.
    pub fn classify(&self, value: f64) -> u8 {
        let class = self.thresholds.partition_point(|t| *t < value);
        let class = if self.invert {
            self.thresholds.len() - class
        } else {
            class
        };
        class as u8
    }

    /// Classify every pixel of `block`.
    pub fn apply(&self, block: &PixelBlock) -> PixelBlock {
        let channels = block.channels() as f64;
        PixelBlock::from_fn(block.size(), 1, SampleType::U8, |_, x, y| {
            let sum: f64 = (0..block.channels()).map(|c| block.sample(c, x, y)).sum();
            self.classify(sum / channels) as f64
        })
    }
}

impl<P: TileProvider> TileProvider for ThresholdedTileProvider<P> {
    fn geometry(&self) -> ImageGeometry {
        let inner = self.inner.geometry();
        ImageGeometry {
            channels: 1,
            sample_type: SampleType::U8,
            ..inner
        }
    }

    fn tile_size(&self) -> Size {
        self.inner.tile_size()
    }

    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock> {
        let tile = self.inner.get_tile(col, row)?;
        Ok(self.apply(&tile))
    }
}
