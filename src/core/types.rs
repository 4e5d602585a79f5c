//! Image descriptors shared by every stage of a transcode.
//!
//! An [`ImageGeometry`] says how big an image is and how each sample is
//! encoded; it never owns pixels. The separate/fused channel decision lives
//! here so that readers, writers and the tile cache all get it from the same
//! function.

use crate::core::error::ConfigError;
use crate::core::region::{Rect, Size};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoding of a single sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    /// Byte width of one sample.
    pub fn byte_width(&self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    /// Whether samples are signed (floats count as signed).
    pub fn is_signed(&self) -> bool {
        !matches!(self, SampleType::U8 | SampleType::U16 | SampleType::U32)
    }

    /// Whether samples are IEEE floats.
    pub fn is_float(&self) -> bool {
        matches!(self, SampleType::F32 | SampleType::F64)
    }

    /// Smallest representable value, as f64.
    pub fn min_value(&self) -> f64 {
        match self {
            SampleType::U8 | SampleType::U16 | SampleType::U32 => 0.0,
            SampleType::I8 => i8::MIN as f64,
            SampleType::I16 => i16::MIN as f64,
            SampleType::I32 => i32::MIN as f64,
            SampleType::F32 => f32::MIN as f64,
            SampleType::F64 => f64::MIN,
        }
    }

    /// Largest representable value, as f64.
    pub fn max_value(&self) -> f64 {
        match self {
            SampleType::U8 => u8::MAX as f64,
            SampleType::I8 => i8::MAX as f64,
            SampleType::U16 => u16::MAX as f64,
            SampleType::I16 => i16::MAX as f64,
            SampleType::U32 => u32::MAX as f64,
            SampleType::I32 => i32::MAX as f64,
            SampleType::F32 => f32::MAX as f64,
            SampleType::F64 => f64::MAX,
        }
    }

    /// Parse a lowercase name such as `"u16"`.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "u8" | "ubyte" => Ok(SampleType::U8),
            "i8" | "byte" => Ok(SampleType::I8),
            "u16" | "ushort" => Ok(SampleType::U16),
            "i16" | "short" => Ok(SampleType::I16),
            "u32" | "uint" => Ok(SampleType::U32),
            "i32" | "int" => Ok(SampleType::I32),
            "f32" | "float" => Ok(SampleType::F32),
            "f64" | "double" => Ok(SampleType::F64),
            other => Err(ConfigError::UnsupportedSampleType(other.to_string())),
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleType::U8 => "u8",
            SampleType::I8 => "i8",
            SampleType::U16 => "u16",
            SampleType::I16 => "i16",
            SampleType::U32 => "u32",
            SampleType::I32 => "i32",
            SampleType::F32 => "f32",
            SampleType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Physical size of one pixel (micrometers by convention).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PixelSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PixelSize {
    /// Create a pixel size, replacing zero or non-finite components with 1.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        let fix = |v: f64| if v.is_finite() && v > 0.0 { v } else { 1.0 };
        Self {
            x: fix(x),
            y: fix(y),
            z: fix(z),
        }
    }

    /// Pixel size after downsampling by `2^level` in x and y.
    pub fn at_level(&self, level: u32) -> Self {
        let factor = 2f64.powi(level as i32);
        Self {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z,
        }
    }
}

impl Default for PixelSize {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

/// How channel samples are laid out when pixel bytes cross a codec boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    /// One plane per channel.
    Separate,
    /// Channels interleaved per pixel in a single plane.
    Fused,
}

/// Channels are stored as separate planes when there are exactly two of
/// them, more than four, or samples wider than one byte.
pub fn separate_channels(channel_count: usize, sample_bytes: usize) -> bool {
    channel_count == 2 || channel_count > 4 || sample_bytes > 1
}

impl ChannelLayout {
    /// Layout for the given channel count and sample width.
    pub fn for_channels(channel_count: usize, sample_bytes: usize) -> Self {
        if separate_channels(channel_count, sample_bytes) {
            ChannelLayout::Separate
        } else {
            ChannelLayout::Fused
        }
    }

    /// Number of planes written per tile.
    pub fn plane_count(&self, channel_count: usize) -> usize {
        match self {
            ChannelLayout::Separate => channel_count,
            ChannelLayout::Fused => 1,
        }
    }
}

/// Immutable description of a source or target image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImageGeometry {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of channels
    pub channels: usize,
    /// Sample encoding
    pub sample_type: SampleType,
    /// Optional physical pixel size
    pub pixel_size: Option<PixelSize>,
}

impl ImageGeometry {
    /// Create a geometry, rejecting empty images and zero channels.
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        sample_type: SampleType,
    ) -> Result<Self, ConfigError> {
        if channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyRegion);
        }
        Ok(Self {
            width,
            height,
            channels,
            sample_type,
            pixel_size: None,
        })
    }

    /// Attach a physical pixel size.
    pub fn with_pixel_size(mut self, pixel_size: PixelSize) -> Self {
        self.pixel_size = Some(pixel_size);
        self
    }

    /// Image dimensions.
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Full image rectangle.
    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.size())
    }

    /// Bytes for one pixel across all channels.
    pub fn bytes_per_pixel(&self) -> u64 {
        self.channels as u64 * self.sample_type.byte_width() as u64
    }

    /// Bytes needed to hold `size` pixels of this geometry.
    pub fn bytes_for(&self, size: Size) -> u64 {
        size.area() * self.bytes_per_pixel()
    }

    /// Channel layout, computed once from channel count and sample width.
    pub fn channel_layout(&self) -> ChannelLayout {
        ChannelLayout::for_channels(self.channels, self.sample_type.byte_width())
    }

    /// Same geometry resized to `size`.
    pub fn resized(&self, size: Size) -> Self {
        Self {
            width: size.width,
            height: size.height,
            ..*self
        }
    }

    /// Geometry after downsampling by `2^level`.
    pub fn at_level(&self, level: u32) -> Self {
        let size = self.size().scaled_to_level(level);
        Self {
            width: size.width,
            height: size.height,
            pixel_size: self.pixel_size.map(|p| p.at_level(level)),
            ..*self
        }
    }
}

impl fmt::Display for ImageGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} ({} ch, {})",
            self.width, self.height, self.channels, self.sample_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separate_channel_rule() {
        assert!(!separate_channels(1, 1));
        assert!(separate_channels(2, 1));
        assert!(!separate_channels(3, 1));
        assert!(!separate_channels(4, 1));
        assert!(separate_channels(5, 1));
        assert!(separate_channels(3, 2));
        assert!(separate_channels(1, 4));
    }

    #[test]
    fn test_layout_is_deterministic() {
        for channels in 1..8 {
            for bytes in [1, 2, 4, 8] {
                let first = ChannelLayout::for_channels(channels, bytes);
                for _ in 0..3 {
                    assert_eq!(ChannelLayout::for_channels(channels, bytes), first);
                }
            }
        }
    }

    #[test]
    fn test_geometry_layout_examples() {
        let rgb8 = ImageGeometry::new(10, 10, 3, SampleType::U8).unwrap();
        assert_eq!(rgb8.channel_layout(), ChannelLayout::Fused);
        let rgb16 = ImageGeometry::new(10, 10, 3, SampleType::U16).unwrap();
        assert_eq!(rgb16.channel_layout(), ChannelLayout::Separate);
        assert_eq!(rgb16.bytes_per_pixel(), 6);
    }

    #[test]
    fn test_geometry_rejects_zero_channels() {
        assert!(matches!(
            ImageGeometry::new(10, 10, 0, SampleType::U8),
            Err(ConfigError::ZeroChannels)
        ));
    }

    #[test]
    fn test_pixel_size_defaults_and_levels() {
        let p = PixelSize::new(0.0, 0.5, f64::NAN);
        assert_eq!(p.x, 1.0);
        assert_eq!(p.z, 1.0);
        let scaled = p.at_level(2);
        assert_eq!(scaled.x, 4.0);
        assert_eq!(scaled.y, 2.0);
        assert_eq!(scaled.z, 1.0);
    }

    #[test]
    fn test_sample_type_parse() {
        assert_eq!(SampleType::parse("U16").unwrap(), SampleType::U16);
        assert!(SampleType::parse("complex").is_err());
        assert_eq!(SampleType::F32.byte_width(), 4);
        assert!(SampleType::I8.is_signed());
    }
}
