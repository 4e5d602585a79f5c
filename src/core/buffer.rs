//! Planar pixel storage.
//!
//! A [`PixelBlock`] keeps one contiguous byte plane per channel, rows top to
//! bottom, samples in native byte order. Interleaved (fused) bytes are only
//! produced at codec boundaries via [`PixelBlock::to_layout_planes`].

use crate::core::error::{TileError, TileResult};
use crate::core::region::{Rect, Size};
use crate::core::types::{ChannelLayout, SampleType};
use rayon::prelude::*;

/// Decoded pixels of one rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBlock {
    width: u32,
    height: u32,
    sample_type: SampleType,
    planes: Vec<Vec<u8>>,
}

/// Read one sample as f64.
pub fn read_sample(bytes: &[u8], sample_type: SampleType) -> f64 {
    match sample_type {
        SampleType::U8 => bytes[0] as f64,
        SampleType::I8 => bytes[0] as i8 as f64,
        SampleType::U16 => bytemuck::pod_read_unaligned::<u16>(&bytes[..2]) as f64,
        SampleType::I16 => bytemuck::pod_read_unaligned::<i16>(&bytes[..2]) as f64,
        SampleType::U32 => bytemuck::pod_read_unaligned::<u32>(&bytes[..4]) as f64,
        SampleType::I32 => bytemuck::pod_read_unaligned::<i32>(&bytes[..4]) as f64,
        SampleType::F32 => bytemuck::pod_read_unaligned::<f32>(&bytes[..4]) as f64,
        SampleType::F64 => bytemuck::pod_read_unaligned::<f64>(&bytes[..8]),
    }
}

/// Write one sample, rounding and clamping integer types.
pub fn write_sample(out: &mut [u8], sample_type: SampleType, value: f64) {
    let int = |v: f64| v.round().clamp(sample_type.min_value(), sample_type.max_value());
    match sample_type {
        SampleType::U8 => out[0] = int(value) as u8,
        SampleType::I8 => out[0] = int(value) as i8 as u8,
        SampleType::U16 => out[..2].copy_from_slice(bytemuck::bytes_of(&(int(value) as u16))),
        SampleType::I16 => out[..2].copy_from_slice(bytemuck::bytes_of(&(int(value) as i16))),
        SampleType::U32 => out[..4].copy_from_slice(bytemuck::bytes_of(&(int(value) as u32))),
        SampleType::I32 => out[..4].copy_from_slice(bytemuck::bytes_of(&(int(value) as i32))),
        SampleType::F32 => out[..4].copy_from_slice(bytemuck::bytes_of(&(value as f32))),
        SampleType::F64 => out[..8].copy_from_slice(bytemuck::bytes_of(&value)),
    }
}

impl PixelBlock {
    /// Zero-filled block.
    pub fn new(size: Size, channels: usize, sample_type: SampleType) -> Self {
        let plane_len = size.area() as usize * sample_type.byte_width();
        Self {
            width: size.width,
            height: size.height,
            sample_type,
            planes: vec![vec![0u8; plane_len]; channels],
        }
    }

    /// Block whose every sample is `f(channel, x, y)`.
    pub fn from_fn<F>(size: Size, channels: usize, sample_type: SampleType, f: F) -> Self
    where
        F: Fn(usize, u32, u32) -> f64,
    {
        let mut block = Self::new(size, channels, sample_type);
        let bw = sample_type.byte_width();
        for c in 0..channels {
            let plane = &mut block.planes[c];
            for y in 0..size.height {
                for x in 0..size.width {
                    let at = (y as usize * size.width as usize + x as usize) * bw;
                    write_sample(&mut plane[at..at + bw], sample_type, f(c, x, y));
                }
            }
        }
        block
    }

    /// Build from one plane per channel.
    pub fn from_planes(
        size: Size,
        sample_type: SampleType,
        planes: Vec<Vec<u8>>,
    ) -> TileResult<Self> {
        let expected = size.area() as usize * sample_type.byte_width();
        if planes.is_empty() || planes.iter().any(|p| p.len() != expected) {
            return Err(TileError::decode(
                Rect::from_size(size),
                format!(
                    "expected {} plane(s) of {} bytes",
                    planes.len().max(1),
                    expected
                ),
            ));
        }
        Ok(Self {
            width: size.width,
            height: size.height,
            sample_type,
            planes,
        })
    }

    /// Build from pixel-interleaved samples.
    pub fn from_interleaved(
        size: Size,
        channels: usize,
        sample_type: SampleType,
        bytes: &[u8],
    ) -> TileResult<Self> {
        let bw = sample_type.byte_width();
        let pixels = size.area() as usize;
        if channels == 0 || bytes.len() != pixels * channels * bw {
            return Err(TileError::decode(
                Rect::from_size(size),
                format!("expected {} interleaved bytes, got {}", pixels * channels * bw, bytes.len()),
            ));
        }
        let mut planes = vec![vec![0u8; pixels * bw]; channels];
        for (p, pixel) in bytes.chunks_exact(channels * bw).enumerate() {
            for (c, sample) in pixel.chunks_exact(bw).enumerate() {
                planes[c][p * bw..(p + 1) * bw].copy_from_slice(sample);
            }
        }
        Ok(Self {
            width: size.width,
            height: size.height,
            sample_type,
            planes,
        })
    }

    /// Build from planes in the given layout.
    pub fn from_layout_planes(
        size: Size,
        channels: usize,
        sample_type: SampleType,
        layout: ChannelLayout,
        planes: Vec<Vec<u8>>,
    ) -> TileResult<Self> {
        match layout {
            ChannelLayout::Separate => Self::from_planes(size, sample_type, planes),
            ChannelLayout::Fused => match planes.as_slice() {
                [only] => Self::from_interleaved(size, channels, sample_type, only),
                _ => Err(TileError::decode(
                    Rect::from_size(size),
                    "fused layout expects exactly one plane",
                )),
            },
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    /// Total bytes held.
    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }

    /// Raw bytes of one channel.
    pub fn plane(&self, channel: usize) -> &[u8] {
        &self.planes[channel]
    }

    /// Mutable raw bytes of one channel.
    pub fn plane_mut(&mut self, channel: usize) -> &mut [u8] {
        &mut self.planes[channel]
    }

    /// Consume into per-channel planes.
    pub fn into_planes(self) -> Vec<Vec<u8>> {
        self.planes
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.sample_type.byte_width()
    }

    /// Sample value as f64.
    pub fn sample(&self, channel: usize, x: u32, y: u32) -> f64 {
        let at = self.offset(x, y);
        read_sample(&self.planes[channel][at..], self.sample_type)
    }

    /// Overwrite one sample.
    pub fn set_sample(&mut self, channel: usize, x: u32, y: u32, value: f64) {
        let at = self.offset(x, y);
        let bw = self.sample_type.byte_width();
        write_sample(&mut self.planes[channel][at..at + bw], self.sample_type, value);
    }

    /// Pixel-interleaved copy of all channels.
    pub fn to_interleaved(&self) -> Vec<u8> {
        let bw = self.sample_type.byte_width();
        let channels = self.channels();
        let pixels = self.size().area() as usize;
        let mut out = vec![0u8; pixels * channels * bw];
        for (p, pixel) in out.chunks_exact_mut(channels * bw).enumerate() {
            for c in 0..channels {
                pixel[c * bw..(c + 1) * bw].copy_from_slice(&self.planes[c][p * bw..(p + 1) * bw]);
            }
        }
        out
    }

    /// Planes as they cross a codec boundary: one per channel when separate,
    /// a single interleaved plane when fused.
    pub fn to_layout_planes(&self, layout: ChannelLayout) -> Vec<Vec<u8>> {
        match layout {
            ChannelLayout::Separate => self.planes.clone(),
            ChannelLayout::Fused => vec![self.to_interleaved()],
        }
    }

    /// Copy of the pixels inside `rect` (block-relative coordinates).
    pub fn crop(&self, rect: Rect) -> TileResult<PixelBlock> {
        if !rect.is_within_bounds(self.width, self.height) {
            return Err(TileError::SizeMismatch {
                expected: rect.size(),
                actual: self.size(),
            });
        }
        let mut out = PixelBlock::new(rect.size(), self.channels(), self.sample_type);
        self.blit(rect, &mut out, 0, 0)?;
        Ok(out)
    }

    /// Copy the whole block into `dest` with its top-left corner at (`x`, `y`).
    pub fn copy_into(&self, dest: &mut PixelBlock, x: u32, y: u32) -> TileResult<()> {
        self.blit(Rect::from_size(self.size()), dest, x, y)
    }

    /// Copy `src_rect` of this block into `dest` at (`dest_x`, `dest_y`).
    pub fn blit(
        &self,
        src_rect: Rect,
        dest: &mut PixelBlock,
        dest_x: u32,
        dest_y: u32,
    ) -> TileResult<()> {
        let target = Rect::new(dest_x, dest_y, src_rect.width, src_rect.height);
        if !src_rect.is_within_bounds(self.width, self.height)
            || !target.is_within_bounds(dest.width, dest.height)
            || dest.channels() != self.channels()
            || dest.sample_type != self.sample_type
        {
            return Err(TileError::SizeMismatch {
                expected: dest.size(),
                actual: Size::new(target.right(), target.bottom()),
            });
        }
        let bw = self.sample_type.byte_width();
        let row_bytes = src_rect.width as usize * bw;
        for c in 0..self.channels() {
            for row in 0..src_rect.height {
                let from = self.offset(src_rect.x, src_rect.y + row);
                let to = dest.offset(dest_x, dest_y + row);
                dest.planes[c][to..to + row_bytes]
                    .copy_from_slice(&self.planes[c][from..from + row_bytes]);
            }
        }
        Ok(())
    }

    /// Box-filter downsample by `2^level`. Output is `ceil(w/2^level) x ceil(h/2^level)`;
    /// edge windows average only the pixels that exist.
    pub fn downsample(&self, level: u32) -> PixelBlock {
        if level == 0 {
            return self.clone();
        }
        let scale = 1u64 << level.min(31);
        let out_size = self.size().scaled_to_level(level);
        let bw = self.sample_type.byte_width();
        let sample_type = self.sample_type;
        let (src_w, src_h) = (self.width as u64, self.height as u64);
        let out_row = out_size.width as usize * bw;

        let planes = self
            .planes
            .iter()
            .map(|src| {
                let mut out = vec![0u8; out_size.area() as usize * bw];
                if out_row == 0 {
                    return out;
                }
                out.par_chunks_mut(out_row).enumerate().for_each(|(oy, row)| {
                    let y0 = oy as u64 * scale;
                    let y1 = (y0 + scale).min(src_h);
                    for ox in 0..out_size.width as u64 {
                        let x0 = ox * scale;
                        let x1 = (x0 + scale).min(src_w);
                        let mut sum = 0.0;
                        for y in y0..y1 {
                            for x in x0..x1 {
                                let at = ((y * src_w + x) as usize) * bw;
                                sum += read_sample(&src[at..], sample_type);
                            }
                        }
                        let count = ((y1 - y0) * (x1 - x0)) as f64;
                        let at = ox as usize * bw;
                        write_sample(&mut row[at..at + bw], sample_type, sum / count);
                    }
                });
                out
            })
            .collect();

        PixelBlock {
            width: out_size.width,
            height: out_size.height,
            sample_type,
            planes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32, channels: usize, ty: SampleType) -> PixelBlock {
        PixelBlock::from_fn(Size::new(w, h), channels, ty, |c, x, y| {
            (x + y * w) as f64 + c as f64 * 50.0
        })
    }

    #[test]
    fn test_crop_and_copy_into() {
        let block = gradient(10, 8, 2, SampleType::U16);
        let cropped = block.crop(Rect::new(3, 2, 4, 5)).unwrap();
        assert_eq!(cropped.size(), Size::new(4, 5));
        assert_eq!(cropped.sample(0, 0, 0), block.sample(0, 3, 2));
        assert_eq!(cropped.sample(1, 3, 4), block.sample(1, 6, 6));

        let mut canvas = PixelBlock::new(Size::new(10, 8), 2, SampleType::U16);
        cropped.copy_into(&mut canvas, 3, 2).unwrap();
        assert_eq!(canvas.sample(1, 6, 6), block.sample(1, 6, 6));
        assert_eq!(canvas.sample(0, 0, 0), 0.0);
        assert!(cropped.copy_into(&mut canvas, 7, 0).is_err());
    }

    #[test]
    fn test_interleaved_roundtrip_preserves_planes() {
        let block = gradient(5, 3, 3, SampleType::U8);
        let bytes = block.to_interleaved();
        assert_eq!(&bytes[..3], &[0, 50, 100]);
        let back = PixelBlock::from_interleaved(block.size(), 3, SampleType::U8, &bytes).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_layout_planes() {
        let block = gradient(4, 4, 3, SampleType::U8);
        assert_eq!(block.to_layout_planes(ChannelLayout::Fused).len(), 1);
        assert_eq!(block.to_layout_planes(ChannelLayout::Separate).len(), 3);
        let fused = block.to_layout_planes(ChannelLayout::Fused);
        let back = PixelBlock::from_layout_planes(
            block.size(),
            3,
            SampleType::U8,
            ChannelLayout::Fused,
            fused,
        )
        .unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_downsample_box_filter() {
        let block = PixelBlock::from_fn(Size::new(5, 3), 1, SampleType::U8, |_, x, y| {
            (x * 10 + y) as f64
        });
        let half = block.downsample(1);
        assert_eq!(half.size(), Size::new(3, 2));
        // (0,1,10,11) / 4
        assert_eq!(half.sample(0, 0, 0), 6.0);
        // edge column: (40, 41) / 2
        assert_eq!(half.sample(0, 2, 0), 41.0);
        // corner: single pixel
        assert_eq!(half.sample(0, 2, 1), 42.0);
    }

    #[test]
    fn test_downsample_float() {
        let block = PixelBlock::from_fn(Size::new(2, 2), 1, SampleType::F32, |_, x, y| {
            (x + y) as f64 * 0.5
        });
        assert_eq!(block.downsample(1).sample(0, 0, 0), 0.5);
    }

    #[test]
    fn test_signed_samples_clamp() {
        let mut block = PixelBlock::new(Size::new(1, 1), 1, SampleType::I8);
        block.set_sample(0, 0, 0, -300.0);
        assert_eq!(block.sample(0, 0, 0), -128.0);
        block.set_sample(0, 0, 0, 12.4);
        assert_eq!(block.sample(0, 0, 0), 12.0);
    }

    #[test]
    fn test_from_planes_validates_length() {
        assert!(PixelBlock::from_planes(Size::new(2, 2), SampleType::U8, vec![vec![0; 3]]).is_err());
        assert!(PixelBlock::from_planes(Size::new(2, 2), SampleType::U16, vec![vec![0; 8]]).is_ok());
    }
}
