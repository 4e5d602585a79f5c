//! In-memory codec.
//!
//! Images live in a shared map keyed by path. Every handle opened through the
//! codec is counted, so callers can assert that a batch released all of its
//! decoders, and reads or writes touching a chosen rectangle can be made to
//! fail.

use super::{
    place_plane, PixelCodec, RegionReader, RegionWriter, SeriesDescriptor, SourceMetadata,
    TileDescriptor,
};
use crate::core::buffer::PixelBlock;
use crate::core::error::{ConfigError, EngineResult, TileError, TileResult};
use crate::core::region::{Rect, Size};
use crate::core::types::ImageGeometry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One `write_region` call as the container saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub channel: usize,
    pub tile: TileDescriptor,
    pub rect: Rect,
}

/// Result of a closed (or still open) writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenImage {
    /// Every series started on the writer, in order
    pub series: Vec<SeriesDescriptor>,
    /// Writes in call order
    pub writes: Vec<WriteRecord>,
    /// Pixels of the last series
    pub block: Option<PixelBlock>,
    pub closed: bool,
}

struct StoredImage {
    block: PixelBlock,
    metadata: SourceMetadata,
}

#[derive(Default)]
struct MemoryStore {
    images: RwLock<HashMap<PathBuf, Arc<StoredImage>>>,
    outputs: Mutex<HashMap<PathBuf, WrittenImage>>,
    failing_reads: Mutex<Vec<Rect>>,
    failing_writes: Mutex<Vec<Rect>>,
    read_delay: Mutex<Option<Duration>>,
    open_handles: AtomicUsize,
    opened_total: AtomicUsize,
    reads: AtomicUsize,
}

/// Codec backed by a shared in-process map. Clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryCodec {
    store: Arc<MemoryStore>,
}

impl MemoryCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `block` under `path` with the given metadata.
    pub fn insert(&self, path: impl AsRef<Path>, block: PixelBlock, metadata: SourceMetadata) {
        self.store.images.write().insert(
            path.as_ref().to_path_buf(),
            Arc::new(StoredImage { block, metadata }),
        );
    }

    /// Register `block` with metadata derived from it and a native tile size.
    pub fn insert_block(
        &self,
        path: impl AsRef<Path>,
        block: PixelBlock,
        native_tile: Size,
    ) -> EngineResult<()> {
        let geometry = ImageGeometry::new(
            block.width(),
            block.height(),
            block.channels(),
            block.sample_type(),
        )?;
        let name = path
            .as_ref()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = SourceMetadata::new(geometry)
            .with_native_tile(native_tile)
            .with_name(name);
        self.insert(path, block, metadata);
        Ok(())
    }

    /// Make every read intersecting `rect` fail.
    pub fn fail_reads_in(&self, rect: Rect) {
        self.store.failing_reads.lock().push(rect);
    }

    /// Make every write intersecting `rect` fail.
    pub fn fail_writes_in(&self, rect: Rect) {
        self.store.failing_writes.lock().push(rect);
    }

    /// Slow every read down by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.store.read_delay.lock() = Some(delay);
    }

    /// Handles opened and not yet closed, readers and writers together.
    pub fn open_handles(&self) -> usize {
        self.store.open_handles.load(Ordering::SeqCst)
    }

    /// Handles opened since the codec was created.
    pub fn opened_total(&self) -> usize {
        self.store.opened_total.load(Ordering::SeqCst)
    }

    /// Number of `read_region` calls served.
    pub fn read_count(&self) -> usize {
        self.store.reads.load(Ordering::SeqCst)
    }

    /// Snapshot of what was written to `path`.
    pub fn output(&self, path: impl AsRef<Path>) -> Option<WrittenImage> {
        self.store.outputs.lock().get(path.as_ref()).cloned()
    }

    fn acquire_handle(&self) {
        self.store.open_handles.fetch_add(1, Ordering::SeqCst);
        self.store.opened_total.fetch_add(1, Ordering::SeqCst);
    }
}

impl PixelCodec for MemoryCodec {
    fn open(&self, path: &Path) -> EngineResult<Box<dyn RegionReader>> {
        let image = self
            .store
            .images
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ConfigError::InvalidPath(path.to_path_buf()))?;
        self.acquire_handle();
        Ok(Box::new(MemoryReader {
            codec: self.clone(),
            image,
        }))
    }

    fn create(&self, path: &Path) -> EngineResult<Box<dyn RegionWriter>> {
        self.acquire_handle();
        self.store.outputs.lock().insert(
            path.to_path_buf(),
            WrittenImage {
                series: Vec::new(),
                writes: Vec::new(),
                block: None,
                closed: false,
            },
        );
        Ok(Box::new(MemoryWriter {
            codec: self.clone(),
            path: path.to_path_buf(),
            series: None,
        }))
    }
}

struct MemoryReader {
    codec: MemoryCodec,
    image: Arc<StoredImage>,
}

impl RegionReader for MemoryReader {
    fn metadata(&self) -> &SourceMetadata {
        &self.image.metadata
    }

    fn read_region(&mut self, rect: Rect, level: u32) -> TileResult<PixelBlock> {
        let delay = *self.codec.store.read_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.codec.store.reads.fetch_add(1, Ordering::SeqCst);
        if self
            .codec
            .store
            .failing_reads
            .lock()
            .iter()
            .any(|bad| bad.intersects(&rect))
        {
            return Err(TileError::decode(rect, "injected read failure"));
        }
        let block = self
            .image
            .block
            .crop(rect)
            .map_err(|e| TileError::decode(rect, e.to_string()))?;
        Ok(block.downsample(level))
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        self.codec.store.open_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryWriter {
    codec: MemoryCodec,
    path: PathBuf,
    series: Option<SeriesDescriptor>,
}

fn place_tile(
    output: &mut WrittenImage,
    series: &SeriesDescriptor,
    channel: usize,
    bytes: &[u8],
    rect: Rect,
) -> TileResult<()> {
    let geometry = series.geometry;
    let canvas = output.block.get_or_insert_with(|| {
        PixelBlock::new(geometry.size(), geometry.channels, geometry.sample_type)
    });
    place_plane(canvas, series.layout, channel, bytes, rect)
}

impl RegionWriter for MemoryWriter {
    fn begin_series(&mut self, series: &SeriesDescriptor) -> EngineResult<()> {
        let mut outputs = self.codec.store.outputs.lock();
        if let Some(output) = outputs.get_mut(&self.path) {
            output.series.push(series.clone());
            output.block = None;
        }
        self.series = Some(series.clone());
        Ok(())
    }

    fn write_region(
        &mut self,
        channel: usize,
        bytes: &[u8],
        tile: &TileDescriptor,
        rect: Rect,
    ) -> TileResult<()> {
        let series = self
            .series
            .clone()
            .ok_or_else(|| TileError::encode(rect, "write before begin_series"))?;
        if self
            .codec
            .store
            .failing_writes
            .lock()
            .iter()
            .any(|bad| bad.intersects(&rect))
        {
            return Err(TileError::encode(rect, "injected write failure"));
        }
        let mut outputs = self.codec.store.outputs.lock();
        let output = outputs
            .get_mut(&self.path)
            .ok_or_else(|| TileError::encode(rect, "output discarded"))?;
        place_tile(output, &series, channel, bytes, rect)?;
        output.writes.push(WriteRecord {
            channel,
            tile: *tile,
            rect,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        if let Some(output) = self.codec.store.outputs.lock().get_mut(&self.path) {
            output.closed = true;
        }
        self.codec.store.open_handles.fetch_sub(1, Ordering::SeqCst);
        if self.series.is_none() {
            log::debug!("writer for {} closed without a series", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_all, write_all};
    use crate::core::config::Compression;
    use crate::core::types::SampleType;

    fn pattern(size: Size, channels: usize, ty: SampleType) -> PixelBlock {
        PixelBlock::from_fn(size, channels, ty, |c, x, y| ((x * 7 + y * 3) % 200) as f64 + c as f64)
    }

    #[test]
    fn test_handles_are_counted() {
        let codec = MemoryCodec::new();
        codec
            .insert_block("a.img", pattern(Size::new(8, 8), 1, SampleType::U8), Size::square(4))
            .unwrap();
        let reader = codec.open(Path::new("a.img")).unwrap();
        assert_eq!(codec.open_handles(), 1);
        assert_eq!(reader.metadata().name, "a");
        reader.close().unwrap();
        assert_eq!(codec.open_handles(), 0);
        assert_eq!(codec.opened_total(), 1);
        assert!(codec.open(Path::new("missing.img")).is_err());
    }

    #[test]
    fn test_read_region_downsamples() {
        let codec = MemoryCodec::new();
        let block = pattern(Size::new(9, 7), 2, SampleType::U16);
        codec.insert_block("a.img", block.clone(), Size::default()).unwrap();
        let mut reader = codec.open(Path::new("a.img")).unwrap();
        let region = reader.read_region(Rect::new(2, 2, 6, 4), 1).unwrap();
        assert_eq!(region.size(), Size::new(3, 2));
        let expected = block.crop(Rect::new(2, 2, 6, 4)).unwrap().downsample(1);
        assert_eq!(region, expected);
        assert!(reader.read_region(Rect::new(5, 5, 10, 10), 0).is_err());
        reader.close().unwrap();
    }

    #[test]
    fn test_injected_read_failure() {
        let codec = MemoryCodec::new();
        codec
            .insert_block("a.img", pattern(Size::new(8, 8), 1, SampleType::U8), Size::default())
            .unwrap();
        codec.fail_reads_in(Rect::new(6, 6, 1, 1));
        let mut reader = codec.open(Path::new("a.img")).unwrap();
        assert!(reader.read_region(Rect::new(0, 0, 4, 4), 0).is_ok());
        assert!(matches!(
            reader.read_region(Rect::new(4, 4, 4, 4), 0),
            Err(TileError::Decode { .. })
        ));
        reader.close().unwrap();
    }

    #[test]
    fn test_write_then_read_back() {
        let codec = MemoryCodec::new();
        for (channels, ty) in [(3, SampleType::U8), (3, SampleType::U16), (2, SampleType::U8)] {
            let block = pattern(Size::new(5, 4), channels, ty);
            write_all(&codec, Path::new("out.img"), &block, Compression::Lzw).unwrap();
            let out = codec.output("out.img").unwrap();
            assert!(out.closed);
            assert_eq!(out.block.as_ref(), Some(&block));
            let expected_planes = out.series[0].layout.plane_count(channels);
            assert_eq!(out.writes.len(), expected_planes);
        }
        assert_eq!(codec.open_handles(), 0);

        codec.insert_block("in.img", pattern(Size::new(4, 4), 1, SampleType::F32), Size::default()).unwrap();
        let back = read_all(&codec, Path::new("in.img")).unwrap();
        assert_eq!(back.sample_type(), SampleType::F32);
    }
}
