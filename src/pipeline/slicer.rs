//! Cutting an image into standalone tile files, skipping background tiles.

use crate::codec::{write_all, PixelCodec};
use crate::core::buffer::PixelBlock;
use crate::core::config::EngineConfig;
use crate::core::error::{ConfigError, EngineResult};
use crate::core::region::{Rect, Size};
use crate::execution::pool::ReaderPool;
use crate::execution::progress::{CancellationToken, ProgressSink, ProgressTracker};
use crate::execution::scheduler::TileScheduler;
use crate::planning::budget::{Backoff, MemoryBudget, MemoryTracker};
use crate::planning::grid::plan_grid;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Slicing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceOptions {
    pub tile: Size,
    /// Background value per channel
    pub background: Vec<f64>,
    /// A tile is kept when some channel deviates from the background by more
    /// than this, in root-mean-square terms
    pub content_threshold: f64,
    /// Extension of the written tiles
    pub extension: String,
}

impl SliceOptions {
    pub fn new(tile: Size, background: Vec<f64>, content_threshold: f64) -> Self {
        Self {
            tile,
            background,
            content_threshold,
            extension: "tif".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

/// Outcome of a slicing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport {
    pub tiles: usize,
    /// Files written, sorted
    pub saved: Vec<PathBuf>,
}

/// Mean squared deviation of each channel from `background`.
pub fn background_deviation(block: &PixelBlock, background: &[f64]) -> Vec<f64> {
    let pixels = block.size().area() as f64;
    (0..block.channels())
        .map(|c| {
            if pixels == 0.0 {
                return 0.0;
            }
            let bg = background.get(c).copied().unwrap_or(0.0);
            let mut sum = 0.0;
            for y in 0..block.height() {
                for x in 0..block.width() {
                    let d = block.sample(c, x, y) - bg;
                    sum += d * d;
                }
            }
            sum / pixels
        })
        .collect()
}

/// File name of the tile at `rect`.
pub fn tile_path(dir: &Path, stem: &str, rect: Rect, extension: &str) -> PathBuf {
    dir.join(format!("{}_Tile({},{}).{}", stem, rect.x, rect.y, extension))
}

/// Saves every tile of an image that holds content.
pub struct TileSlicer<'a> {
    codec: &'a dyn PixelCodec,
    config: EngineConfig,
    token: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl<'a> TileSlicer<'a> {
    pub fn new(codec: &'a dyn PixelCodec, config: EngineConfig) -> Self {
        Self {
            codec,
            config,
            token: CancellationToken::new(),
            sink: None,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Slice `input` into `output_dir`.
    pub fn slice(&self, input: &Path, output_dir: &Path, options: &SliceOptions) -> EngineResult<SliceReport> {
        let pool = ReaderPool::open(self.codec, input, self.config.effective_decoders())?;
        let result = self.slice_with(&pool, input, output_dir, options);
        let closed = pool.close();
        let report = result?;
        closed?;
        Ok(report)
    }

    fn slice_with(
        &self,
        pool: &ReaderPool,
        input: &Path,
        output_dir: &Path,
        options: &SliceOptions,
    ) -> EngineResult<SliceReport> {
        let geometry = pool.metadata().geometry;
        if options.background.len() < geometry.channels {
            return Err(ConfigError::BackgroundChannels {
                expected: geometry.channels,
                actual: options.background.len(),
            }
            .into());
        }
        if !options.content_threshold.is_finite() {
            return Err(ConfigError::InvalidThresholds.into());
        }
        let grid = plan_grid(geometry.bounds(), options.tile, 0)?;
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let limit = options.content_threshold * options.content_threshold;
        log::info!(
            "slicing {} into {}x{} tiles of {}",
            input.display(),
            grid.cols(),
            grid.rows(),
            grid.tile_size()
        );

        let mut progress = ProgressTracker::new(grid.len()).with_token(self.token.clone());
        if let Some(sink) = &self.sink {
            progress = progress.with_sink(sink.clone());
        }
        let saved = Mutex::new(Vec::new());
        let budget = MemoryBudget::new(
            self.config.effective_ceiling(),
            self.config.effective_workers(),
            geometry.bytes_per_pixel(),
        );
        let tracker = MemoryTracker::new(budget.ceiling);
        let backoff = Backoff::from_millis(
            self.config.memory_poll_initial_ms,
            self.config.memory_poll_max_ms,
        );

        TileScheduler::new(self.config.effective_workers()).run(grid.tiles(), &progress, |ctx| {
            let tile = ctx.tile();
            let _reservation =
                tracker.reserve(budget.tile_cost(tile.source.size(), 0), ctx.token(), backoff)?;
            let block = {
                let mut reader = pool.acquire(ctx.token())?;
                reader.read_region(tile.source, 0)?
            };
            let deviation = background_deviation(&block, &options.background);
            if !deviation.iter().any(|d| *d > limit) {
                return Ok(());
            }
            ctx.checkpoint()?;
            let path = tile_path(output_dir, &stem, tile.source, &options.extension);
            write_all(self.codec, &path, &block, self.config.compression)?;
            saved.lock().push(path);
            Ok(())
        })?;

        let mut saved = saved.into_inner();
        saved.sort();
        log::info!(
            "saved {} of {} tile(s), peak tile memory {} bytes",
            saved.len(),
            grid.len(),
            tracker.peak_usage()
        );
        Ok(SliceReport {
            tiles: grid.len(),
            saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryCodec;
    use crate::core::error::EngineError;
    use crate::core::types::SampleType;

    /// White 40x20 image with a dark square in the tile at (10, 0).
    fn codec_with_spot() -> MemoryCodec {
        let block = PixelBlock::from_fn(Size::new(40, 20), 3, SampleType::U8, |_, x, y| {
            if (12..18).contains(&x) && y < 6 {
                0.0
            } else {
                255.0
            }
        });
        let codec = MemoryCodec::new();
        codec.insert_block("scan.img", block, Size::default()).unwrap();
        codec
    }

    #[test]
    fn test_deviation_per_channel() {
        let block = PixelBlock::from_fn(Size::new(2, 2), 2, SampleType::U8, |c, x, _| {
            if c == 0 { 10.0 } else { (x * 4) as f64 }
        });
        let d = background_deviation(&block, &[10.0, 0.0]);
        assert_eq!(d, vec![0.0, 8.0]);
    }

    #[test]
    fn test_only_content_tiles_are_saved() {
        let codec = codec_with_spot();
        let options = SliceOptions::new(Size::square(10), vec![255.0; 3], 50.0).with_extension("img");
        let report = TileSlicer::new(&codec, EngineConfig::default().with_workers(3))
            .slice(Path::new("scan.img"), Path::new("tiles"), &options)
            .unwrap();
        assert_eq!(report.tiles, 8);
        // 36 dark pixels of 100: deviation 0.36 * 255^2 > 50^2
        assert_eq!(report.saved, vec![PathBuf::from("tiles/scan_Tile(10,0).img")]);
        let out = codec.output("tiles/scan_Tile(10,0).img").unwrap();
        assert!(out.closed);
        assert_eq!(out.block.unwrap().size(), Size::square(10));
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_high_threshold_saves_nothing() {
        let codec = codec_with_spot();
        let options = SliceOptions::new(Size::square(10), vec![255.0; 3], 200.0);
        let report = TileSlicer::new(&codec, EngineConfig::default())
            .slice(Path::new("scan.img"), Path::new("tiles"), &options)
            .unwrap();
        assert!(report.saved.is_empty());
    }

    #[test]
    fn test_tile_memory_is_reserved_under_ceiling() {
        let codec = codec_with_spot();
        codec.set_read_delay(std::time::Duration::from_millis(1));
        let options = SliceOptions::new(Size::square(10), vec![255.0; 3], 50.0).with_extension("img");
        // A 10x10 RGB tile costs 600 bytes; only one fits at a time
        let config = EngineConfig::default().with_workers(4).with_memory_ceiling(1000);
        let report = TileSlicer::new(&codec, config)
            .slice(Path::new("scan.img"), Path::new("tiles"), &options)
            .unwrap();
        assert_eq!(report.saved.len(), 1);

        let too_small = EngineConfig::default().with_memory_ceiling(500);
        let err = TileSlicer::new(&codec, too_small)
            .slice(Path::new("scan.img"), Path::new("other"), &options)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientMemory { required: 600, available: 500 }));
        assert!(codec.output("other/scan_Tile(10,0).img").is_none());
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_background_must_cover_channels() {
        let codec = codec_with_spot();
        let options = SliceOptions::new(Size::square(10), vec![255.0], 1.0);
        let err = TileSlicer::new(&codec, EngineConfig::default())
            .slice(Path::new("scan.img"), Path::new("tiles"), &options)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(ConfigError::BackgroundChannels { expected: 3, actual: 1 })
        ));
        assert_eq!(codec.open_handles(), 0);
    }
}
