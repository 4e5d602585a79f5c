//! Multi-resolution export.
//!
//! The driver walks levels `start..=end` of one source. Each level gets its
//! own writer, bound to the level geometry and a tile size halved from the
//! previous level, and that writer is closed before the next level starts.

use crate::assembly::writer::TiledWriter;
use crate::codec::{PixelCodec, RegionWriter, SeriesDescriptor};
use crate::core::config::EngineConfig;
use crate::core::error::{ConfigError, EngineError, EngineResult};
use crate::core::region::Size;
use crate::execution::pool::ReaderPool;
use crate::execution::progress::{CancellationToken, ProgressSink, ProgressTracker};
use crate::execution::scheduler::TileScheduler;
use crate::planning::budget::{plan_tile_size, Backoff, MemoryBudget, MemoryTracker};
use crate::planning::grid::{plan_grid, scale_factor, TileGrid};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_LEVEL: u32 = 31;

/// Opens the writer for one level.
pub type WriterFactory<'a> =
    Box<dyn Fn(u32, &SeriesDescriptor) -> EngineResult<Box<dyn RegionWriter>> + 'a>;

/// Where the driver is in its walk over the levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidState {
    Idle,
    PreparingLevel(u32),
    ProcessingTiles(u32),
    ClosingLevel(u32),
    Done,
    Cancelled,
}

impl PyramidState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PyramidState::Done | PyramidState::Cancelled)
    }
}

/// One finished level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelReport {
    pub level: u32,
    pub size: Size,
    /// Nominal tile of the level series
    pub tile: Size,
    pub tiles: usize,
    /// Largest sum of tile working sets held at once
    pub peak_memory: u64,
}

struct OpenLevel {
    grid: TileGrid,
    writer: TiledWriter,
    budget: MemoryBudget,
    tracker: MemoryTracker,
}

/// State machine exporting one file per pyramid level.
pub struct PyramidDriver<'a> {
    codec: &'a dyn PixelCodec,
    source: PathBuf,
    config: EngineConfig,
    start: u32,
    end: u32,
    base_tile: Option<Size>,
    factory: WriterFactory<'a>,
    token: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
    state: PyramidState,
    pool: Option<ReaderPool>,
    level_tile: Size,
    current: Option<OpenLevel>,
    reports: Vec<LevelReport>,
}

impl<'a> PyramidDriver<'a> {
    pub fn new(
        codec: &'a dyn PixelCodec,
        source: impl Into<PathBuf>,
        config: EngineConfig,
        start: u32,
        end: u32,
        factory: WriterFactory<'a>,
    ) -> Result<Self, ConfigError> {
        if start > end || end > MAX_LEVEL {
            return Err(ConfigError::LevelRange { start, end });
        }
        Ok(Self {
            codec,
            source: source.into(),
            config,
            start,
            end,
            base_tile: None,
            factory,
            token: CancellationToken::new(),
            sink: None,
            state: PyramidState::Idle,
            pool: None,
            level_tile: Size::default(),
            current: None,
            reports: Vec::new(),
        })
    }

    /// Driver writing level `r` through `codec` to `dir/<stem>_level<r>.<extension>`.
    pub fn to_directory(
        codec: &'a dyn PixelCodec,
        source: impl Into<PathBuf>,
        config: EngineConfig,
        start: u32,
        end: u32,
        dir: &Path,
        extension: &str,
    ) -> Result<Self, ConfigError> {
        let source = source.into();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let dir = dir.to_path_buf();
        let extension = extension.to_string();
        let factory: WriterFactory<'a> = Box::new(move |level: u32, _series: &SeriesDescriptor| {
            codec.create(&level_path(&dir, &stem, level, &extension))
        });
        Self::new(codec, source, config, start, end, factory)
    }

    /// Tile size at full resolution; defaults to the native tile of the source.
    pub fn with_tile(mut self, tile: Size) -> Self {
        self.base_tile = Some(tile);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> PyramidState {
        self.state
    }

    /// Levels finished so far.
    pub fn reports(&self) -> &[LevelReport] {
        &self.reports
    }

    /// Advance one state. Errors release the open writer and readers and leave
    /// the driver `Done`; cancellation leaves it `Cancelled`.
    pub fn step(&mut self) -> EngineResult<PyramidState> {
        let result = self.advance();
        match result {
            Ok(state) => {
                self.state = state;
                if state.is_terminal() {
                    self.release()?;
                }
                Ok(state)
            }
            Err(e) => {
                self.state = if e.is_cancellation() {
                    PyramidState::Cancelled
                } else {
                    PyramidState::Done
                };
                if let Err(release_err) = self.release() {
                    log::warn!("cleanup after failed level: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Step until a terminal state.
    pub fn run(&mut self) -> EngineResult<Vec<LevelReport>> {
        loop {
            match self.step()? {
                PyramidState::Done => return Ok(self.reports.clone()),
                PyramidState::Cancelled => return Err(EngineError::Cancelled),
                _ => continue,
            }
        }
    }

    fn advance(&mut self) -> EngineResult<PyramidState> {
        match self.state {
            PyramidState::Idle => {
                let pool = ReaderPool::open(
                    self.codec,
                    &self.source,
                    self.config.effective_decoders(),
                )?;
                let native = pool.metadata().native_tile;
                self.pool = Some(pool);
                let base = self.base_tile.unwrap_or_else(|| {
                    Size::new(
                        self.config.nominal_tile_edge(native.width),
                        self.config.nominal_tile_edge(native.height),
                    )
                });
                if base.is_empty() {
                    return Err(ConfigError::InvalidTileSize {
                        width: base.width,
                        height: base.height,
                    }
                    .into());
                }
                self.level_tile = base.scaled_to_level(self.start);
                Ok(PyramidState::PreparingLevel(self.start))
            }
            PyramidState::PreparingLevel(level) => {
                self.token.check()?;
                self.prepare(level)?;
                Ok(PyramidState::ProcessingTiles(level))
            }
            PyramidState::ProcessingTiles(level) => {
                self.process(level)?;
                Ok(PyramidState::ClosingLevel(level))
            }
            PyramidState::ClosingLevel(level) => {
                if let Some(open) = self.current.take() {
                    let tiles = open.grid.len();
                    let tile = open.writer.series().tile;
                    let size = open.writer.series().geometry.size();
                    let peak_memory = open.tracker.peak_usage();
                    open.writer.close()?;
                    self.reports.push(LevelReport {
                        level,
                        size,
                        tile,
                        tiles,
                        peak_memory,
                    });
                    log::debug!("level {} closed", level);
                }
                if level >= self.end {
                    return Ok(PyramidState::Done);
                }
                self.level_tile = self.level_tile.scaled_to_level(1);
                Ok(PyramidState::PreparingLevel(level + 1))
            }
            state => Ok(state),
        }
    }

    fn prepare(&mut self, level: u32) -> EngineResult<()> {
        let pool = self.pool.as_ref().ok_or(EngineError::Cancelled)?;
        let geometry = pool.metadata().geometry;
        let scale = scale_factor(level).min(u32::MAX as u64) as u32;
        let level_size = geometry.size().scaled_to_level(level);
        let wanted = self.level_tile.min(level_size);
        let source_tile = Size::new(
            wanted.width.saturating_mul(scale),
            wanted.height.saturating_mul(scale),
        );

        let budget = MemoryBudget::new(
            self.config.effective_ceiling(),
            self.config.effective_workers(),
            geometry.bytes_per_pixel(),
        );
        let sizing = plan_tile_size(&budget, source_tile, level, 0)?;
        let grid = plan_grid(geometry.bounds(), sizing.source_tile, level)?;

        let series = SeriesDescriptor::new(
            geometry.at_level(level),
            grid.dest_tile_size(),
            self.config.compression,
        );
        log::info!(
            "level {}: {} in {}x{} tiles of {}",
            level,
            level_size,
            grid.cols(),
            grid.rows(),
            series.tile
        );
        let writer = TiledWriter::begin((self.factory)(level, &series)?, series)?;
        self.current = Some(OpenLevel {
            grid,
            writer,
            budget,
            tracker: MemoryTracker::new(sizing.remaining),
        });
        Ok(())
    }

    fn process(&mut self, level: u32) -> EngineResult<()> {
        let (Some(pool), Some(open)) = (self.pool.as_ref(), self.current.as_ref()) else {
            return Err(EngineError::Cancelled);
        };
        let mut progress = ProgressTracker::new(open.grid.len()).with_token(self.token.clone());
        if let Some(sink) = &self.sink {
            progress = progress.with_sink(sink.clone());
        }
        let writer = &open.writer;
        let backoff = Backoff::from_millis(
            self.config.memory_poll_initial_ms,
            self.config.memory_poll_max_ms,
        );
        TileScheduler::new(self.config.effective_workers()).run(
            open.grid.tiles(),
            &progress,
            |ctx| {
                let tile = ctx.tile();
                let _reservation = open.tracker.reserve(
                    open.budget.tile_cost(tile.source.size(), level),
                    ctx.token(),
                    backoff,
                )?;
                let block = {
                    let mut reader = pool.acquire(ctx.token())?;
                    reader.read_region(tile.source, level)?
                };
                ctx.checkpoint()?;
                writer.write_tile(&writer.descriptor(tile.col, tile.row), tile.dest, &block)?;
                Ok(())
            },
        )?;
        Ok(())
    }

    /// Close whatever is still open.
    fn release(&mut self) -> EngineResult<()> {
        let mut first_error = None;
        if let Some(open) = self.current.take() {
            if let Err(e) = open.writer.close() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.close() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PyramidDriver<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to release pyramid resources: {}", e);
        }
    }
}

/// Output path of one level.
pub fn level_path(dir: &Path, stem: &str, level: u32, extension: &str) -> PathBuf {
    dir.join(format!("{}_level{}.{}", stem, level, extension))
}
