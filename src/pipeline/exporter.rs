//! Re-encoding a tile provider into an output container.
//!
//! Tiles are streamed plane by plane in (channel, row, column) order, so a
//! container that stores separate planes receives each plane contiguously.

use crate::assembly::writer::TiledWriter;
use crate::codec::{PixelCodec, SeriesDescriptor};
use crate::core::config::EngineConfig;
use crate::core::error::{EngineResult, TileError};
use crate::execution::progress::{CancellationToken, LogProgressSink, ProgressSink};
use crate::tiles::provider::TileProvider;
use std::path::Path;
use std::sync::Arc;

/// Summary of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportReport {
    pub cols: u32,
    pub rows: u32,
    /// Planes written per tile
    pub planes: usize,
    /// Plane writes issued
    pub writes: usize,
}

/// Writes any [`TileProvider`] to a file through a codec.
pub struct TileExporter<'a> {
    codec: &'a dyn PixelCodec,
    config: EngineConfig,
    token: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl<'a> TileExporter<'a> {
    pub fn new(codec: &'a dyn PixelCodec, config: EngineConfig) -> Self {
        Self {
            codec,
            config,
            token: CancellationToken::new(),
            sink: Arc::new(LogProgressSink),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Export every tile of `provider` to `path`. The output is closed even
    /// when the export fails or is cancelled; a partial file is left behind.
    pub fn export(&self, provider: &dyn TileProvider, path: &Path) -> EngineResult<ExportReport> {
        let series = SeriesDescriptor::new(
            provider.geometry(),
            provider.tile_size(),
            self.config.compression,
        );
        log::info!(
            "exporting {} in {} tiles to {}",
            series.geometry,
            series.tile,
            path.display()
        );
        let writer = TiledWriter::begin(self.codec.create(path)?, series)?;
        let result = self.stream(provider, &writer);
        let closed = writer.close();
        let report = result?;
        closed?;
        Ok(report)
    }

    fn stream(&self, provider: &dyn TileProvider, writer: &TiledWriter) -> EngineResult<ExportReport> {
        let (cols, rows) = (provider.cols(), provider.rows());
        let planes = writer.plane_count();
        let total = planes * cols as usize * rows as usize;
        self.sink.notify(f64::NAN, "Initializing file writing...");

        let mut written = 0usize;
        for plane in 0..planes {
            for row in 0..rows {
                for col in 0..cols {
                    self.token.check()?;
                    let rect = provider.tile_rect(col, row).ok_or_else(|| {
                        TileError::encode(
                            provider.geometry().bounds(),
                            format!("tile ({}, {}) is outside the image", col, row),
                        )
                    })?;
                    let tile = provider.get_tile(col, row)?;
                    writer.write_plane(plane, &writer.descriptor(col, row), rect, &tile)?;
                    written += 1;
                    self.sink.notify(
                        written as f64 / total as f64,
                        &format!("Writing tile {} of {}...", written, total),
                    );
                }
            }
        }

        Ok(ExportReport {
            cols,
            rows,
            planes,
            writes: written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryCodec;
    use crate::core::buffer::PixelBlock;
    use crate::core::region::{Rect, Size};
    use crate::core::types::SampleType;
    use crate::tiles::provider::BlockTileProvider;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<(f64, String)>>>, Arc<dyn ProgressSink>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |p: f64, m: &str| {
            sink_log.lock().push((p, m.to_string()));
        });
        (log, sink)
    }

    #[test]
    fn test_separate_planes_stream_channel_row_col() {
        let block = PixelBlock::from_fn(Size::new(10, 6), 2, SampleType::U16, |c, x, y| {
            (x * 100 + y * 10 + c as u32) as f64
        });
        let provider = BlockTileProvider::new(block.clone(), Size::new(4, 4)).unwrap();
        let codec = MemoryCodec::new();
        let (log, sink) = recorder();
        let report = TileExporter::new(&codec, EngineConfig::default())
            .with_sink(sink)
            .export(&provider, Path::new("out.img"))
            .unwrap();
        assert_eq!(report, ExportReport { cols: 3, rows: 2, planes: 2, writes: 12 });

        let out = codec.output("out.img").unwrap();
        assert!(out.closed);
        assert_eq!(out.series.len(), 1);
        assert_eq!(out.series[0].tile, Size::new(4, 4));
        let order: Vec<_> = out
            .writes
            .iter()
            .map(|w| (w.channel, w.tile.row, w.tile.col))
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(out.writes[2].rect, Rect::new(8, 0, 2, 4));
        assert_eq!(out.block.unwrap(), block);

        let log = log.lock();
        assert!(log[0].0.is_nan());
        assert_eq!(log[0].1, "Initializing file writing...");
        assert_eq!(log[1].1, "Writing tile 1 of 12...");
        assert_eq!(log.last().unwrap().0, 1.0);
    }

    #[test]
    fn test_fused_layout_single_plane() {
        let block = PixelBlock::from_fn(Size::new(9, 9), 3, SampleType::U8, |c, x, y| (x + y + c as u32) as f64);
        let provider = BlockTileProvider::new(block.clone(), Size::new(5, 5)).unwrap();
        let codec = MemoryCodec::new();
        let report = TileExporter::new(&codec, EngineConfig::default())
            .export(&provider, Path::new("rgb.img"))
            .unwrap();
        assert_eq!(report.planes, 1);
        assert_eq!(report.writes, 4);
        assert_eq!(codec.output("rgb.img").unwrap().block.unwrap(), block);
    }

    #[test]
    fn test_cancelled_export_closes_writer() {
        let block = PixelBlock::new(Size::new(16, 16), 1, SampleType::U8);
        let provider = BlockTileProvider::new(block, Size::new(4, 4)).unwrap();
        let codec = MemoryCodec::new();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |p: f64, _: &str| {
            if p >= 0.25 {
                cancel.cancel();
            }
        });
        let err = TileExporter::new(&codec, EngineConfig::default())
            .with_token(token)
            .with_sink(sink)
            .export(&provider, Path::new("out.img"))
            .unwrap_err();
        assert!(err.is_cancellation());
        let out = codec.output("out.img").unwrap();
        assert!(out.closed);
        assert_eq!(out.writes.len(), 4);
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_write_failure_propagates() {
        let block = PixelBlock::new(Size::new(8, 8), 1, SampleType::U8);
        let provider = BlockTileProvider::new(block, Size::new(4, 4)).unwrap();
        let codec = MemoryCodec::new();
        codec.fail_writes_in(Rect::new(5, 5, 1, 1));
        let err = TileExporter::new(&codec, EngineConfig::default())
            .export(&provider, Path::new("out.img"))
            .unwrap_err();
        assert!(err.to_string().contains("injected write failure"));
        assert_eq!(codec.open_handles(), 0);
    }
}
