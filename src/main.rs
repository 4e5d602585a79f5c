//! Bigimage CLI - tiled transcoding of very large images
//!
//! Every command reads through the raster codec and logs its progress.

use anyhow::{Context, Result};
use bigimage::codec::raster::RasterCodec;
use bigimage::codec::PixelCodec;
use bigimage::prelude::*;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Deepest level the CLI accepts.
const MAX_LEVEL: u32 = 31;

#[derive(Parser, Debug)]
#[command(name = "bigimage", version, about = "Tiled, memory-bounded image transcoding")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "BIGIMAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Process memory allowance in MiB
    #[arg(long = "memory-mb", global = true)]
    memory_mb: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print geometry, channel layout and native tile size
    Info {
        input: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a region, optionally downsampled, into an ordinary raster file
    Import {
        input: PathBuf,
        output: PathBuf,
        /// Region as x,y,w,h in full-resolution pixels
        #[arg(long, value_parser = parse_rect)]
        region: Option<Rect>,
        #[command(flatten)]
        resolution: ResolutionArgs,
    },
    /// Re-encode through the tiled exporter
    Transfer {
        input: PathBuf,
        output: PathBuf,
        /// Output tile size as WxH
        #[arg(long, value_parser = parse_size)]
        tile: Option<Size>,
        /// Downsample by 2^LEVEL, reading through the block cache
        #[arg(long, default_value_t = 0)]
        level: u32,
    },
    /// Classify samples against thresholds into an 8-bit label image
    Threshold {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_parser = parse_list, value_delimiter = ',', required = true)]
        thresholds: Vec<f64>,
        /// Count thresholds from the top
        #[arg(long)]
        invert: bool,
        #[arg(long, value_parser = parse_size)]
        tile: Option<Size>,
        #[arg(long, default_value_t = 0)]
        level: u32,
    },
    /// Write one file per pyramid level
    Pyramid {
        input: PathBuf,
        output_dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        start: u32,
        #[arg(long)]
        end: u32,
        #[arg(long, value_parser = parse_size)]
        tile: Option<Size>,
        #[arg(long, default_value = "tif")]
        extension: String,
    },
    /// Save every tile that differs from the background
    Slice {
        input: PathBuf,
        output_dir: PathBuf,
        #[arg(long, value_parser = parse_size)]
        tile: Size,
        /// Background value per channel
        #[arg(long, value_parser = parse_list, value_delimiter = ',', required = true)]
        background: Vec<f64>,
        #[arg(long = "content-threshold")]
        content_threshold: f64,
        #[arg(long, default_value = "tif")]
        extension: String,
    },
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct ResolutionArgs {
    /// Downsample by 2^LEVEL
    #[arg(long)]
    level: Option<u32>,
    /// Smallest downsampling fitting within WxH
    #[arg(long, value_parser = parse_size)]
    fit: Option<Size>,
}

impl ResolutionArgs {
    fn resolution(&self) -> Resolution {
        match (self.level, self.fit) {
            (_, Some(size)) => Resolution::FitWithin(size),
            (Some(level), None) => Resolution::Level(level),
            (None, None) => Resolution::Level(0),
        }
    }
}

fn parse_size(text: &str) -> Result<Size, String> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{}'", text))?;
    let width = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let height = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
    Ok(Size::new(width, height))
}

fn parse_rect(text: &str) -> Result<Rect, String> {
    let parts = text
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] => {
            let rect = Rect::new(*x, *y, *w, *h);
            if rect.has_valid_extent() {
                Ok(rect)
            } else {
                Err(format!("region '{}' extends past the largest coordinate", text))
            }
        }
        _ => Err(format!("expected x,y,w,h, got '{}'", text)),
    }
}

fn parse_list(text: &str) -> Result<f64, String> {
    text.trim().parse::<f64>().map_err(|e| e.to_string())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    if let Some(mb) = cli.memory_mb {
        config = config.with_memory_limit_mb(mb);
    }
    config.validate()?;
    Ok(config)
}

/// Tile size for tiled output: the native tile, capped, or the fallback edge.
fn default_tile(pool: &ReaderPool, config: &EngineConfig) -> Size {
    let native = pool.metadata().native_tile;
    if native.is_empty() {
        Size::square(config.fallback_tile_edge)
    } else {
        Size::new(
            config.nominal_tile_edge(native.width),
            config.nominal_tile_edge(native.height),
        )
    }
}

/// Tiles of one pyramid level. Full resolution is read directly; downsampled
/// levels go through the two-level cache since every tile of a coarse block
/// would otherwise decode the same source pixels again.
enum LevelTiles {
    Direct(DirectTileProvider),
    Cached(TileCache),
}

impl LevelTiles {
    fn open(
        codec: &dyn PixelCodec,
        input: &Path,
        level: u32,
        tile: Option<Size>,
        config: &EngineConfig,
    ) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(ConfigError::LevelRange {
                start: level,
                end: MAX_LEVEL,
            }
            .into());
        }
        let pool = ReaderPool::open(codec, input, config.effective_decoders())?;
        let tile = tile.unwrap_or_else(|| default_tile(&pool, config).scaled_to_level(level));
        if level == 0 {
            Ok(LevelTiles::Direct(DirectTileProvider::new(pool, 0, tile)))
        } else {
            Ok(LevelTiles::Cached(TileCache::from_config(pool, level, tile, config)?))
        }
    }

    fn close(self) -> Result<()> {
        match self {
            LevelTiles::Direct(provider) => provider.close()?,
            LevelTiles::Cached(cache) => {
                let stats = cache.stats();
                log::info!(
                    "cache: {} hit(s), {} miss(es), {} block(s), {:.0}% hit ratio",
                    stats.hits,
                    stats.misses,
                    stats.blocks,
                    stats.hit_ratio() * 100.0
                );
                cache.close()?;
            }
        }
        Ok(())
    }
}

impl TileProvider for LevelTiles {
    fn geometry(&self) -> ImageGeometry {
        match self {
            LevelTiles::Direct(p) => p.geometry(),
            LevelTiles::Cached(c) => c.geometry(),
        }
    }

    fn tile_size(&self) -> Size {
        match self {
            LevelTiles::Direct(p) => p.tile_size(),
            LevelTiles::Cached(c) => c.tile_size(),
        }
    }

    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock> {
        match self {
            LevelTiles::Direct(p) => p.get_tile(col, row),
            LevelTiles::Cached(c) => c.get_tile(col, row),
        }
    }
}

fn info(codec: &dyn PixelCodec, input: &Path, json: bool) -> Result<()> {
    let mut reader = codec.open(input)?;
    let metadata = reader.metadata().clone();
    reader.close()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }
    let geometry = &metadata.geometry;
    println!("Image:        {}", metadata.name);
    println!("Geometry:     {}", geometry);
    println!("Layout:       {:?}", geometry.channel_layout());
    if metadata.native_tile.is_empty() {
        println!("Native tile:  none");
    } else {
        println!("Native tile:  {}", metadata.native_tile);
    }
    let pixel = metadata.pixel_size();
    println!("Pixel size:   {} x {} x {}", pixel.x, pixel.y, pixel.z);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let codec = RasterCodec::new();
    let sink: Arc<dyn ProgressSink> = Arc::new(LogProgressSink);

    match cli.command {
        Command::Info { input, json } => info(&codec, &input, json)?,
        Command::Import {
            input,
            output,
            region,
            resolution,
        } => {
            let mut request = ImportRequest::new(&input).with_resolution(resolution.resolution());
            if let Some(region) = region {
                request = request.with_region(region);
            }
            let image = LargeImageImporter::new(&codec, config.clone())
                .with_sink(sink)
                .import(&request)?;
            bigimage::codec::write_all(&codec, &output, &image.pixels, config.compression)?;
            println!(
                "Imported {} at level {} as {} to {}",
                image.region,
                image.level,
                image.pixels.size(),
                output.display()
            );
        }
        Command::Transfer {
            input,
            output,
            tile,
            level,
        } => {
            let provider = LevelTiles::open(&codec, &input, level, tile, &config)?;
            let result = TileExporter::new(&codec, config)
                .with_sink(sink)
                .export(&provider, &output);
            provider.close()?;
            let report = result?;
            println!(
                "Wrote {}x{} tiles ({} plane writes) to {}",
                report.cols,
                report.rows,
                report.writes,
                output.display()
            );
        }
        Command::Threshold {
            input,
            output,
            thresholds,
            invert,
            tile,
            level,
        } => {
            let provider = LevelTiles::open(&codec, &input, level, tile, &config)?;
            let labels = ThresholdedTileProvider::new(provider, &thresholds, invert)?;
            let result = TileExporter::new(&codec, config)
                .with_sink(sink)
                .export(&labels, &output);
            labels.into_inner().close()?;
            result?;
            println!("Wrote {} classes to {}", thresholds.len() + 1, output.display());
        }
        Command::Pyramid {
            input,
            output_dir,
            start,
            end,
            tile,
            extension,
        } => {
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("creating {}", output_dir.display()))?;
            let mut driver = PyramidDriver::to_directory(
                &codec,
                &input,
                config,
                start,
                end,
                &output_dir,
                &extension,
            )?
            .with_sink(sink);
            if let Some(tile) = tile {
                driver = driver.with_tile(tile);
            }
            for level in driver.run()? {
                println!(
                    "Level {}: {} in {} tiles of {}",
                    level.level, level.size, level.tiles, level.tile
                );
            }
        }
        Command::Slice {
            input,
            output_dir,
            tile,
            background,
            content_threshold,
            extension,
        } => {
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("creating {}", output_dir.display()))?;
            let options =
                SliceOptions::new(tile, background, content_threshold).with_extension(extension);
            let report = TileSlicer::new(&codec, config)
                .with_sink(sink)
                .slice(&input, &output_dir, &options)?;
            println!(
                "Saved {} of {} tiles to {}",
                report.saved.len(),
                report.tiles,
                output_dir.display()
            );
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    log::debug!("{} v{}", bigimage::NAME, bigimage::VERSION);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        if let Some(fix) = e
            .downcast_ref::<EngineError>()
            .and_then(EngineError::suggested_fix)
        {
            eprintln!("  Suggestion: {}", fix);
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512x256").unwrap(), Size::new(512, 256));
        assert!(parse_size("512").is_err());
    }

    #[test]
    fn test_parse_rect() {
        assert_eq!(parse_rect("1, 2,3,4").unwrap(), Rect::new(1, 2, 3, 4));
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_rect("4294967290,0,10,10").is_err());
    }

    #[test]
    fn test_downsampled_levels_read_through_cache() {
        use bigimage::codec::MemoryCodec;

        let codec = MemoryCodec::new();
        let image = PixelBlock::from_fn(Size::new(50, 30), 1, SampleType::U8, |_, x, y| {
            ((x * 7 + y * 3) % 256) as f64
        });
        codec.insert_block("in.img", image.clone(), Size::square(16)).unwrap();
        let config = EngineConfig::default()
            .with_workers(2)
            .with_decoders(2)
            .with_cache_tile_edge(12);

        let tiles = LevelTiles::open(&codec, Path::new("in.img"), 1, None, &config).unwrap();
        assert!(matches!(tiles, LevelTiles::Cached(_)));
        assert_eq!(tiles.tile_size(), Size::square(8));
        TileExporter::new(&codec, config.clone())
            .export(&tiles, Path::new("out.img"))
            .unwrap();
        tiles.close().unwrap();
        let written = codec.output("out.img").unwrap().block.unwrap();
        assert_eq!(written, image.downsample(1));

        let direct = LevelTiles::open(&codec, Path::new("in.img"), 0, None, &config).unwrap();
        assert!(matches!(direct, LevelTiles::Direct(_)));
        direct.close().unwrap();
        assert_eq!(codec.open_handles(), 0);

        assert!(LevelTiles::open(&codec, Path::new("in.img"), 40, None, &config).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_threshold_list_and_resolution() {
        let cli = Cli::parse_from([
            "bigimage", "--workers", "2", "threshold", "in.png", "out.png", "--thresholds", "10,20.5",
        ]);
        match cli.command {
            Command::Threshold { thresholds, .. } => assert_eq!(thresholds, vec![10.0, 20.5]),
            other => panic!("unexpected {:?}", other),
        }
        let cli = Cli::parse_from(["bigimage", "import", "a", "b", "--fit", "100x100"]);
        match cli.command {
            Command::Import { resolution, .. } => {
                assert_eq!(resolution.resolution(), Resolution::FitWithin(Size::square(100)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
