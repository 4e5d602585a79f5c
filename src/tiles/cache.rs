//! Two-level tile cache.
//!
//! Tile requests are served from coarse blocks (`cache_tile_edge` pixels on a
//! side, in level space) decoded once per open source. A request composites
//! every coarse block it overlaps. Blocks are never evicted; the cache lives
//! exactly as long as its reader pool and is dropped by [`TileCache::close`].
//!
//! Concurrent misses on the same block may both decode it. The later insert
//! wins and both callers see identical pixels.

use super::provider::{outside_grid, source_rect, TileProvider};
use crate::core::buffer::PixelBlock;
use crate::core::config::EngineConfig;
use crate::core::error::{ConfigError, EngineResult};
use crate::core::region::{Rect, Size};
use crate::core::types::ImageGeometry;
use crate::execution::pool::{PoolReport, ReaderPool};
use crate::execution::progress::CancellationToken;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Coarse lookups answered from the map.
    pub hits: u64,
    /// Coarse lookups that had to decode.
    pub misses: u64,
    /// Coarse blocks currently held.
    pub blocks: usize,
    /// Bytes held by cached blocks.
    pub bytes: usize,
    /// Time spent decoding coarse blocks.
    pub decode_time: Duration,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

type BlockKey = (u32, u32);

/// Coarse-block cache in front of a reader pool.
pub struct TileCache {
    pool: ReaderPool,
    level: u32,
    tile: Size,
    block_edge: u32,
    token: CancellationToken,
    blocks: RwLock<HashMap<BlockKey, Arc<PixelBlock>>>,
    stats: Mutex<CacheStats>,
}

impl TileCache {
    /// Cache over `pool` serving `tile`-sized tiles at `level`, backed by
    /// square coarse blocks of `block_edge` level pixels.
    pub fn new(pool: ReaderPool, level: u32, tile: Size, block_edge: u32) -> EngineResult<Self> {
        if tile.is_empty() || block_edge == 0 {
            return Err(ConfigError::InvalidTileSize {
                width: tile.width.min(block_edge),
                height: tile.height.min(block_edge),
            }
            .into());
        }
        Ok(Self {
            pool,
            level,
            tile,
            block_edge,
            token: CancellationToken::new(),
            blocks: RwLock::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    /// Cache whose block edge is the configured `cache_tile_edge`.
    pub fn from_config(
        pool: ReaderPool,
        level: u32,
        tile: Size,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        Self::new(pool, level, tile, config.cache_tile_edge)
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn block_edge(&self) -> u32 {
        self.block_edge
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let blocks = self.blocks.read();
        let mut stats = self.stats.lock().clone();
        stats.blocks = blocks.len();
        stats.bytes = blocks.values().map(|b| b.byte_len()).sum();
        stats
    }

    /// Keys of the coarse blocks overlapping a level-space rectangle.
    fn keys_for(&self, rect: Rect) -> impl Iterator<Item = BlockKey> {
        let edge = self.block_edge;
        let (c0, c1) = (rect.x / edge, (rect.right() - 1) / edge);
        let (r0, r1) = (rect.y / edge, (rect.bottom() - 1) / edge);
        (r0..=r1).flat_map(move |r| (c0..=c1).map(move |c| (c, r)))
    }

    fn block_rect(&self, key: BlockKey) -> Rect {
        let edge = self.block_edge;
        let nominal = Rect::new(key.0 * edge, key.1 * edge, edge, edge);
        self.geometry()
            .bounds()
            .intersection(&nominal)
            .unwrap_or_default()
    }

    /// Fetch a coarse block, decoding it on a miss.
    fn block(&self, key: BlockKey) -> EngineResult<Arc<PixelBlock>> {
        if let Some(block) = self.blocks.read().get(&key) {
            self.stats.lock().hits += 1;
            return Ok(block.clone());
        }

        let rect = self.block_rect(key);
        let full = self.pool.metadata().geometry.size();
        let started = Instant::now();
        let decoded = {
            let mut reader = self.pool.acquire(&self.token)?;
            reader.read_region(source_rect(rect, self.level, full), self.level)?
        };
        {
            let mut stats = self.stats.lock();
            stats.misses += 1;
            stats.decode_time += started.elapsed();
        }
        log::trace!("cached block {:?} at {}", key, rect);

        let block = Arc::new(decoded);
        self.blocks.write().insert(key, block.clone());
        Ok(block)
    }

    /// Composite a level-space rectangle from coarse blocks.
    pub fn read_level_rect(&self, rect: Rect) -> EngineResult<PixelBlock> {
        let geometry = self.geometry();
        let mut out = PixelBlock::new(rect.size(), geometry.channels, geometry.sample_type);
        if rect.is_empty() {
            return Ok(out);
        }
        for key in self.keys_for(rect) {
            self.token.check()?;
            let block_rect = self.block_rect(key);
            let Some(overlap) = block_rect.intersection(&rect) else {
                continue;
            };
            let block = self.block(key)?;
            block.blit(
                overlap.relative_to(block_rect.x, block_rect.y),
                &mut out,
                overlap.x - rect.x,
                overlap.y - rect.y,
            )?;
        }
        Ok(out)
    }

    /// Drop every cached block and close the readers.
    pub fn close(self) -> EngineResult<PoolReport> {
        let stats = self.stats();
        log::debug!(
            "closing tile cache: {} block(s), {} bytes, hit ratio {:.2}",
            stats.blocks,
            stats.bytes,
            stats.hit_ratio()
        );
        drop(self.blocks);
        self.pool.close()
    }
}

impl TileProvider for TileCache {
    fn geometry(&self) -> ImageGeometry {
        self.pool.metadata().geometry.at_level(self.level)
    }

    fn tile_size(&self) -> Size {
        self.tile
    }

    fn get_tile(&self, col: u32, row: u32) -> EngineResult<PixelBlock> {
        let rect = self.tile_rect(col, row).ok_or_else(|| outside_grid(col, row))?;
        self.read_level_rect(rect)
    }
}
