//! Engine configuration.
//!
//! Every knob has a default, so an empty TOML file is a valid configuration.
//!
//! ```ignore
//! let config = EngineConfig::new()
//!     .with_memory_limit_mb(2048)
//!     .with_workers(6);
//! ```

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// Memory allowance used when the system cannot report available memory (500 MB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 500 * 1024 * 1024;

/// Share of the memory allowance usable by one operation when no ceiling is given.
pub const DEFAULT_CEILING_FRACTION: f64 = 0.75;

/// Native tile sizes above this are capped.
pub const MAX_TILE_EDGE: u32 = 2048;

/// Tile edge used when the codec reports no native tiling.
pub const FALLBACK_TILE_EDGE: u32 = 256;

/// Edge of one coarse block in the two-level cache.
pub const CACHE_TILE_EDGE: u32 = 1500;

/// Compression applied by the output container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lzw,
}

impl Compression {
    /// Parse `none` or `lzw`.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Compression::None),
            "lzw" => Ok(Compression::Lzw),
            other => Err(ConfigError::Parse(format!("unknown compression '{}'", other))),
        }
    }
}

/// Configuration shared by all transcode operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Process memory allowance in bytes (None = memory available at run time).
    pub memory_limit: Option<u64>,
    /// Explicit byte ceiling for one operation; defaults to 75% of the allowance.
    pub memory_ceiling: Option<u64>,
    /// Worker threads (None = processors - 1, at least 1).
    pub workers: Option<usize>,
    /// Independent decoder handles in the reader pool (None = workers).
    pub decoders: Option<usize>,
    /// Cap applied to native tile sizes.
    pub max_tile_edge: u32,
    /// Tile edge used when the source has no native tiling.
    pub fallback_tile_edge: u32,
    /// Coarse block edge of the two-level cache.
    pub cache_tile_edge: u32,
    /// Output compression.
    pub compression: Compression,
    /// First memory-wait backoff step.
    pub memory_poll_initial_ms: u64,
    /// Longest memory-wait backoff step.
    pub memory_poll_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            memory_ceiling: None,
            workers: None,
            decoders: None,
            max_tile_edge: MAX_TILE_EDGE,
            fallback_tile_edge: FALLBACK_TILE_EDGE,
            cache_tile_edge: CACHE_TILE_EDGE,
            compression: Compression::default(),
            memory_poll_initial_ms: 5,
            memory_poll_max_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::InvalidPath(path.to_path_buf()))?;
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values no operation can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) || self.decoders == Some(0) {
            return Err(ConfigError::InvalidWorkerCount);
        }
        for edge in [self.max_tile_edge, self.fallback_tile_edge, self.cache_tile_edge] {
            if edge == 0 {
                return Err(ConfigError::InvalidTileSize {
                    width: edge,
                    height: edge,
                });
            }
        }
        Ok(())
    }

    /// Set the memory allowance in bytes.
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Set the memory allowance in megabytes.
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit = Some(mb.saturating_mul(1024 * 1024));
        self
    }

    /// Override the per-operation byte ceiling.
    pub fn with_memory_ceiling(mut self, ceiling: u64) -> Self {
        self.memory_ceiling = Some(ceiling);
        self
    }

    /// Set the number of worker threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the number of pooled decoder handles.
    pub fn with_decoders(mut self, decoders: usize) -> Self {
        self.decoders = Some(decoders);
        self
    }

    /// Set the cache block edge.
    pub fn with_cache_tile_edge(mut self, edge: u32) -> Self {
        self.cache_tile_edge = edge;
        self
    }

    /// Set output compression.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Byte ceiling one operation must stay under.
    pub fn effective_ceiling(&self) -> u64 {
        self.memory_ceiling
            .unwrap_or_else(|| (self.effective_memory_limit() as f64 * DEFAULT_CEILING_FRACTION) as u64)
    }

    /// Memory allowance actually used: the configured limit, else what the
    /// system reports as available right now.
    pub fn effective_memory_limit(&self) -> u64 {
        self.memory_limit.unwrap_or_else(available_memory)
    }

    /// Worker count actually used.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }

    /// Decoder pool size actually used.
    pub fn effective_decoders(&self) -> usize {
        self.decoders.unwrap_or_else(|| self.effective_workers()).max(1)
    }

    /// Nominal tile edge for a codec-reported native tile edge (0 = none).
    pub fn nominal_tile_edge(&self, native: u32) -> u32 {
        if native == 0 {
            self.fallback_tile_edge
        } else {
            native.min(self.max_tile_edge)
        }
    }
}

/// Bytes of memory the system can hand out now, [`DEFAULT_MEMORY_LIMIT`] when
/// it does not say.
pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    match system.available_memory() {
        0 => DEFAULT_MEMORY_LIMIT,
        bytes => bytes,
    }
}

/// `max(1, available_parallelism - 1)`.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
