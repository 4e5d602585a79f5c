//! Error types for bigimage.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Be raised before any I/O whenever the problem is a bad request
//! - Carry the tile rectangle that failed during a batch
//! - Keep cancellation distinguishable from failure

use crate::core::region::{Rect, Size};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a transcode operation.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    #[error("Insufficient memory: need {required} bytes, have {available} bytes")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A worker thread panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Invalid requests. Raised before any I/O and never retried.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Region is empty")]
    EmptyRegion,

    #[error("Region {region} does not intersect image bounds {bounds}")]
    RegionOutOfBounds { region: Rect, bounds: Rect },

    #[error("Invalid tile size {width}x{height}")]
    InvalidTileSize { width: u32, height: u32 },

    #[error("Tile {tile} is smaller than the scale factor {scale}")]
    TileSmallerThanScale { tile: Size, scale: u32 },

    #[error("Image has zero channels")]
    ZeroChannels,

    #[error("Unsupported sample type: {0}")]
    UnsupportedSampleType(String),

    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("Worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("Thresholds must be a non-empty list of finite values")]
    InvalidThresholds,

    #[error("Background has {actual} value(s), image has {expected} channel(s)")]
    BackgroundChannels { expected: usize, actual: usize },

    #[error("Invalid level range {start}..={end}")]
    LevelRange { start: u32, end: u32 },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Failures of a single tile job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
    #[error("Failed to decode {rect}: {message}")]
    Decode { rect: Rect, message: String },

    #[error("Failed to encode {rect}: {message}")]
    Encode { rect: Rect, message: String },

    #[error("Tile of size {actual} does not cover destination of size {expected}")]
    SizeMismatch { expected: Size, actual: Size },
}

// ============================================================================
// Error Utilities
// ============================================================================

impl TileError {
    /// Build a decode error for `rect`.
    pub fn decode(rect: Rect, message: impl Into<String>) -> Self {
        TileError::Decode {
            rect,
            message: message.into(),
        }
    }

    /// Build an encode error for `rect`.
    pub fn encode(rect: Rect, message: impl Into<String>) -> Self {
        TileError::Encode {
            rect,
            message: message.into(),
        }
    }

    /// True for errors raised on the write path. A size mismatch counts.
    pub fn is_encode(&self) -> bool {
        matches!(self, TileError::Encode { .. } | TileError::SizeMismatch { .. })
    }
}

impl EngineError {
    /// Check if this is the cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Whether a caller may sensibly retry. Nothing here retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Configuration(_)
            | EngineError::InsufficientMemory { .. }
            | EngineError::Cancelled
            | EngineError::WorkerPanicked => false,
            EngineError::Tile(e) => !matches!(e, TileError::SizeMismatch { .. }),
            EngineError::Io(_) | EngineError::Image(_) => true,
        }
    }

    /// Get suggestion for fixing this error.
    pub fn suggested_fix(&self) -> Option<String> {
        match self {
            EngineError::InsufficientMemory { required, .. } => Some(format!(
                "Raise the memory ceiling above {} bytes or lower the worker count",
                required
            )),
            EngineError::Configuration(ConfigError::RegionOutOfBounds { bounds, .. }) => {
                Some(format!("Pick a region inside {}", bounds))
            }
            EngineError::Configuration(ConfigError::TileSmallerThanScale { scale, .. }) => {
                Some(format!("Use tiles of at least {0}x{0} pixels", scale))
            }
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for single tile operations.
pub type TileResult<T> = Result<T, TileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch_is_encode() {
        let e = TileError::SizeMismatch {
            expected: Size::new(10, 10),
            actual: Size::new(5, 10),
        };
        assert!(e.is_encode());
        assert!(!TileError::decode(Rect::new(0, 0, 1, 1), "boom").is_encode());
    }

    #[test]
    fn test_cancellation_is_not_retryable() {
        assert!(EngineError::Cancelled.is_cancellation());
        assert!(!EngineError::Cancelled.is_retryable());
        let mem = EngineError::InsufficientMemory {
            required: 10,
            available: 1,
        };
        assert!(!mem.is_retryable());
        assert!(mem.suggested_fix().unwrap().contains("10"));
    }

    #[test]
    fn test_conversions() {
        let err: EngineError = ConfigError::ZeroChannels.into();
        assert!(matches!(err, EngineError::Configuration(ConfigError::ZeroChannels)));
        let err: EngineError = TileError::encode(Rect::new(1, 2, 3, 4), "disk full").into();
        assert!(err.to_string().contains("disk full"));
    }
}
