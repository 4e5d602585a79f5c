//! Core types for the bigimage transcoding engine.
//!
//! This module contains the foundational types every stage shares:
//! - Pixel-space value types (Size, Rect)
//! - Image descriptors and the channel layout rule
//! - The planar pixel buffer
//! - Error types
//! - Engine configuration

pub mod region;
pub mod types;
pub mod buffer;
pub mod error;
pub mod config;

// Re-export commonly used types
pub use region::{Rect, Size, scale_ceil, align_up};
pub use types::{SampleType, ImageGeometry, PixelSize, ChannelLayout, separate_channels};
pub use buffer::PixelBlock;
pub use error::{EngineError, ConfigError, TileError, EngineResult, TileResult};
pub use config::{EngineConfig, Compression};
