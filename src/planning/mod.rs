//! Pure planning functions: which tiles to run, and how big they may be.

pub mod grid;
pub mod budget;

pub use grid::{plan_grid, scale_factor, Tile, TileGrid};
pub use budget::{
    plan_tile_size, Backoff, MemoryBudget, MemoryReservation, MemoryTracker, TileSizing,
    MIN_TILE_EDGE,
};
