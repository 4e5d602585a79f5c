//! Memory-budget driven tile sizing.
//!
//! [`plan_tile_size`] shrinks a working tile until `2 * workers` copies of its
//! decode + downsample working set fit in what the resident canvas leaves of
//! the ceiling. [`MemoryTracker`] then enforces that budget at run time: a job
//! reserves its tile cost before decoding and waits with backoff when the
//! budget is momentarily exhausted.

use crate::core::error::{EngineError, EngineResult};
use crate::core::region::{align_up, Size};
use crate::execution::progress::CancellationToken;
use crate::planning::grid::scale_factor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Tiles are not halved below this edge.
pub const MIN_TILE_EDGE: u32 = 8;

/// Inputs of the tile-size search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Byte ceiling for the whole operation
    pub ceiling: u64,
    /// Concurrent workers
    pub workers: usize,
    /// Bytes per pixel across all channels
    pub bytes_per_pixel: u64,
}

impl MemoryBudget {
    pub fn new(ceiling: u64, workers: usize, bytes_per_pixel: u64) -> Self {
        Self {
            ceiling,
            workers: workers.max(1),
            bytes_per_pixel,
        }
    }

    /// Working-set bytes of one tile: its source block plus its downsampled block.
    pub fn tile_cost(&self, source: Size, level: u32) -> u64 {
        let dest = source.scaled_to_level(level);
        self.bytes_per_pixel * (source.area() + dest.area())
    }
}

/// Result of the tile-size search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSizing {
    /// Nominal source tile
    pub source_tile: Size,
    /// Nominal destination tile
    pub dest_tile: Size,
    /// Working-set bytes of one nominal tile
    pub estimated_tile_cost: u64,
    /// Budget left once resident data is accounted for
    pub remaining: u64,
}

fn halve_axis(edge: u32, scale: u32) -> u32 {
    align_up(edge.div_ceil(2), scale)
}

/// Pick the largest tile, starting at `start`, whose working set fits the budget.
///
/// `resident_bytes` is memory the operation holds for its whole duration (the
/// destination canvas, for instance). Halving keeps tiles a multiple of
/// `2^level` so grid tiles start on whole destination pixels. Deterministic.
pub fn plan_tile_size(
    budget: &MemoryBudget,
    start: Size,
    level: u32,
    resident_bytes: u64,
) -> EngineResult<TileSizing> {
    if budget.ceiling < resident_bytes {
        return Err(EngineError::InsufficientMemory {
            required: resident_bytes,
            available: budget.ceiling,
        });
    }
    let remaining = budget.ceiling - resident_bytes;
    let slots = 2 * budget.workers as u64;
    let scale = scale_factor(level).min(u32::MAX as u64) as u32;

    let mut source = start;
    let mut dest = source.scaled_to_level(level);
    let mut cost = budget.tile_cost(source, level);

    while remaining / slots < cost
        && (source.width > MIN_TILE_EDGE || source.height > MIN_TILE_EDGE)
        && dest.width > 1
        && dest.height > 1
    {
        let mut next = source;
        if source.width > MIN_TILE_EDGE {
            next.width = halve_axis(source.width, scale).min(source.width);
        }
        if source.height > MIN_TILE_EDGE {
            next.height = halve_axis(source.height, scale).min(source.height);
        }
        if next == source {
            break;
        }
        source = next;
        dest = source.scaled_to_level(level);
        cost = budget.tile_cost(source, level);
    }

    if remaining < cost {
        return Err(EngineError::InsufficientMemory {
            required: resident_bytes + cost,
            available: budget.ceiling,
        });
    }

    log::debug!(
        "tile size {} -> {} (cost {} bytes, {} bytes free for {} workers)",
        start,
        source,
        cost,
        remaining,
        budget.workers
    );

    Ok(TileSizing {
        source_tile: source,
        dest_tile: dest,
        estimated_tile_cost: cost,
        remaining,
    })
}

/// Run-time accounting of tile working sets.
#[derive(Debug)]
pub struct MemoryTracker {
    /// Current reserved bytes.
    current: AtomicU64,
    /// Peak reserved bytes.
    peak: AtomicU64,
    /// Byte limit.
    limit: u64,
}

impl MemoryTracker {
    /// Create a new memory tracker with the given limit.
    pub fn new(limit: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            limit,
        }
    }

    /// Try to reserve memory. Returns true if successful.
    pub fn try_allocate(&self, bytes: u64) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            if current + bytes > self.limit {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + bytes, Ordering::SeqCst);
                    return true;
                }
                Err(c) => current = c,
            }
        }
    }

    /// Release reserved memory.
    pub fn release(&self, bytes: u64) {
        self.current.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Reserve `bytes`, waiting with exponential backoff while the budget is
    /// exhausted. Gives up with `Cancelled` once `token` is set, and with
    /// `InsufficientMemory` when the request can never fit.
    pub fn reserve(
        &self,
        bytes: u64,
        token: &CancellationToken,
        backoff: Backoff,
    ) -> EngineResult<MemoryReservation<'_>> {
        if bytes > self.limit {
            return Err(EngineError::InsufficientMemory {
                required: bytes,
                available: self.limit,
            });
        }
        let mut delay = backoff.initial;
        let mut waited = false;
        loop {
            token.check()?;
            if self.try_allocate(bytes) {
                return Ok(MemoryReservation {
                    tracker: self,
                    bytes,
                });
            }
            if !waited {
                log::warn!(
                    "waiting for memory: need {} bytes, {} of {} in use",
                    bytes,
                    self.current_usage(),
                    self.limit
                );
                waited = true;
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(backoff.max);
        }
    }

    /// Get current reserved bytes.
    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Get peak reserved bytes.
    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get remaining bytes.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.current.load(Ordering::Relaxed))
    }

    /// Get the limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Delays of the memory-wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_millis(initial: u64, max: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial.max(1)),
            max: Duration::from_millis(max.max(initial.max(1))),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(5, 250)
    }
}

/// Reserved bytes, released on drop.
#[derive(Debug)]
pub struct MemoryReservation<'a> {
    tracker: &'a MemoryTracker,
    bytes: u64,
}

impl MemoryReservation<'_> {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_whole_image_fits() {
        let budget = MemoryBudget::new(1 << 30, 4, 1);
        let sizing = plan_tile_size(&budget, Size::new(100, 100), 0, 10_000).unwrap();
        assert_eq!(sizing.source_tile, Size::new(100, 100));
        assert_eq!(sizing.estimated_tile_cost, 20_000);
    }

    #[test]
    fn test_tiles_shrink_until_slots_fit() {
        let budget = MemoryBudget::new(1_000_000, 4, 3);
        let sizing = plan_tile_size(&budget, Size::new(4096, 4096), 0, 0).unwrap();
        assert!(sizing.estimated_tile_cost <= 1_000_000 / 8);
        assert!(sizing.source_tile.width < 4096);
        assert_eq!(sizing.source_tile, Size::new(128, 128));
    }

    #[test]
    fn test_halving_keeps_scale_alignment() {
        let budget = MemoryBudget::new(200_000, 2, 1);
        let sizing = plan_tile_size(&budget, Size::new(1000, 600), 2, 0).unwrap();
        assert_eq!(sizing.source_tile.width % 4, 0);
        assert_eq!(sizing.source_tile.height % 4, 0);
        assert_eq!(
            sizing.dest_tile,
            sizing.source_tile.scaled_to_level(2)
        );
    }

    #[test]
    fn test_budget_below_floor_tile_is_insufficient() {
        let budget = MemoryBudget::new(100, 1, 4);
        let err = plan_tile_size(&budget, Size::new(4096, 4096), 0, 0).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientMemory { available: 100, .. }));
    }

    #[test]
    fn test_resident_above_ceiling_is_insufficient() {
        let budget = MemoryBudget::new(1000, 1, 1);
        assert!(matches!(
            plan_tile_size(&budget, Size::new(10, 10), 0, 5000),
            Err(EngineError::InsufficientMemory { required: 5000, .. })
        ));
    }

    #[test]
    fn test_deterministic() {
        let budget = MemoryBudget::new(3_000_000, 7, 6);
        let a = plan_tile_size(&budget, Size::new(12345, 6789), 1, 1_000_000).unwrap();
        let b = plan_tile_size(&budget, Size::new(12345, 6789), 1, 1_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_memory_tracker() {
        let tracker = MemoryTracker::new(1000);

        assert!(tracker.try_allocate(500));
        assert_eq!(tracker.current_usage(), 500);

        assert!(tracker.try_allocate(400));
        assert_eq!(tracker.current_usage(), 900);

        assert!(!tracker.try_allocate(200));

        tracker.release(400);
        assert_eq!(tracker.current_usage(), 500);
        assert_eq!(tracker.peak_usage(), 900);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let tracker = MemoryTracker::new(100);
        let token = CancellationToken::new();
        {
            let r = tracker.reserve(60, &token, Backoff::default()).unwrap();
            assert_eq!(r.bytes(), 60);
            assert_eq!(tracker.available(), 40);
        }
        assert_eq!(tracker.current_usage(), 0);
        assert!(matches!(
            tracker.reserve(101, &token, Backoff::default()),
            Err(EngineError::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn test_reserve_waits_for_release() {
        let tracker = Arc::new(MemoryTracker::new(100));
        let token = CancellationToken::new();
        assert!(tracker.try_allocate(80));

        let releaser = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                tracker.release(80);
            })
        };
        let r = tracker.reserve(50, &token, Backoff::from_millis(1, 5)).unwrap();
        assert_eq!(r.bytes(), 50);
        releaser.join().unwrap();
    }

    #[test]
    fn test_reserve_observes_cancellation() {
        let tracker = MemoryTracker::new(100);
        assert!(tracker.try_allocate(100));
        let token = CancellationToken::new();
        token.cancel();
        assert!(tracker
            .reserve(10, &token, Backoff::from_millis(1, 1))
            .unwrap_err()
            .is_cancellation());
    }
}
