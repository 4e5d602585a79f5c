//! Concurrent tile scheduler.
//!
//! Tiles are queued in row-major order on a channel drained by a fixed set of
//! worker threads. Workers report through a completion channel that the
//! calling thread drains; that thread is the only one that touches progress,
//! so counts arrive in order and exactly once per finished tile.
//!
//! The first failure wins: it raises the abort flag, queued tiles are dropped
//! unstarted, and running jobs observe the flag at their next checkpoint.
//! A job stuck inside a codec call is not interrupted; it finishes first.

use crate::core::config::default_worker_count;
use crate::core::error::{EngineError, EngineResult};
use crate::execution::progress::{CancellationToken, ProgressTracker};
use crate::planning::grid::Tile;
use crossbeam::channel;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Per-job view of the batch.
pub struct JobContext<'a> {
    tile: &'a Tile,
    worker: usize,
    token: &'a CancellationToken,
    abort: &'a AtomicBool,
}

impl<'a> JobContext<'a> {
    /// Tile this job processes.
    pub fn tile(&self) -> &'a Tile {
        self.tile
    }

    /// Index of the worker thread running the job.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Caller's cancellation flag, for blocking waits.
    pub fn token(&self) -> &'a CancellationToken {
        self.token
    }

    /// True once the batch is cancelled or another tile failed.
    pub fn should_stop(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Safe point: `Err(Cancelled)` once the batch should stop.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.should_stop() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Summary of a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Tiles that completed
    pub processed: usize,
    /// Tiles in the batch
    pub total: usize,
    pub elapsed: Duration,
}

enum Completion {
    Done { duration_ms: u64 },
    Failed(EngineError),
}

/// Fixed-size worker pool for one batch of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileScheduler {
    workers: usize,
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self::new(default_worker_count())
    }
}

impl TileScheduler {
    /// Scheduler with `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` once per tile.
    ///
    /// Returns `Cancelled` when `progress`'s token was set before the batch
    /// finished, otherwise the first job error. On success every tile was
    /// processed exactly once and `progress` reached `tiles.len()`.
    pub fn run<F>(
        &self,
        tiles: &[Tile],
        progress: &ProgressTracker,
        job: F,
    ) -> EngineResult<BatchReport>
    where
        F: Fn(&JobContext<'_>) -> EngineResult<()> + Sync,
    {
        let started = Instant::now();
        let total = tiles.len();
        let token = progress.token();
        progress.start();
        token.check()?;

        let workers = self.workers.min(total.max(1));
        log::debug!("scheduling {} tile(s) on {} worker(s)", total, workers);

        let (job_tx, job_rx) = channel::unbounded::<&Tile>();
        for tile in tiles {
            // The receiver lives until the scope ends.
            let _ = job_tx.send(tile);
        }
        drop(job_tx);

        let (done_tx, done_rx) = channel::unbounded::<Completion>();
        let abort = AtomicBool::new(false);
        let mut processed = 0usize;
        let mut first_error: Option<EngineError> = None;

        let scope_result = crossbeam::scope(|s| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let abort = &abort;
                let job = &job;
                s.spawn(move |_| {
                    while let Ok(tile) = job_rx.recv() {
                        if abort.load(Ordering::SeqCst) || token.is_cancelled() {
                            break;
                        }
                        let ctx = JobContext {
                            tile,
                            worker,
                            token,
                            abort,
                        };
                        let job_started = Instant::now();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&ctx)))
                            .unwrap_or(Err(EngineError::WorkerPanicked));
                        let completion = match outcome {
                            Ok(()) => Completion::Done {
                                duration_ms: job_started.elapsed().as_millis() as u64,
                            },
                            Err(e) => {
                                abort.store(true, Ordering::SeqCst);
                                Completion::Failed(e)
                            }
                        };
                        if done_tx.send(completion).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            for completion in done_rx.iter() {
                match completion {
                    Completion::Done { duration_ms } => {
                        processed += 1;
                        progress.tile_completed(duration_ms);
                    }
                    Completion::Failed(e) => {
                        if first_error.is_none() {
                            log::debug!("batch aborted: {}", e);
                            first_error = Some(e);
                        }
                    }
                }
            }
        });

        if scope_result.is_err() {
            progress.report_error(EngineError::WorkerPanicked.to_string());
            return Err(EngineError::WorkerPanicked);
        }

        let cancelled = token.is_cancelled();
        match first_error {
            Some(e) if !(cancelled || e.is_cancellation()) => {
                progress.report_error(e.to_string());
                Err(e)
            }
            Some(_) => {
                progress.report_cancelled();
                Err(EngineError::Cancelled)
            }
            None if cancelled && processed < total => {
                progress.report_cancelled();
                Err(EngineError::Cancelled)
            }
            None => {
                progress.complete();
                Ok(BatchReport {
                    processed,
                    total,
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TileError;
    use crate::core::region::{Rect, Size};
    use crate::execution::progress::ProgressUpdate;
    use crate::planning::grid::plan_grid;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_ten_tiles_four_workers() {
        // 5 x 2 tiles
        let grid = plan_grid(Rect::new(0, 0, 50, 20), Size::square(10), 0).unwrap();
        assert_eq!(grid.len(), 10);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = updates.clone();
        let progress = ProgressTracker::new(grid.len()).with_callback(Box::new(move |u| {
            if let ProgressUpdate::TileCompleted { processed, .. } = u {
                updates_clone.lock().push(processed);
            }
        }));
        let writes: Vec<AtomicUsize> = (0..50 * 20).map(|_| AtomicUsize::new(0)).collect();

        let report = TileScheduler::new(4)
            .run(grid.tiles(), &progress, |ctx| {
                let dest = ctx.tile().dest;
                for y in dest.y..dest.bottom() {
                    for x in dest.x..dest.right() {
                        writes[(y * 50 + x) as usize].fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(report.processed, 10);
        assert_eq!(progress.processed(), 10);
        assert_eq!(*updates.lock(), (1..=10).collect::<Vec<_>>());
        assert!(writes.iter().all(|w| w.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_first_error_wins_and_stops_batch() {
        let grid = plan_grid(Rect::new(0, 0, 100, 100), Size::square(10), 0).unwrap();
        let progress = ProgressTracker::new(grid.len());
        let started = AtomicUsize::new(0);

        let err = TileScheduler::new(2)
            .run(grid.tiles(), &progress, |ctx| {
                started.fetch_add(1, Ordering::SeqCst);
                if ctx.tile().index == 3 {
                    return Err(TileError::decode(ctx.tile().source, "bad tile").into());
                }
                std::thread::sleep(Duration::from_millis(2));
                ctx.checkpoint()
            })
            .unwrap_err();

        assert!(matches!(err, EngineError::Tile(TileError::Decode { .. })));
        assert!(started.load(Ordering::SeqCst) < grid.len());
        assert!(progress.processed() < grid.len());
    }

    #[test]
    fn test_concurrent_failures_surface_one_error() {
        let grid = plan_grid(Rect::new(0, 0, 40, 40), Size::square(10), 0).unwrap();
        let progress = ProgressTracker::new(grid.len());
        let err = TileScheduler::new(4)
            .run(grid.tiles(), &progress, |ctx| {
                Err(TileError::decode(ctx.tile().source, "all bad").into())
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Tile(_)));
        assert_eq!(progress.processed(), 0);
    }

    #[test]
    fn test_cancellation_stops_placements() {
        let grid = plan_grid(Rect::new(0, 0, 200, 200), Size::square(10), 0).unwrap();
        let token = CancellationToken::new();
        let progress = ProgressTracker::new(grid.len()).with_token(token.clone());
        let placed_after_cancel = AtomicUsize::new(0);
        let cancelled_flag = AtomicBool::new(false);

        let err = TileScheduler::new(3)
            .run(grid.tiles(), &progress, |ctx| {
                if ctx.tile().index == 5 {
                    token.cancel();
                    cancelled_flag.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(1));
                let seen_cancel = cancelled_flag.load(Ordering::SeqCst);
                ctx.checkpoint()?;
                if seen_cancel {
                    placed_after_cancel.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(placed_after_cancel.load(Ordering::SeqCst), 0);
        assert!(progress.processed() < grid.len());
    }

    #[test]
    fn test_cancelled_before_start() {
        let grid = plan_grid(Rect::new(0, 0, 20, 20), Size::square(10), 0).unwrap();
        let progress = ProgressTracker::new(grid.len());
        progress.cancel();
        let ran = AtomicUsize::new(0);
        let err = TileScheduler::new(2)
            .run(grid.tiles(), &progress, |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let grid = plan_grid(Rect::new(0, 0, 20, 10), Size::square(10), 0).unwrap();
        let progress = ProgressTracker::new(grid.len());
        let err = TileScheduler::new(2)
            .run(grid.tiles(), &progress, |ctx| {
                if ctx.tile().index == 1 {
                    panic!("decoder crashed");
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerPanicked));
    }

    #[test]
    fn test_empty_batch() {
        let progress = ProgressTracker::new(0);
        let report = TileScheduler::new(4).run(&[], &progress, |_| Ok(())).unwrap();
        assert_eq!(report.processed, 0);
    }
}
