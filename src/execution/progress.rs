//! Progress tracking and cooperative cancellation.

use crate::core::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A batch has started.
    Started {
        total: usize,
    },
    /// One more tile finished. `processed` never decreases.
    TileCompleted {
        processed: usize,
        total: usize,
        /// Remaining time from the mean tile duration so far
        eta_ms: Option<u64>,
    },
    /// Free-form progress; `fraction` is NaN when indeterminate.
    Progress {
        fraction: f64,
        message: String,
    },
    /// The batch has completed.
    Completed {
        processed: usize,
        duration_ms: u64,
    },
    /// The batch was cancelled.
    Cancelled {
        processed: usize,
        total: usize,
    },
    /// An error ended the batch.
    Error {
        message: String,
    },
}

/// Receiver of `(progress in [0, 1] or NaN, message)` notifications.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, progress: f64, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn notify(&self, progress: f64, message: &str) {
        self(progress, message)
    }
}

/// Sink that forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn notify(&self, progress: f64, message: &str) {
        if progress.is_nan() {
            log::info!("{}", message);
        } else {
            log::info!("[{:5.1}%] {}", progress * 100.0, message);
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Tracks tile progress for one batch and carries its cancellation flag.
pub struct ProgressTracker {
    /// Number of tiles in the batch.
    total: usize,
    /// Tiles completed; the lock is the critical section around each increment.
    processed: Mutex<usize>,
    /// Cancellation flag.
    token: CancellationToken,
    /// Start time.
    start_time: Mutex<Option<Instant>>,
    /// Structured update callback.
    callback: Option<ProgressCallback>,
    /// Fraction/message sink.
    sink: Option<Arc<dyn ProgressSink>>,
    /// Tile completion times for estimation.
    tile_times: Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            processed: Mutex::new(0),
            token: CancellationToken::new(),
            start_time: Mutex::new(None),
            callback: None,
            sink: None,
            tile_times: Mutex::new(Vec::new()),
        }
    }

    /// Set a callback for structured updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Forward fractions and messages to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share an existing cancellation flag.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Start tracking.
    pub fn start(&self) {
        *self.start_time.lock() = Some(Instant::now());
        self.send_update(ProgressUpdate::Started { total: self.total });
    }

    /// Record one finished tile and return the new processed count.
    ///
    /// The increment and the notification happen under one lock, so observers
    /// see counts in order and never above `total`.
    pub fn tile_completed(&self, duration_ms: u64) -> usize {
        self.tile_times.lock().push(duration_ms);
        let mut processed = self.processed.lock();
        if *processed < self.total {
            *processed += 1;
        }
        let current = *processed;
        let eta_ms = self.remaining_after(current);
        self.send_update(ProgressUpdate::TileCompleted {
            processed: current,
            total: self.total,
            eta_ms,
        });
        if let Some(sink) = &self.sink {
            sink.notify(
                current as f64 / self.total.max(1) as f64,
                &format!("Processed tile {} of {}", current, self.total),
            );
        }
        current
    }

    /// Report a fraction (or NaN) with a message.
    pub fn report(&self, fraction: f64, message: &str) {
        if let Some(sink) = &self.sink {
            sink.notify(fraction, message);
        }
        self.send_update(ProgressUpdate::Progress {
            fraction,
            message: message.to_string(),
        });
    }

    /// Check if the batch should stop.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cancellation flag shared with workers.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Report that the batch stopped because of cancellation.
    pub fn report_cancelled(&self) {
        self.send_update(ProgressUpdate::Cancelled {
            processed: self.processed(),
            total: self.total,
        });
    }

    /// Report an error.
    pub fn report_error(&self, message: String) {
        self.send_update(ProgressUpdate::Error { message });
    }

    /// Complete tracking.
    pub fn complete(&self) {
        let started = *self.start_time.lock();
        let duration = started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.send_update(ProgressUpdate::Completed {
            processed: self.processed(),
            duration_ms: duration,
        });
    }

    pub fn processed(&self) -> usize {
        *self.processed.lock()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Completed share in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.processed() as f64 / self.total as f64
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        self.remaining_after(self.processed())
    }

    // Must not be called with `tile_times` held.
    fn remaining_after(&self, processed: usize) -> Option<u64> {
        let times = self.tile_times.lock();
        if times.is_empty() {
            return None;
        }

        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let remaining = self.total.saturating_sub(processed);

        Some(avg_time * remaining as u64)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total", &self.total)
            .field("processed", &self.processed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fraction() {
        let tracker = ProgressTracker::new(4);
        assert_eq!(tracker.fraction(), 0.0);
        tracker.tile_completed(1);
        tracker.tile_completed(1);
        assert_eq!(tracker.fraction(), 0.5);
        assert_eq!(ProgressTracker::new(0).fraction(), 1.0);
    }

    #[test]
    fn test_tile_updates_carry_remaining_estimate() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let tracker = ProgressTracker::new(4).with_callback(Box::new(move |u| sink.lock().push(u)));
        assert_eq!(tracker.estimated_remaining_ms(), None);
        tracker.tile_completed(10);
        tracker.tile_completed(30);
        assert_eq!(tracker.estimated_remaining_ms(), Some(40));
        let updates = updates.lock();
        assert_eq!(
            updates[0],
            ProgressUpdate::TileCompleted { processed: 1, total: 4, eta_ms: Some(30) }
        );
        assert_eq!(
            updates[1],
            ProgressUpdate::TileCompleted { processed: 2, total: 4, eta_ms: Some(40) }
        );
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let tracker = ProgressTracker::new(2);
        for _ in 0..5 {
            tracker.tile_completed(0);
        }
        assert_eq!(tracker.processed(), 2);
    }

    #[test]
    fn test_cancellation_shared_through_token() {
        let token = CancellationToken::new();
        let tracker = ProgressTracker::new(10).with_token(token.clone());
        assert!(!tracker.is_cancelled());
        assert!(tracker.token().check().is_ok());

        token.cancel();
        assert!(tracker.is_cancelled());
        assert!(tracker.token().check().unwrap_err().is_cancellation());
    }

    #[test]
    fn test_concurrent_updates_are_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let tracker = ProgressTracker::new(400).with_callback(Box::new(move |update| {
            if let ProgressUpdate::TileCompleted { processed, .. } = update {
                seen_clone.lock().push(processed);
            }
        }));

        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..100 {
                        tracker.tile_completed(0);
                    }
                });
            }
        })
        .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 400);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 400);
    }

    #[test]
    fn test_sink_receives_nan_and_fractions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let nan_seen = Arc::new(AtomicBool::new(false));
        let (c, n) = (calls.clone(), nan_seen.clone());
        let sink = move |p: f64, _: &str| {
            c.fetch_add(1, Ordering::SeqCst);
            if p.is_nan() {
                n.store(true, Ordering::SeqCst);
            }
        };
        let tracker = ProgressTracker::new(1).with_sink(Arc::new(sink));
        tracker.report(f64::NAN, "Initializing");
        tracker.tile_completed(3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(nan_seen.load(Ordering::SeqCst));
    }
}
