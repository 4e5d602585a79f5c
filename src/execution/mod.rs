//! Concurrent execution of tile batches.
//!
//! A batch is a planned set of tiles, a shared progress tracker and a job run
//! once per tile on a fixed-size worker pool. Decoder handles are pooled
//! separately so a batch never opens more readers than it was configured for.

pub mod pool;
pub mod progress;
pub mod scheduler;

pub use pool::{PoolReport, PooledReader, ReaderPool};
pub use progress::{
    CancellationToken, LogProgressSink, ProgressCallback, ProgressSink, ProgressTracker,
    ProgressUpdate,
};
pub use scheduler::{BatchReport, JobContext, TileScheduler};
