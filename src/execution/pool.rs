//! Pool of independent decoder handles.
//!
//! Workers borrow a reader for the duration of one decode and hand it back
//! through the [`PooledReader`] guard, including on error paths. The pool
//! closes every handle it opened when the operation ends.

use crate::codec::{PixelCodec, RegionReader, SourceMetadata};
use crate::core::buffer::PixelBlock;
use crate::core::error::{ConfigError, EngineError, EngineResult, TileError, TileResult};
use crate::core::region::Rect;
use crate::execution::progress::CancellationToken;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How often a blocked `acquire` re-checks cancellation.
const ACQUIRE_POLL: Duration = Duration::from_millis(20);

/// Outcome of closing a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    /// Handles closed by the pool
    pub closed: usize,
    /// Handles that never came back
    pub leaked: usize,
}

/// Blocking bounded pool of readers over one source.
pub struct ReaderPool {
    sender: Sender<Box<dyn RegionReader>>,
    receiver: Receiver<Box<dyn RegionReader>>,
    size: usize,
    metadata: SourceMetadata,
    borrowed: AtomicUsize,
}

impl ReaderPool {
    /// Open `size` readers on `path`. If any open fails, the readers already
    /// opened are closed before the error is returned.
    pub fn open(codec: &dyn PixelCodec, path: &Path, size: usize) -> EngineResult<Self> {
        let size = size.max(1);
        let mut readers = Vec::with_capacity(size);
        for _ in 0..size {
            match codec.open(path) {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    for reader in readers {
                        if let Err(close_err) = reader.close() {
                            log::warn!("failed to close reader: {}", close_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("opened {} reader(s) on {}", size, path.display());
        Self::from_readers(readers)
    }

    /// Pool over already-open readers. They must all view the same image.
    pub fn from_readers(readers: Vec<Box<dyn RegionReader>>) -> EngineResult<Self> {
        let metadata = match readers.first() {
            Some(reader) => reader.metadata().clone(),
            None => return Err(ConfigError::InvalidWorkerCount.into()),
        };
        let size = readers.len();
        let (sender, receiver) = channel::bounded(size);
        for reader in readers {
            // Capacity equals the reader count.
            let _ = sender.send(reader);
        }
        Ok(Self {
            sender,
            receiver,
            size,
            metadata,
            borrowed: AtomicUsize::new(0),
        })
    }

    /// Metadata of the pooled source.
    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Readers currently lent out.
    pub fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    /// Borrow a reader, blocking until one is free. Returns `Cancelled` once
    /// `token` is set.
    pub fn acquire(&self, token: &CancellationToken) -> EngineResult<PooledReader<'_>> {
        loop {
            token.check()?;
            match self.receiver.recv_timeout(ACQUIRE_POLL) {
                Ok(reader) => {
                    self.borrowed.fetch_add(1, Ordering::SeqCst);
                    return Ok(PooledReader {
                        pool: self,
                        reader: Some(reader),
                    });
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::Cancelled),
            }
        }
    }

    fn give_back(&self, reader: Box<dyn RegionReader>) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
        if let Err(err) = self.sender.try_send(reader) {
            log::warn!("reader pool is full, closing extra handle");
            if let Err(e) = err.into_inner().close() {
                log::warn!("failed to close reader: {}", e);
            }
        }
    }

    /// Close every pooled handle. All guards must have been dropped, which the
    /// borrow checker enforces.
    pub fn close(self) -> EngineResult<PoolReport> {
        let mut closed = 0;
        let mut first_error = None;
        while let Ok(reader) = self.receiver.try_recv() {
            closed += 1;
            if let Err(e) = reader.close() {
                log::warn!("failed to close reader: {}", e);
                first_error.get_or_insert(e);
            }
        }
        let leaked = self.size.saturating_sub(closed);
        if leaked > 0 {
            log::warn!("{} reader handle(s) were not returned to the pool", leaked);
        } else {
            log::debug!("closed {} pooled reader(s)", closed);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(PoolReport { closed, leaked }),
        }
    }
}

/// A borrowed reader, returned to its pool on drop.
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    reader: Option<Box<dyn RegionReader>>,
}

impl PooledReader<'_> {
    pub fn metadata(&self) -> &SourceMetadata {
        self.pool.metadata()
    }

    /// Decode `rect` at `level` with the borrowed handle.
    pub fn read_region(&mut self, rect: Rect, level: u32) -> TileResult<PixelBlock> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_region(rect, level),
            None => Err(TileError::decode(rect, "reader already returned")),
        }
    }
}

impl std::fmt::Debug for PooledReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledReader")
            .field("held", &self.reader.is_some())
            .finish()
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.give_back(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryCodec;
    use crate::core::region::Size;
    use crate::core::types::SampleType;

    fn codec_with_image() -> MemoryCodec {
        let codec = MemoryCodec::new();
        codec
            .insert_block(
                "src.img",
                PixelBlock::from_fn(Size::new(16, 16), 1, SampleType::U8, |_, x, y| (x + y) as f64),
                Size::square(8),
            )
            .unwrap();
        codec
    }

    #[test]
    fn test_open_borrow_and_close() {
        let codec = codec_with_image();
        let pool = ReaderPool::open(&codec, Path::new("src.img"), 3).unwrap();
        assert_eq!(codec.open_handles(), 3);
        let token = CancellationToken::new();
        {
            let mut a = pool.acquire(&token).unwrap();
            let _b = pool.acquire(&token).unwrap();
            assert_eq!(pool.borrowed(), 2);
            let block = a.read_region(Rect::new(0, 0, 4, 4), 0).unwrap();
            assert_eq!(block.sample(0, 3, 3), 6.0);
        }
        assert_eq!(pool.borrowed(), 0);
        let report = pool.close().unwrap();
        assert_eq!(report, PoolReport { closed: 3, leaked: 0 });
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_failed_open_closes_partial_pool() {
        let codec = MemoryCodec::new();
        assert!(ReaderPool::open(&codec, Path::new("missing.img"), 4).is_err());
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_return() {
        let codec = codec_with_image();
        let pool = ReaderPool::open(&codec, Path::new("src.img"), 1).unwrap();
        let token = CancellationToken::new();
        crossbeam::scope(|s| {
            let held = pool.acquire(&token).unwrap();
            s.spawn(|_| {
                let reader = pool.acquire(&token).unwrap();
                assert_eq!(reader.metadata().geometry.width, 16);
            });
            std::thread::sleep(Duration::from_millis(40));
            drop(held);
        })
        .unwrap();
        pool.close().unwrap();
        assert_eq!(codec.open_handles(), 0);
    }

    #[test]
    fn test_acquire_observes_cancellation() {
        let codec = codec_with_image();
        let pool = ReaderPool::open(&codec, Path::new("src.img"), 1).unwrap();
        let token = CancellationToken::new();
        let _held = pool.acquire(&token).unwrap();
        token.cancel();
        assert!(pool.acquire(&token).unwrap_err().is_cancellation());
    }
}
