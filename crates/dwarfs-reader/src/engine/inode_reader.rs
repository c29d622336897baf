//! Maps byte ranges of an inode onto block segments and fetches them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use super::block_cache::BlockSource;
use super::future::{BlockRange, BlockRangeFuture};
use super::inflight::Inflight;
use crate::error::{FsError, FsResult};
use crate::image::ChunkData;
use crate::perfmon::{self, PerfTimer, PerformanceMonitor};

/// One piece of a requested range, inside a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub block: u32,
    pub offset: usize,
    pub size: usize,
}

/// Clip `chunks` to `[offset, offset + size)`.
pub fn plan(chunks: &[ChunkData], size: usize, offset: u64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut skip = offset;
    let mut remaining = size;
    for chunk in chunks {
        if remaining == 0 {
            break;
        }
        let len = u64::from(chunk.size);
        if skip >= len {
            skip -= len;
            continue;
        }
        // skip < len <= u32::MAX
        let start = skip as usize;
        let take = (chunk.size as usize - start).min(remaining);
        segments.push(Segment {
            block: chunk.block,
            offset: chunk.offset as usize + start,
            size: take,
        });
        remaining -= take;
        skip = 0;
    }
    segments
}

/// Read engine over a [`BlockSource`].
///
/// Synchronous reads run on the caller's thread. `readv` fetches run on the
/// blocking pool of a runtime owned by the reader.
pub struct InodeReader {
    source: Arc<dyn BlockSource>,
    runtime: Mutex<Option<Runtime>>,
    read_timer: Option<PerfTimer>,
    readv_timer: Option<PerfTimer>,
}

impl InodeReader {
    pub fn new(
        source: Arc<dyn BlockSource>,
        workers: usize,
        perfmon: Option<&PerformanceMonitor>,
    ) -> FsResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("dwarfs-reader")
            .build()
            .map_err(|e| FsError::io("mount", "reader runtime", e))?;
        let timer = |name| perfmon.and_then(|pm| pm.timer("inode_reader_v2", name));
        Ok(Self {
            source,
            runtime: Mutex::new(Some(runtime)),
            read_timer: timer("read"),
            readv_timer: timer("readv"),
        })
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    pub fn read(&self, chunks: &[ChunkData], size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let _section = perfmon::section(&self.read_timer);
        let segments = plan(chunks, size, offset);
        let total = segments.iter().map(|s| s.size).sum();
        let mut out = Vec::with_capacity(total);
        for seg in segments {
            let block = self.source.block(seg.block)?;
            out.extend_from_slice(BlockRange::new(block, seg.offset, seg.size)?.data());
        }
        Ok(out)
    }

    /// Issue one fetch per segment, in range order.
    ///
    /// Each fetch holds an in-flight guard until its result is delivered.
    pub(crate) fn readv(
        &self,
        chunks: &[ChunkData],
        size: usize,
        offset: u64,
        inflight: &Arc<Inflight>,
    ) -> Vec<BlockRangeFuture> {
        let _section = perfmon::section(&self.readv_timer);
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return plan(chunks, size, offset)
                .into_iter()
                .map(|_| BlockRangeFuture::ready(Err(FsError::closed("readv"))))
                .collect();
        };

        plan(chunks, size, offset)
            .into_iter()
            .map(|seg| {
                let (tx, rx) = oneshot::channel();
                let source = Arc::clone(&self.source);
                let guard = inflight.enter();
                runtime.spawn_blocking(move || {
                    let result = source
                        .block(seg.block)
                        .and_then(|block| BlockRange::new(block, seg.offset, seg.size));
                    // Receiver may have been dropped; nothing to report then.
                    let _ = tx.send(result);
                    drop(guard);
                });
                BlockRangeFuture::pending(rx)
            })
            .collect()
    }

    /// Stop the fetch pool. Fetches not yet started resolve to `Closed`.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for InodeReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
