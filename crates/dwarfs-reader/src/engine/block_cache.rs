//! Decompressed block cache with LRU eviction.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::instrument;

use crate::error::{FsError, FsResult};
use crate::image::Section;
use crate::perfmon::{self, PerfCounter, PerfTimer, PerformanceMonitor};

/// Source of decompressed file data blocks.
pub trait BlockSource: Send + Sync {
    fn block_count(&self) -> usize;

    /// Decompressed contents of block `n`.
    fn block(&self, n: u32) -> FsResult<Arc<[u8]>>;
}

struct CachedBlock {
    data: Arc<[u8]>,
    /// Access tick for LRU eviction.
    last_access: u64,
}

/// [`BlockSource`] over the BLOCK sections of a mounted image.
///
/// Blocks are checksum-verified and decompressed on first use and kept up
/// to `max_cached`.
pub struct BlockCache {
    blocks: Vec<Section>,
    /// Upper bound on a decompressed block.
    block_size: usize,
    cache: DashMap<u32, CachedBlock>,
    max_cached: usize,
    tick: AtomicU64,
    get_timer: Option<PerfTimer>,
    decompress_timer: Option<PerfTimer>,
    hits: Option<PerfCounter>,
    misses: Option<PerfCounter>,
}

impl BlockCache {
    pub fn new(
        blocks: Vec<Section>,
        block_size: usize,
        max_cached: usize,
        perfmon: Option<&PerformanceMonitor>,
    ) -> Self {
        let timer = |name| perfmon.and_then(|pm| pm.timer("block_cache", name));
        let counter = |name| perfmon.and_then(|pm| pm.counter("block_cache", name));
        Self {
            blocks,
            block_size,
            cache: DashMap::new(),
            max_cached,
            tick: AtomicU64::new(0),
            get_timer: timer("get_block"),
            decompress_timer: timer("decompress"),
            hits: counter("hits"),
            misses: counter("misses"),
        }
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    #[instrument(level = "trace", skip(self))]
    fn load(&self, n: u32) -> FsResult<Arc<[u8]>> {
        let section = self
            .blocks
            .get(n as usize)
            .ok_or_else(|| FsError::invalid_argument("read", format!("block {n} out of range")))?;
        if !section.checksum_valid() {
            return Err(FsError::io(
                "read",
                format!("block {n}"),
                io::Error::new(io::ErrorKind::InvalidData, "checksum mismatch"),
            ));
        }
        let _section = perfmon::section(&self.decompress_timer);
        Ok(section.decompress_bounded("read", self.block_size)?.into())
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_if_needed(&self) {
        while self.cache.len() >= self.max_cached {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| *e.key());
            match oldest {
                Some(key) => {
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl BlockSource for BlockCache {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block(&self, n: u32) -> FsResult<Arc<[u8]>> {
        let _section = perfmon::section(&self.get_timer);

        // Fast path: already cached
        if let Some(mut entry) = self.cache.get_mut(&n) {
            entry.last_access = self.next_tick();
            if let Some(hits) = &self.hits {
                hits.incr();
            }
            return Ok(Arc::clone(&entry.data));
        }

        if let Some(misses) = &self.misses {
            misses.incr();
        }
        let data = self.load(n)?;
        if self.max_cached > 0 {
            self.evict_if_needed();
            self.cache.insert(
                n,
                CachedBlock {
                    data: Arc::clone(&data),
                    last_access: self.next_tick(),
                },
            );
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{CompressionType, SectionTable, SectionType};
    use crate::logger::{Level, Logger};
    use crate::options::ImageOffset;
    use crate::testing::ImageWriter;

    fn blocks_of(img: Vec<u8>) -> Vec<Section> {
        let table = SectionTable::locate(
            Arc::from(img),
            ImageOffset::Auto,
            &Logger::tracing(Level::Error),
        )
        .unwrap();
        table.of_type(SectionType::Block).cloned().collect()
    }

    fn three_blocks() -> Vec<u8> {
        ImageWriter::new()
            .block_size(4)
            .file("f", b"aaaabbbbcccc")
            .build()
            .unwrap()
    }

    #[test]
    fn test_block_contents() {
        let cache = BlockCache::new(blocks_of(three_blocks()), 4, 4, None);
        assert_eq!(cache.block_count(), 3);
        assert_eq!(&cache.block(1).unwrap()[..], b"bbbb");
        assert!(matches!(
            cache.block(9),
            Err(FsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_lru_eviction() {
        let pm = PerformanceMonitor::create(["block_cache"]);
        let cache = BlockCache::new(blocks_of(three_blocks()), 4, 2, Some(&pm));

        cache.block(0).unwrap();
        cache.block(1).unwrap();
        cache.block(0).unwrap();
        // Evicts block 1, the least recently used.
        cache.block(2).unwrap();
        assert_eq!(cache.cached_blocks(), 2);
        assert!(cache.cache.contains_key(&0));
        assert!(!cache.cache.contains_key(&1));

        assert_eq!(pm.counter("block_cache", "hits").unwrap().get(), 1);
        assert_eq!(pm.counter("block_cache", "misses").unwrap().get(), 3);
        assert_eq!(pm.timer("block_cache", "get_block").unwrap().samples(), 4);
    }

    #[test]
    fn test_zero_capacity_never_caches() {
        let cache = BlockCache::new(blocks_of(three_blocks()), 4, 0, None);
        assert_eq!(&cache.block(2).unwrap()[..], b"cccc");
        assert_eq!(cache.cached_blocks(), 0);
    }

    #[test]
    fn test_oversized_block_rejected() {
        for compression in [CompressionType::None, CompressionType::Zstd] {
            let img = ImageWriter::new()
                .block_size(64)
                .compression(compression)
                .file("f", &[7_u8; 64])
                .build()
                .unwrap();
            let cache = BlockCache::new(blocks_of(img), 16, 4, None);
            let err = cache.block(0).unwrap_err();
            assert!(matches!(err, FsError::Io { .. }), "{compression:?}: {err}");
            assert_eq!(cache.cached_blocks(), 0);
        }
    }

    #[test]
    fn test_corrupt_block_is_io_failure() {
        let mut img = three_blocks();
        // Flip the first payload byte of block 0.
        img[crate::image::section::HEADER_SIZE] ^= 0xff;
        let cache = BlockCache::new(blocks_of(img), 4, 4, None);
        let err = cache.block(0).unwrap_err();
        assert!(matches!(err, FsError::Io { .. }));
        assert_eq!(&cache.block(1).unwrap()[..], b"bbbb");
    }
}
