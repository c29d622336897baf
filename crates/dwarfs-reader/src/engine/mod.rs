//! Block storage engine: decompressed block cache and the inode reader.

mod block_cache;
mod future;
mod inflight;
mod inode_reader;

pub use block_cache::{BlockCache, BlockSource};
pub use future::{BlockRange, BlockRangeFuture};
pub(crate) use inflight::Inflight;
pub use inode_reader::{InodeReader, Segment, plan};
