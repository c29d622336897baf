//! Results of `readv`: one future per block segment.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{FsError, FsResult};

/// A contiguous byte range inside one decompressed block.
#[derive(Clone)]
pub struct BlockRange {
    block: Arc<[u8]>,
    offset: usize,
    size: usize,
}

impl BlockRange {
    pub(crate) fn new(block: Arc<[u8]>, offset: usize, size: usize) -> FsResult<Self> {
        if offset.checked_add(size).is_none_or(|end| end > block.len()) {
            return Err(FsError::corrupt(
                "read",
                format!(
                    "range {offset}+{size} exceeds block of {} bytes",
                    block.len()
                ),
            ));
        }
        Ok(Self {
            block,
            offset,
            size,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.block[self.offset..self.offset + self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRange")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

enum State {
    Pending(oneshot::Receiver<FsResult<BlockRange>>),
    Done(FsResult<BlockRange>),
}

/// One outstanding block fetch issued by `readv`.
///
/// Resolves once; later polls and [`BlockRangeFuture::get`] calls return
/// the cached result. A fetch abandoned by teardown resolves to `Closed`.
pub struct BlockRangeFuture {
    state: State,
}

impl BlockRangeFuture {
    pub(crate) fn pending(rx: oneshot::Receiver<FsResult<BlockRange>>) -> Self {
        Self {
            state: State::Pending(rx),
        }
    }

    pub(crate) fn ready(result: FsResult<BlockRange>) -> Self {
        Self {
            state: State::Done(result),
        }
    }

    /// Block the calling thread until the fetch completes.
    pub fn get(&mut self) -> FsResult<BlockRange> {
        futures::executor::block_on(self)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Done(_))
    }
}

impl Future for BlockRangeFuture {
    type Output = FsResult<BlockRange>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            State::Done(result) => return Poll::Ready(result.clone()),
            State::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(FsError::closed("readv")),
            },
        };
        this.state = State::Done(result.clone());
        Poll::Ready(result)
    }
}

impl fmt::Debug for BlockRangeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRangeFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}
