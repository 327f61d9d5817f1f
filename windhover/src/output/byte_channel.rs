// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-connection output byte channel.
//!
//! Request-processing code (any thread) appends bytes; the connection's
//! output pump (single consumer) drains them toward the socket. The channel
//! is an ordered run of pooled fixed-size blocks addressed by absolute
//! cursors: a block *sequence number* plus an intra-block index. Sequence
//! numbers only ever grow, so a cursor taken in a snapshot stays meaningful
//! while producers keep appending behind it.
//!
//! The consumer protocol is snapshot → write → [`consumed(end)`]:
//! [`stage_into()`] copies the currently-readable range `[begin, end)` out
//! under the lock and returns the `end` cursor; once the socket has accepted
//! the bytes, [`consumed(end)`] releases every wholly-drained block back to
//! the memory pool. Appends that land after the snapshot extend the last
//! block (or new blocks) past `end` and survive reclamation untouched.
//!
//! Cancellation is cooperative and drain-first: while readable bytes remain,
//! [`readable()`] keeps reporting them; it reports [`ChannelRead::Cancelled`]
//! only once the channel is empty. Every byte written before cancellation
//! therefore either reaches the socket or the connection is aborted.
//!
//! [`consumed(end)`]: ByteChannel::consumed
//! [`stage_into()`]: ByteChannel::stage_into
//! [`readable()`]: ByteChannel::readable

use super::memory_pool::{Block, MemoryPool};
use std::{collections::VecDeque, sync::{Arc, Mutex}};
use tokio::sync::Notify;

/// Errors surfaced to the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel was cancelled or disposed; the connection is going away.
    #[error("output channel closed")]
    Closed,
    /// The memory pool was disposed (shutdown is in progress).
    #[error("memory pool disposed")]
    PoolDisposed,
}

/// What an await of the channel resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRead {
    /// Bytes are available; snapshot and write them.
    Readable,
    /// The channel was cancelled and fully drained; half-close the socket.
    Cancelled,
    /// The channel was disposed out from under the pump.
    Disposed,
}

/// Absolute position in the channel's block run. `block_seq` counts blocks
/// from channel creation; `index` is a byte offset within that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCursor {
    pub block_seq: u64,
    pub index: usize,
}

/// The readable range captured by [`ByteChannel::stage_into`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagedRange {
    /// Exclusive end of the captured range; hand back via `consumed()`.
    pub end: ChannelCursor,
    pub total_bytes: usize,
    pub block_count: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    blocks: VecDeque<Block>,
    /// Sequence number of `blocks[0]`.
    first_seq: u64,
    /// Bytes of `blocks[0]` already consumed.
    read_index: usize,
    cancelled: bool,
    disposed: bool,
}

impl ChannelState {
    fn readable_bytes(&self) -> usize {
        let total: usize = self.blocks.iter().map(Block::len).sum();
        total - self.read_index
    }
}

/// Ordered stream of memory-pool-backed buffers between request processing
/// and the output pump. Multi-producer, single-consumer.
pub struct ByteChannel {
    pool: Arc<MemoryPool>,
    state: Mutex<ChannelState>,
    readable: Notify,
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChannel")
            .field("pending_bytes", &self.pending_bytes())
            .finish_non_exhaustive()
    }
}

impl ByteChannel {
    #[must_use]
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(ChannelState::default()),
            readable: Notify::new(),
        }
    }

    /// Appends `bytes`, leasing blocks as needed.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] once the channel is cancelled or disposed;
    /// [`ChannelError::PoolDisposed`] when shutdown already reclaimed the
    /// memory pool (bytes appended before the failure stay in the channel).
    pub fn write(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if bytes.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.cancelled || state.disposed {
                return Err(ChannelError::Closed);
            }
            let mut rest = bytes;
            while !rest.is_empty() {
                let need_block = state.blocks.back().is_none_or(|b| b.spare() == 0);
                if need_block {
                    let Some(block) = self.pool.lease() else {
                        return Err(ChannelError::PoolDisposed);
                    };
                    state.blocks.push_back(block);
                }
                let taken = state
                    .blocks
                    .back_mut()
                    .expect("a block was just ensured above")
                    .append(rest);
                rest = &rest[taken..];
            }
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Suspends until bytes are available, the channel is cancelled (and
    /// drained), or the channel is disposed. Single consumer.
    pub async fn readable(&self) -> ChannelRead {
        loop {
            {
                let state = self.lock();
                if state.readable_bytes() > 0 {
                    return ChannelRead::Readable;
                }
                if state.cancelled {
                    return ChannelRead::Cancelled;
                }
                if state.disposed {
                    return ChannelRead::Disposed;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Copies the currently-readable range into `buf` (cleared first) and
    /// returns its extent. `None` when nothing is readable.
    pub(crate) fn stage_into(&self, buf: &mut Vec<u8>) -> Option<StagedRange> {
        let state = self.lock();
        let total_bytes = state.readable_bytes();
        if total_bytes == 0 {
            return None;
        }

        buf.clear();
        buf.reserve(total_bytes);
        for (offset, block) in state.blocks.iter().enumerate() {
            let skip = if offset == 0 { state.read_index } else { 0 };
            buf.extend_from_slice(&block.filled()[skip..]);
        }

        let last = state
            .blocks
            .back()
            .expect("readable_bytes > 0 implies at least one block");
        let block_count = state.blocks.len();
        Some(StagedRange {
            end: ChannelCursor {
                block_seq: state.first_seq + (block_count as u64 - 1),
                index: last.len(),
            },
            total_bytes,
            block_count,
        })
    }

    /// Marks everything up to `end` (exclusive) consumed, releasing
    /// wholly-drained blocks back to the pool. Bytes appended after the
    /// snapshot are unaffected.
    pub(crate) fn consumed(&self, end: ChannelCursor) {
        let mut state = self.lock();
        while state.first_seq < end.block_seq && !state.blocks.is_empty() {
            let block = state
                .blocks
                .pop_front()
                .expect("non-empty checked in loop condition");
            self.pool.reclaim(block);
            state.first_seq += 1;
            state.read_index = 0;
        }
        if state.first_seq == end.block_seq
            && let Some(front_len) = state.blocks.front().map(Block::len)
        {
            state.read_index = state.read_index.max(end.index);
            if state.read_index >= front_len {
                let block = state
                    .blocks
                    .pop_front()
                    .expect("front() was Some just above");
                self.pool.reclaim(block);
                state.first_seq += 1;
                state.read_index = 0;
            }
        }
    }

    /// Requests cooperative termination of the pump. Pending bytes are still
    /// drained first; further writes fail.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.readable.notify_one();
    }

    /// Releases every block and closes the channel for good. Called by the
    /// pump's guaranteed-release path.
    pub fn dispose(&self) {
        let blocks = {
            let mut state = self.lock();
            state.disposed = true;
            std::mem::take(&mut state.blocks)
        };
        for block in blocks {
            self.pool.reclaim(block);
        }
        self.readable.notify_one();
    }

    /// Bytes currently waiting to be written.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.lock().readable_bytes()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .expect("byte channel mutex poisoned: a writer panicked mid-append")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::memory_pool::BLOCK_SIZE;
    use pretty_assertions::assert_eq;

    fn channel() -> ByteChannel {
        ByteChannel::new(Arc::new(MemoryPool::new()))
    }

    #[test]
    fn stage_copies_the_readable_range() {
        let channel = channel();
        channel.write(b"hello ").unwrap();
        channel.write(b"world").unwrap();

        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");
        assert_eq!(staged.total_bytes, 11);
        assert_eq!(staged.block_count, 1);
        // Single-block range: length is end.index - begin.index.
        assert_eq!(staged.end, ChannelCursor { block_seq: 0, index: 11 });
    }

    #[test]
    fn ranges_span_multiple_blocks() {
        let channel = channel();
        let payload = vec![42u8; BLOCK_SIZE + 100];
        channel.write(&payload).unwrap();

        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        assert_eq!(staged.block_count, 2);
        assert_eq!(staged.total_bytes, BLOCK_SIZE + 100);
        assert_eq!(staged.end, ChannelCursor { block_seq: 1, index: 100 });
        assert_eq!(buf, payload);
    }

    #[test]
    fn consumed_releases_blocks_to_the_pool() {
        let pool = Arc::new(MemoryPool::new());
        let channel = ByteChannel::new(Arc::clone(&pool));
        channel.write(&vec![1u8; BLOCK_SIZE * 2]).unwrap();

        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        channel.consumed(staged.end);

        assert_eq!(channel.pending_bytes(), 0);
        assert_eq!(pool.free_blocks(), 2);
    }

    /// Appends racing an in-flight write land past the snapshot's end cursor
    /// and survive its reclamation.
    #[test]
    fn appends_after_snapshot_survive_consumed() {
        let channel = channel();
        channel.write(b"first").unwrap();

        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        channel.write(b"second").unwrap();
        channel.consumed(staged.end);

        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        assert_eq!(buf, b"second");
        channel.consumed(staged.end);
        assert_eq!(channel.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_drain_first() {
        let channel = channel();
        channel.write(b"pending").unwrap();
        channel.cancel();

        // Bytes written before cancellation still surface first.
        assert_eq!(channel.readable().await, ChannelRead::Readable);
        let mut buf = Vec::new();
        let staged = channel.stage_into(&mut buf).unwrap();
        channel.consumed(staged.end);

        assert_eq!(channel.readable().await, ChannelRead::Cancelled);
        assert_eq!(channel.write(b"late"), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn readable_wakes_on_write() {
        let channel = Arc::new(channel());
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.readable().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        channel.write(b"x").unwrap();
        assert_eq!(waiter.await.unwrap(), ChannelRead::Readable);
    }

    #[test]
    fn disposed_channel_rejects_writes_and_frees_blocks() {
        let pool = Arc::new(MemoryPool::new());
        let channel = ByteChannel::new(Arc::clone(&pool));
        channel.write(b"data").unwrap();
        channel.dispose();

        assert_eq!(channel.write(b"x"), Err(ChannelError::Closed));
        assert_eq!(channel.pending_bytes(), 0);
        assert_eq!(pool.free_blocks(), 1);
    }
}
