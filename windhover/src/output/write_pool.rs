// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bounded pool of reusable write-operation records.
//!
//! A [`WriteRequest`] carries the staged bytes for exactly one in-flight
//! socket write. Pooling exists so the staging buffer's allocation is reused
//! across writes instead of reallocated per write burst. The pool is owned by
//! the loop thread and never locked.

/// Upper bound on pooled (idle) write requests. Requests returned beyond this
/// cap are dropped.
pub const MAX_POOLED_WRITE_REQS: usize = 1024;

/// A reusable record describing one in-flight write: the staged bytes, how
/// far the socket has accepted them, and how many channel blocks the staged
/// range covered.
#[derive(Debug, Default)]
pub struct WriteRequest {
    buf: Vec<u8>,
    written: usize,
    block_count: usize,
}

impl WriteRequest {
    fn new() -> Self {
        Self::default()
    }

    /// The staging buffer, cleared and ready to be filled.
    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Marks the request in-flight over `block_count` channel blocks.
    pub(crate) fn begin(&mut self, block_count: usize) {
        self.written = 0;
        self.block_count = block_count;
    }

    /// Bytes not yet accepted by the socket.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    pub(crate) fn advance(&mut self, accepted: usize) {
        self.written += accepted;
        debug_assert!(self.written <= self.buf.len());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.written == self.buf.len()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    /// Resets the record for reuse, keeping the buffer's allocation.
    fn reset(&mut self) {
        self.buf.clear();
        self.written = 0;
        self.block_count = 0;
    }
}

/// FIFO of idle write requests, capped at [`MAX_POOLED_WRITE_REQS`]. Loop
/// thread only; no synchronization.
#[derive(Debug, Default)]
pub(crate) struct WriteRequestPool {
    free: Vec<WriteRequest>,
    disposed: bool,
    dropped_after_dispose: usize,
}

impl WriteRequestPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pops an idle request or constructs a fresh one.
    pub(crate) fn take(&mut self) -> WriteRequest {
        self.free.pop().unwrap_or_else(WriteRequest::new)
    }

    /// Returns a request to the pool. Over-cap and post-disposal returns are
    /// dropped; the latter are counted so shutdown races stay observable.
    pub(crate) fn checkin(&mut self, mut req: WriteRequest) {
        if self.disposed {
            self.dropped_after_dispose += 1;
            return;
        }
        if self.free.len() >= MAX_POOLED_WRITE_REQS {
            return;
        }
        req.reset();
        self.free.push(req);
    }

    /// Empties the pool and turns it into a sink for late returns. Called
    /// from stop's pre-phase.
    pub(crate) fn dispose(&mut self) {
        self.free.clear();
        self.disposed = true;
    }

    /// Idle request count.
    pub(crate) fn pooled(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    pub(crate) fn dropped_after_dispose(&self) -> usize {
        self.dropped_after_dispose
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn take_and_checkin_balance_when_idle() {
        let mut pool = WriteRequestPool::new();
        let mut reqs: Vec<_> = (0..4).map(|_| pool.take()).collect();
        assert_eq!(pool.pooled(), 0);

        for (i, req) in reqs.iter_mut().enumerate() {
            req.buf_mut().extend_from_slice(&[0u8; 16]);
            req.begin(i);
        }
        for req in reqs {
            pool.checkin(req);
        }
        assert_eq!(pool.pooled(), 4);

        // Reused requests come back cleared.
        let req = pool.take();
        assert_eq!(req.total_bytes(), 0);
        assert_eq!(req.block_count(), 0);
    }

    #[test]
    fn pool_never_exceeds_the_cap() {
        let mut pool = WriteRequestPool::new();
        for _ in 0..(MAX_POOLED_WRITE_REQS + 10) {
            pool.checkin(WriteRequest::new());
        }
        assert_eq!(pool.pooled(), MAX_POOLED_WRITE_REQS);
    }

    #[test]
    fn disposed_pool_is_a_sink() {
        let mut pool = WriteRequestPool::new();
        pool.checkin(WriteRequest::new());
        pool.dispose();
        assert_eq!(pool.pooled(), 0);

        pool.checkin(WriteRequest::new());
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.dropped_after_dispose(), 1);
    }

    #[test]
    fn write_progress_tracking() {
        let mut req = WriteRequest::new();
        req.buf_mut().extend_from_slice(b"hello world");
        req.begin(2);
        assert!(!req.is_done());
        req.advance(5);
        assert_eq!(req.pending(), b" world");
        req.advance(6);
        assert!(req.is_done());
        assert_eq!(req.total_bytes(), 11);
    }
}
