// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The handle-close queue.
//!
//! Closes originate overwhelmingly from the loop thread itself (and rarely
//! from drop-glue-like contexts), so contention is negligible and a plain
//! FIFO behind a short-critical-section mutex is enough. Double buffering
//! happens by [`std::mem::take`] under the lock — producers keep pushing onto
//! the fresh adding buffer while the loop drains the taken one, and the
//! running buffer is never observed by a producer.
//!
//! Errors raised by close callbacks are fatal to the loop (see the
//! controller's drain).

use super::context::LoopContext;
use crate::error::LoopResult;
use std::sync::Mutex;

/// A deferred handle-close operation, executed on the loop thread.
pub(crate) type CloseFn = Box<dyn FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send>;

pub(crate) struct CloseQueue {
    adding: Mutex<Vec<CloseFn>>,
}

impl CloseQueue {
    pub(crate) const fn new() -> Self {
        Self {
            adding: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, item: CloseFn) {
        self.adding
            .lock()
            .expect("close queue mutex poisoned: a producer panicked while enqueuing")
            .push(item);
    }

    /// Swaps the adding buffer out from under producers and returns it in
    /// FIFO order. Loop thread only.
    pub(crate) fn swap_drain(&self) -> Vec<CloseFn> {
        std::mem::take(
            &mut *self
                .adding
                .lock()
                .expect("close queue mutex poisoned: a producer panicked while enqueuing"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Execution order and error fatality are covered by the controller's
    // drain tests; here we only check the swap mechanics.
    #[test]
    fn swap_drain_takes_everything_and_leaves_queue_empty() {
        let queue = CloseQueue::new();
        for _ in 0..3 {
            queue.push(Box::new(|_ctx| Ok(())));
        }
        assert_eq!(queue.swap_drain().len(), 3);
        assert!(queue.swap_drain().is_empty());
    }
}
