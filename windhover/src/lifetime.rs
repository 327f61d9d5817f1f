// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Application lifetime signaling.
//!
//! When the loop thread captures a fatal error it cannot return it to anyone
//! synchronously — the hosting application must be asked to begin shutting
//! down. The host provides that hook by implementing [`ApplicationLifetime`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Hook invoked by the loop thread when it captures a fatal error.
///
/// Implementations must be thread-safe: the call originates on the dedicated
/// loop thread, never on the caller's thread.
pub trait ApplicationLifetime: Send + Sync + 'static {
    /// Ask the hosting application to begin stopping.
    fn stop_application(&self);
}

/// Default lifetime that ignores stop requests. Useful for tests and for
/// hosts that watch [`LoopThread::fatal_error()`] instead.
///
/// [`LoopThread::fatal_error()`]: crate::LoopThread::fatal_error
#[derive(Debug, Default)]
pub struct NoopLifetime;

impl ApplicationLifetime for NoopLifetime {
    fn stop_application(&self) {}
}

/// Latching lifetime: remembers that a stop was requested. The flag only ever
/// transitions `false → true`.
#[derive(Debug, Default)]
pub struct StopLatch {
    requested: AtomicBool,
}

impl StopLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once [`ApplicationLifetime::stop_application`] has been called.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl ApplicationLifetime for StopLatch {
    fn stop_application(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_latch_latches() {
        let latch = StopLatch::new();
        assert!(!latch.stop_requested());
        latch.stop_application();
        latch.stop_application();
        assert!(latch.stop_requested());
    }
}
