// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Static configuration for the event-loop core. There is no dynamic
//! reconfiguration after [`LoopThread::start()`].
//!
//! [`LoopThread::start()`]: crate::LoopThread::start

use std::time::Duration;

/// Configuration consumed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// How long the shutdown pre-phase waits for live connections to close
    /// cooperatively before the three stop phases begin. A timeout here is
    /// logged, never fatal.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
