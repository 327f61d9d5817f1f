// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Error types for the event-loop core.
//!
//! [`LoopError`] is deliberately [`Clone`]: the loop thread cannot propagate an
//! error synchronously to any caller, so the first fatal error is captured into
//! a slot on the shared state and *also* rethrown later from
//! [`LoopThread::stop()`]. Cloneability is what lets one captured error serve
//! both purposes. I/O errors are wrapped in [`Arc`] because [`std::io::Error`]
//! itself is not `Clone`.
//!
//! [`LoopThread::stop()`]: crate::LoopThread::stop

use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type LoopResult<T> = Result<T, LoopError>;

/// Errors produced by the loop thread, the posting entry points, and the
/// per-connection output path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoopError {
    /// An I/O error from the reactor or a native handle, tagged with the
    /// operation that produced it.
    #[error("i/o error during {context}: {cause}")]
    Io {
        /// The operation that failed (e.g. `"reactor startup"`).
        context: &'static str,
        /// The underlying error, shared so the value stays `Clone`.
        cause: Arc<std::io::Error>,
    },

    /// A work item posted without a completion returned an error. Fatal to the
    /// loop.
    #[error("work item failed: {0}")]
    Work(String),

    /// A close callback returned an error. Always fatal to the loop.
    #[error("close callback failed: {0}")]
    Close(String),

    /// A work item or close callback panicked; the payload is stringified.
    #[error("posted work panicked: {0}")]
    Panic(String),

    /// The loop thread has already terminated; no further work can be posted.
    #[error("event loop has already been disposed")]
    AlreadyDisposed,

    /// `start()` was called more than once on the same instance.
    #[error("event loop has already been started")]
    AlreadyStarted,

    /// The loop thread exited before resolving the start future.
    #[error("event loop thread failed during startup: {0}")]
    StartFailed(String),
}

impl LoopError {
    /// Wraps an [`std::io::Error`] with the operation it came from.
    pub fn io(context: &'static str, cause: std::io::Error) -> Self {
        Self::Io {
            context,
            cause: Arc::new(cause),
        }
    }

    /// True iff this is the "loop terminated between stop phases" error, which
    /// the shutdown sequence swallows.
    #[must_use]
    pub fn is_already_disposed(&self) -> bool {
        matches!(self, Self::AlreadyDisposed)
    }
}

/// Extracts a printable message from a panic payload.
///
/// Panic payloads are `Box<dyn Any>`; in practice they are almost always a
/// `&str` or a `String` (from `panic!` with or without formatting).
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
