// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Opt-in tracing initialization for binaries and examples.
//!
//! The library itself only *emits* [`tracing`] events; hosts that already
//! run their own subscriber should keep doing so. This helper exists for
//! binaries and tests that want a sensible default without assembling the
//! subscriber by hand.

/// Where the display layer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPreference {
    Stdout,
    Stderr,
}

/// Installs a global `fmt` subscriber at `level` with thread names enabled
/// (the loop thread is named, which makes interleaved logs legible).
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn try_initialize_tracing(
    level: tracing::Level,
    display: DisplayPreference,
) -> miette::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true);
    match display {
        DisplayPreference::Stdout => builder.with_writer(std::io::stdout).try_init(),
        DisplayPreference::Stderr => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|e| miette::miette!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

/// Test-friendly variant: ignores "already installed" so every test can call
/// it.
pub fn initialize_tracing_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
