// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end lifecycle scenarios for the loop thread controller: cold stop,
//! clean shutdown, fatal work items, and the escalating stop phases.

use std::{sync::Arc, time::{Duration, Instant}};
use windhover::{ApplicationLifetime, CloseCx, LoopError, LoopHandle, LoopThread, ServerConfig,
                StopLatch, initialize_tracing_for_tests};

fn test_config() -> ServerConfig {
    ServerConfig {
        shutdown_timeout: Duration::from_millis(500),
    }
}

/// A registered handle that never closes on its own but cooperates once a
/// close is requested. Forces stop past phase 1.
struct IdleHandle;

impl LoopHandle for IdleHandle {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A registered handle whose close never completes. Forces stop past
/// phase 2.
struct StuckHandle;

impl LoopHandle for StuckHandle {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn poll_close(&mut self, _cx: &mut CloseCx<'_>) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[tokio::test]
async fn cold_stop_resolves_immediately_without_error() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());

    let started = Instant::now();
    loop_thread.stop(Duration::from_secs(60)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(loop_thread.fatal_error().is_none());
}

#[tokio::test]
async fn clean_shutdown_resolves_all_completions() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();

    for _ in 0..10 {
        loop_thread.post_async(|_ctx| Ok(())).await.unwrap();
    }

    let started = Instant::now();
    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
    // Phase 1 must have sufficed: nothing but the wake handle was alive.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(loop_thread.fatal_error().is_none());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();
    assert!(matches!(
        loop_thread.start().await,
        Err(LoopError::AlreadyStarted)
    ));
    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn fatal_work_item_is_captured_and_rethrown_from_stop() {
    initialize_tracing_for_tests();
    let latch = Arc::new(StopLatch::new());
    let loop_thread = LoopThread::with_lifetime(test_config(), Arc::clone(&latch) as Arc<dyn ApplicationLifetime>);
    loop_thread.start().await.unwrap();

    loop_thread
        .post(|_ctx| Err(LoopError::Work("boom".to_string())))
        .unwrap();

    let error = loop_thread
        .stop(Duration::from_secs(3))
        .await
        .expect_err("the captured fatal error must be rethrown");
    assert_eq!(error.to_string(), "work item failed: boom");
    assert!(latch.stop_requested());

    // Once the loop has died, posting reports disposal.
    assert!(matches!(
        loop_thread.post(|_ctx| Ok(())),
        Err(LoopError::AlreadyDisposed)
    ));
}

/// Phase 2 is required when a referenced handle never self-closes; it closes
/// the handle and the thread exits without error.
#[tokio::test]
async fn rude_shutdown_disposes_lingering_handles_in_phase_two() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();

    loop_thread
        .post_async(|ctx| {
            ctx.register_handle(Box::new(IdleHandle), true);
            Ok(())
        })
        .await
        .unwrap();

    let started = Instant::now();
    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
    let elapsed = started.elapsed();
    // Phase 1 must time out (one third of the budget) before phase 2 closes
    // the handle.
    assert!(elapsed >= Duration::from_secs(1), "stopped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "stopped too late: {elapsed:?}");
    assert!(loop_thread.fatal_error().is_none());
}

/// Phase 3 is required when a close never completes; the reactor is forced
/// to return and remaining handles are leaked, still without error.
#[tokio::test]
async fn stop_immediate_bounds_shutdown_when_a_close_blocks() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();

    loop_thread
        .post_async(|ctx| {
            ctx.register_handle(Box::new(StuckHandle), true);
            Ok(())
        })
        .await
        .unwrap();

    let timeout = Duration::from_secs(3);
    let started = Instant::now();
    loop_thread.stop(timeout).await.unwrap();
    let elapsed = started.elapsed();

    // Phases 1 and 2 each burn one third of the budget.
    assert!(elapsed >= Duration::from_secs(2), "stopped too early: {elapsed:?}");
    // Upper bound: timeout + shutdown_timeout + scheduling slack.
    let bound = timeout + test_config().shutdown_timeout + Duration::from_secs(1);
    assert!(elapsed < bound, "stop not bounded: {elapsed:?}");
    assert!(loop_thread.fatal_error().is_none());
}

/// Unreferencing the wake primitive twice is a no-op, and with nothing else
/// alive the reactor returns naturally.
#[tokio::test]
async fn double_unreference_is_idempotent_and_lets_the_loop_finish() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();

    loop_thread
        .post_async(|ctx| {
            ctx.unreference_wake();
            ctx.unreference_wake();
            Ok(())
        })
        .await
        .unwrap();

    // The loop should wind down on its own; stop() then observes a
    // terminated thread and still succeeds.
    let started = Instant::now();
    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(loop_thread.fatal_error().is_none());
}

/// The walk sees registered handles (and the wake primitive) on the loop
/// thread.
#[tokio::test]
async fn walk_visits_live_handles() {
    initialize_tracing_for_tests();
    let loop_thread = LoopThread::new(test_config());
    loop_thread.start().await.unwrap();

    loop_thread
        .post_async(|ctx| {
            ctx.register_handle(Box::new(IdleHandle), false);
            Ok(())
        })
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    loop_thread
        .post(move |ctx| {
            let mut names = Vec::new();
            ctx.walk(|_id, handle| names.push(handle.name()));
            let _ = tx.send(names);
            Ok(())
        })
        .unwrap();

    let names = rx.await.unwrap();
    assert!(names.contains(&"wake"));
    assert!(names.contains(&"idle"));

    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn clean_shutdown_does_not_signal_the_application_lifetime() {
    let latch = Arc::new(StopLatch::new());
    let loop_thread = LoopThread::with_lifetime(test_config(), Arc::clone(&latch) as Arc<dyn ApplicationLifetime>);
    loop_thread.start().await.unwrap();
    loop_thread.stop(Duration::from_secs(3)).await.unwrap();
    assert!(!latch.stop_requested());
}
