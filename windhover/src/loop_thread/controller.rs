// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR unreferenced unreference

//! The loop thread controller.
//!
//! [`LoopThread`] owns the dedicated OS thread that runs the reactor
//! ([`mio::Poll`]) and serializes every native handle mutation. External
//! threads talk to it through exactly three doors:
//!
//! - [`post()`] / [`post_async()`] — cross-thread work, drained in batches by
//!   the wake handler,
//! - [`queue_close_handle()`] / [`queue_close_async_handle()`] — deferred
//!   handle destruction, and
//! - [`stop()`] — the bounded three-phase shutdown.
//!
//! # The wake cycle
//!
//! A producer enqueues, then arms the posted flag; the winner signals the
//! [`mio::Waker`]. On the loop thread, the wake event is the *sole* entry
//! point for draining: the handler re-arms the flag, then alternates work and
//! close drains for at most [`MAX_LOOPS`] iterations. The cap keeps a task
//! that enqueues from its own callbacks from starving socket events — at the
//! limit, control returns to the reactor for one tick before draining
//! resumes.
//!
//! # Three-phase stop
//!
//! Each phase is strictly more aggressive than the one before, and each gets
//! one third of the caller's timeout:
//!
//! 1. **AllowStop** — unreference the wake primitive; with nothing else
//!    keeping the loop alive, the reactor returns naturally.
//! 2. **StopRude** — walk every live handle except the wake primitive and
//!    begin closing it; the reactor returns when the closes finish.
//! 3. **StopImmediate** — set the stop-immediate flag and force the reactor
//!    to return. The second cleanup pass is skipped: remaining handles are
//!    deliberately leaked in exchange for a bounded shutdown.
//!
//! A fatal error captured on the loop (a completion-less work item failing, a
//! close callback failing, the reactor itself failing) is stored in the
//! fatal-error slot, the application lifetime is asked to stop, and the error
//! is rethrown from [`stop()`].
//!
//! [`post()`]: LoopThread::post
//! [`post_async()`]: LoopThread::post_async
//! [`queue_close_handle()`]: LoopThread::queue_close_handle
//! [`queue_close_async_handle()`]: LoopThread::queue_close_async_handle
//! [`stop()`]: LoopThread::stop

use super::{close_queue::CloseQueue,
            context::LoopContext,
            registry::{CloseCx, HandleRegistry, WakeHandle},
            work_queue::{PostedFlag, SwapQueue}};
use crate::{config::ServerConfig,
            error::{LoopError, LoopResult, panic_message},
            lifetime::{ApplicationLifetime, NoopLifetime},
            net::connection_manager::ConnectionManager,
            output::{memory_pool::MemoryPool, write_pool::WriteRequestPool}};
use smallvec::SmallVec;
use std::{panic::{AssertUnwindSafe, catch_unwind},
          sync::{Arc, Mutex, OnceLock,
                 atomic::{AtomicBool, AtomicU8, Ordering}},
          time::Duration};
use tokio::sync::{oneshot, watch};

/// Maximum back-to-back work/close drain iterations per wake.
pub const MAX_LOOPS: usize = 8;

/// Reserved token for the wake primitive; socket tokens are registry slot
/// indices and can never reach it.
const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Poll timeout while any handle is mid-close, so multi-tick closes make
/// progress without waiting for an I/O event.
const CLOSE_TICK: Duration = Duration::from_millis(10);

/// Bound on drain/reap rounds in the post-run cleanup pass.
const MAX_FINAL_CLOSE_ROUNDS: usize = 64;

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_TERMINATED: u8 = 3;

/// A unit of cross-thread work, consumed exactly once on the loop thread.
pub(crate) type WorkFn = Box<dyn FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send>;

pub(crate) struct WorkItem {
    run: WorkFn,
    /// Present iff the item was posted via [`LoopThread::post_async`]. Errors
    /// from such items are routed here instead of being fatal.
    completion: Option<oneshot::Sender<LoopResult<()>>>,
}

/// State shared between the controller handle and the loop thread.
pub(crate) struct LoopShared {
    work: SwapQueue<WorkItem>,
    close: CloseQueue,
    posted: PostedFlag,
    /// Set on the loop thread during startup; producers use it to signal.
    waker: OnceLock<mio::Waker>,
    /// The startup mutex. Guards the ready flag against `stop()` racing
    /// `start()`.
    ready: Mutex<bool>,
    fatal: Mutex<Option<LoopError>>,
    stop_immediate: AtomicBool,
    state: AtomicU8,
    done_tx: watch::Sender<bool>,
}

impl LoopShared {
    fn new(done_tx: watch::Sender<bool>) -> Self {
        Self {
            work: SwapQueue::new(),
            close: CloseQueue::new(),
            posted: PostedFlag::new(),
            waker: OnceLock::new(),
            ready: Mutex::new(false),
            fatal: Mutex::new(None),
            stop_immediate: AtomicBool::new(false),
            state: AtomicU8::new(STATE_IDLE),
            done_tx,
        }
    }

    fn capture_fatal(&self, error: LoopError) {
        let mut slot = self
            .fatal
            .lock()
            .expect("fatal-error slot mutex poisoned");
        // First error wins; later ones were already logged where they arose.
        slot.get_or_insert(error);
    }
}

/// Controller for the dedicated event-loop thread. See the [module
/// docs](self).
pub struct LoopThread {
    shared: Arc<LoopShared>,
    done_rx: watch::Receiver<bool>,
    config: ServerConfig,
    memory_pool: Arc<MemoryPool>,
    connections: Arc<ConnectionManager>,
    lifetime: Arc<dyn ApplicationLifetime>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread")
            .field("state", &self.shared.state.load(Ordering::Acquire))
            .field("live_connections", &self.connections.live_count())
            .finish_non_exhaustive()
    }
}

impl LoopThread {
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_lifetime(config, Arc::new(NoopLifetime))
    }

    #[must_use]
    pub fn with_lifetime(
        config: ServerConfig,
        lifetime: Arc<dyn ApplicationLifetime>,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            shared: Arc::new(LoopShared::new(done_tx)),
            done_rx,
            config,
            memory_pool: Arc::new(MemoryPool::new()),
            connections: Arc::new(ConnectionManager::new()),
            lifetime,
            join: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Spawns the loop thread and resolves once reactor initialization
    /// completes (success or failure). After a failure no further operations
    /// on this instance are valid.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyStarted`] on a second call; the initialization
    /// error when the reactor or wake primitive cannot be created.
    pub async fn start(&self) -> LoopResult<()> {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_STARTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LoopError::AlreadyStarted);
        }

        let (start_tx, start_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let lifetime = Arc::clone(&self.lifetime);
        let spawned = std::thread::Builder::new()
            .name("windhover-loop".to_string())
            .spawn(move || loop_main(&shared, lifetime.as_ref(), start_tx));
        match spawned {
            Ok(handle) => {
                *self
                    .join
                    .lock()
                    .expect("loop join-handle mutex poisoned") = Some(handle);
            }
            Err(e) => {
                self.shared.state.store(STATE_IDLE, Ordering::Release);
                return Err(LoopError::io("loop thread spawn", e));
            }
        }

        match start_rx.await {
            Ok(result) => result,
            Err(_) => Err(LoopError::StartFailed(
                "loop thread exited before initialization completed".to_string(),
            )),
        }
    }

    /// Enqueues fire-and-forget work for the loop thread. Wait-free on the
    /// producer apart from the posted-flag CAS. An error returned by `f` (or
    /// a panic inside it) is fatal to the loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyDisposed`] once the loop thread has terminated.
    pub fn post<F>(&self, f: F) -> LoopResult<()>
    where
        F: FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send + 'static,
    {
        self.post_item(WorkItem {
            run: Box::new(f),
            completion: None,
        })
    }

    /// Enqueues work and resolves once it has run. Completions are delivered
    /// through the async runtime — the loop thread never runs the caller's
    /// continuation inline. An error returned by `f` arrives here instead of
    /// being fatal to the loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyDisposed`] when the loop has terminated (or
    /// terminates before the item runs); otherwise whatever `f` returned.
    pub async fn post_async<F>(&self, f: F) -> LoopResult<()>
    where
        F: FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post_item(WorkItem {
            run: Box::new(f),
            completion: Some(tx),
        })?;
        rx.await.map_err(|_| LoopError::AlreadyDisposed)?
    }

    /// Enqueues a handle-close operation and signals the wake primitive. Use
    /// this from ordinary code paths.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyDisposed`] once the loop thread has terminated.
    pub fn queue_close_handle<F>(&self, f: F) -> LoopResult<()>
    where
        F: FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send + 'static,
    {
        self.queue_close_async_handle(f)?;
        self.signal();
        Ok(())
    }

    /// Enqueue-only variant of [`queue_close_handle()`], safe from drop-glue
    /// contexts where signaling is undesirable. The close runs on the next
    /// wake.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyDisposed`] once the loop thread has terminated.
    ///
    /// [`queue_close_handle()`]: Self::queue_close_handle
    pub fn queue_close_async_handle<F>(&self, f: F) -> LoopResult<()>
    where
        F: FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send + 'static,
    {
        if self.shared.state.load(Ordering::Acquire) == STATE_TERMINATED {
            return Err(LoopError::AlreadyDisposed);
        }
        self.shared.close.push(Box::new(f));
        Ok(())
    }

    /// The captured fatal error, if the loop has failed.
    #[must_use]
    pub fn fatal_error(&self) -> Option<LoopError> {
        self.shared
            .fatal
            .lock()
            .expect("fatal-error slot mutex poisoned")
            .clone()
    }

    /// Three-phase shutdown; see the [module docs](self). Resolves when the
    /// thread terminates or all three phases time out. Returns immediately
    /// for instances that never finished starting.
    ///
    /// # Errors
    ///
    /// Rethrows the captured fatal error, if any.
    pub async fn stop(&self, timeout: Duration) -> LoopResult<()> {
        {
            let ready = self.shared.ready.lock().expect("startup mutex poisoned");
            if !*ready {
                return Ok(());
            }
        }

        // Pre-stop: close connections cooperatively, then dispose the pools.
        let graceful = self
            .connections
            .walk_and_close_all(self.config.shutdown_timeout)
            .await;
        if !graceful {
            tracing::warn!(
                timeout = ?self.config.shutdown_timeout,
                "not_all_connections_closed_gracefully"
            );
        }
        if let Err(e) = self.post(|ctx| {
            ctx.dispose_write_pool();
            Ok(())
        }) && !e.is_already_disposed()
        {
            tracing::warn!(error = %e, "write-request pool disposal failed");
        }
        self.memory_pool.dispose();

        let step = timeout / 3;

        // Phase 1: AllowStop.
        self.swallow_disposed(self.post(|ctx| {
            ctx.unreference_wake();
            Ok(())
        }));
        if !self.wait_terminated(step).await {
            // Phase 2: StopRude.
            self.swallow_disposed(self.post(|ctx| {
                ctx.begin_close_all_except_wake();
                Ok(())
            }));
            if !self.wait_terminated(step).await {
                // Phase 3: StopImmediate.
                let shared = Arc::clone(&self.shared);
                self.swallow_disposed(self.post(move |_ctx| {
                    shared.stop_immediate.store(true, Ordering::Release);
                    Ok(())
                }));
                if !self.wait_terminated(step).await {
                    tracing::error!(?timeout, "loop thread failed to terminate");
                }
            }
        }

        // Reap the OS thread once it has signaled termination; if it never
        // did, leave the handle so a later stop can try again.
        if *self.done_rx.borrow() {
            let handle = self
                .join
                .lock()
                .expect("loop join-handle mutex poisoned")
                .take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }

        match self.fatal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn post_item(&self, item: WorkItem) -> LoopResult<()> {
        if self.shared.state.load(Ordering::Acquire) == STATE_TERMINATED {
            return Err(LoopError::AlreadyDisposed);
        }
        self.shared.work.push(item);
        self.signal();
        Ok(())
    }

    /// Arms the posted flag and, on winning the transition, fires the wake
    /// primitive. Must run after the enqueue (release/acquire pairing with
    /// the consumer's re-arm).
    fn signal(&self) {
        if self.shared.posted.try_fire()
            && let Some(waker) = self.shared.waker.get()
            && let Err(e) = waker.wake()
        {
            // The loop may already be gone; producers treat this as benign.
            tracing::warn!(error = %e, "wake signal failed");
        }
    }

    fn swallow_disposed(&self, result: LoopResult<()>) {
        if let Err(e) = result
            && !e.is_already_disposed()
        {
            tracing::warn!(error = %e, "stop-phase post failed");
        }
    }

    async fn wait_terminated(&self, step: Duration) -> bool {
        let mut done_rx = self.done_rx.clone();
        matches!(
            tokio::time::timeout(step, done_rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

enum RunOutcome {
    /// The reactor returned naturally: no referenced or closing handle left.
    Finished,
    /// Stop-immediate forced the return; skip cleanup.
    Stopped,
}

/// Entry point of the dedicated loop thread.
fn loop_main(
    shared: &Arc<LoopShared>,
    lifetime: &dyn ApplicationLifetime,
    start_tx: oneshot::Sender<LoopResult<()>>,
) {
    // Resolves the termination watch even if the thread panics while
    // unwinding through the reactor.
    struct DoneGuard<'a> {
        shared: &'a LoopShared,
    }
    impl Drop for DoneGuard<'_> {
        fn drop(&mut self) {
            self.shared.state.store(STATE_TERMINATED, Ordering::Release);
            let _ = self.shared.done_tx.send(true);
        }
    }
    let _done = DoneGuard { shared };

    let init = (|| {
        let poll = mio::Poll::new().map_err(|e| LoopError::io("reactor init", e))?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| LoopError::io("wake primitive init", e))?;
        Ok((poll, waker))
    })();

    let mut poll = {
        let mut ready = shared.ready.lock().expect("startup mutex poisoned");
        match init {
            Ok((poll, waker)) => {
                if shared.waker.set(waker).is_err() {
                    debug_assert!(false, "wake primitive installed twice");
                }
                shared.state.store(STATE_RUNNING, Ordering::Release);
                *ready = true;
                let _ = start_tx.send(Ok(()));
                poll
            }
            Err(e) => {
                let _ = start_tx.send(Err(e));
                return;
            }
        }
    };

    let mut registry = HandleRegistry::new();
    let wake_id = registry.insert(Box::new(WakeHandle), true);
    registry.set_wake_slot(wake_id);
    let mut write_pool = WriteRequestPool::new();
    let mut events = mio::Events::with_capacity(256);

    let run_result = run_reactor(shared, &mut poll, &mut events, &mut registry, &mut write_pool);

    let final_result = match run_result {
        // Deliberate leak: no second cleanup pass after a forced stop.
        Ok(RunOutcome::Stopped) => Ok(()),
        Ok(RunOutcome::Finished) => {
            final_close_pass(shared, &poll, &mut registry, &mut write_pool)
        }
        Err(e) => Err(e),
    };

    if let Err(error) = final_result {
        tracing::error!(%error, "loop thread captured a fatal error");
        shared.capture_fatal(error);
        lifetime.stop_application();
    }
}

fn run_reactor(
    shared: &Arc<LoopShared>,
    poll: &mut mio::Poll,
    events: &mut mio::Events,
    registry: &mut HandleRegistry,
    write_pool: &mut WriteRequestPool,
) -> LoopResult<RunOutcome> {
    // Posts that raced startup fired the flag before the waker existed; drain
    // them now so no signal is lost.
    {
        let mut ctx = LoopContext {
            registry: &mut *registry,
            poll_registry: poll.registry(),
            write_pool: &mut *write_pool,
        };
        wake_handler(shared, &mut ctx)?;
    }

    loop {
        if shared.stop_immediate.load(Ordering::Acquire) {
            return Ok(RunOutcome::Stopped);
        }
        if !registry.keeps_loop_alive() {
            return Ok(RunOutcome::Finished);
        }

        let timeout = if registry.has_closing() {
            Some(CLOSE_TICK)
        } else {
            None
        };
        if let Err(e) = poll.poll(events, timeout) {
            // EINTR: interrupted by a signal, safe to retry.
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(LoopError::io("reactor poll", e));
        }

        let tokens: SmallVec<[mio::Token; 32]> =
            events.iter().map(mio::event::Event::token).collect();
        {
            let mut ctx = LoopContext {
                registry: &mut *registry,
                poll_registry: poll.registry(),
                write_pool: &mut *write_pool,
            };
            for token in tokens {
                if token == WAKE_TOKEN {
                    wake_handler(shared, &mut ctx)?;
                } else {
                    ctx.resume_socket_write(token);
                }
            }
        }

        let mut close_cx = CloseCx {
            poll_registry: poll.registry(),
            write_pool: &mut *write_pool,
        };
        registry.reap_closing(&mut close_cx);
    }
}

/// The sole work-drain entry point. Re-arms the posted flag, then alternates
/// work and close drains up to [`MAX_LOOPS`] times. Returns the number of
/// iterations performed.
fn wake_handler(shared: &LoopShared, ctx: &mut LoopContext<'_>) -> LoopResult<usize> {
    shared.posted.rearm();
    let mut iterations = 0;
    while iterations < MAX_LOOPS {
        iterations += 1;
        let ran_work = drain_work(shared, ctx)?;
        let ran_close = drain_close(shared, ctx)?;
        if !ran_work && !ran_close {
            break;
        }
    }
    Ok(iterations)
}

fn drain_work(shared: &LoopShared, ctx: &mut LoopContext<'_>) -> LoopResult<bool> {
    let items = shared.work.swap_drain();
    let ran = !items.is_empty();
    for WorkItem { run, completion } in items {
        let outcome = catch_unwind(AssertUnwindSafe(|| run(&mut *ctx)));
        match (outcome, completion) {
            (Ok(Ok(())), Some(tx)) => {
                let _ = tx.send(Ok(()));
            }
            (Ok(Ok(())), None) => {}
            (Ok(Err(error)), Some(tx)) => {
                // Completion-routed: the loop carries on.
                let _ = tx.send(Err(error));
            }
            (Ok(Err(error)), None) => {
                tracing::error!(%error, "work item without completion failed");
                return Err(error);
            }
            (Err(payload), Some(tx)) => {
                let _ = tx.send(Err(LoopError::Panic(panic_message(payload.as_ref()))));
            }
            (Err(payload), None) => {
                let error = LoopError::Panic(panic_message(payload.as_ref()));
                tracing::error!(%error, "work item without completion panicked");
                return Err(error);
            }
        }
    }
    Ok(ran)
}

fn drain_close(shared: &LoopShared, ctx: &mut LoopContext<'_>) -> LoopResult<bool> {
    let items = shared.close.swap_drain();
    let ran = !items.is_empty();
    for item in items {
        match catch_unwind(AssertUnwindSafe(|| item(&mut *ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(%error, "close callback failed");
                return Err(error);
            }
            Err(payload) => {
                let error = LoopError::Panic(panic_message(payload.as_ref()));
                tracing::error!(%error, "close callback panicked");
                return Err(error);
            }
        }
    }
    Ok(ran)
}

/// Post-run cleanup after a natural reactor return: route the wake handle's
/// own teardown through the close queue, then drain closes and reap until
/// the registry is empty (bounded).
fn final_close_pass(
    shared: &Arc<LoopShared>,
    poll: &mio::Poll,
    registry: &mut HandleRegistry,
    write_pool: &mut WriteRequestPool,
) -> LoopResult<()> {
    if let Some(wake_id) = registry.wake_slot() {
        shared.close.push(Box::new(move |ctx| {
            ctx.begin_close(wake_id);
            Ok(())
        }));
    }

    let mut rounds = 0;
    while rounds < MAX_FINAL_CLOSE_ROUNDS {
        rounds += 1;
        let drained = {
            let mut ctx = LoopContext {
                registry: &mut *registry,
                poll_registry: poll.registry(),
                write_pool: &mut *write_pool,
            };
            drain_close(shared, &mut ctx)?
        };
        let mut close_cx = CloseCx {
            poll_registry: poll.registry(),
            write_pool: &mut *write_pool,
        };
        registry.reap_closing(&mut close_cx);
        if !drained && !registry.has_closing() {
            break;
        }
    }

    if registry.live_count() > 0 {
        tracing::warn!(
            live_handles = registry.live_count(),
            "handles still open at loop teardown"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        shared: Arc<LoopShared>,
        poll: mio::Poll,
        registry: HandleRegistry,
        write_pool: WriteRequestPool,
    }

    impl Harness {
        fn new() -> Self {
            let (done_tx, _done_rx) = watch::channel(false);
            Self {
                shared: Arc::new(LoopShared::new(done_tx)),
                poll: mio::Poll::new().unwrap(),
                registry: HandleRegistry::new(),
                write_pool: WriteRequestPool::new(),
            }
        }

        fn wake(&mut self) -> LoopResult<usize> {
            let mut ctx = LoopContext {
                registry: &mut self.registry,
                poll_registry: self.poll.registry(),
                write_pool: &mut self.write_pool,
            };
            wake_handler(&self.shared, &mut ctx)
        }
    }

    fn fire_and_forget(
        f: impl FnOnce(&mut LoopContext<'_>) -> LoopResult<()> + Send + 'static,
    ) -> WorkItem {
        WorkItem {
            run: Box::new(f),
            completion: None,
        }
    }

    #[test]
    fn drains_terminate_early_when_both_queues_empty() {
        let mut harness = Harness::new();
        harness.shared.work.push(fire_and_forget(|_| Ok(())));
        // One iteration does work, the second observes both queues empty.
        assert_eq!(harness.wake().unwrap(), 2);
    }

    /// A work item that keeps re-posting itself cannot drain past
    /// `MAX_LOOPS` iterations in one wake cycle.
    #[test]
    fn wake_handler_caps_back_to_back_drains() {
        fn repost(shared: &Arc<LoopShared>, budget: usize) {
            if budget == 0 {
                return;
            }
            let reposter = Arc::clone(shared);
            shared.work.push(fire_and_forget(move |_| {
                repost(&reposter, budget - 1);
                Ok(())
            }));
        }

        let mut harness = Harness::new();
        repost(&harness.shared, 100);
        assert_eq!(harness.wake().unwrap(), MAX_LOOPS);
        // The tail of the chain is still queued for the next wake.
        assert!(!harness.shared.work.is_empty());
    }

    /// A close enqueued by a running close callback is deferred to the next
    /// drain iteration.
    #[test]
    fn close_enqueued_during_close_drain_defers_one_round() {
        let mut harness = Harness::new();
        let order = Arc::new(AtomicUsize::new(0));

        let inner_order = Arc::clone(&order);
        let chained = Arc::clone(&harness.shared);
        harness.shared.close.push(Box::new(move |_| {
            assert_eq!(inner_order.fetch_add(1, Ordering::SeqCst), 0);
            let inner_order = Arc::clone(&inner_order);
            chained.close.push(Box::new(move |_| {
                assert_eq!(inner_order.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            }));
            Ok(())
        }));

        // Round 1 runs the first close (which enqueues the second), round 2
        // runs the second, round 3 observes both queues empty.
        assert_eq!(harness.wake().unwrap(), 3);
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn work_items_run_before_closes_within_an_iteration() {
        let mut harness = Harness::new();
        let order = Arc::new(AtomicUsize::new(0));

        let close_order = Arc::clone(&order);
        harness.shared.close.push(Box::new(move |_| {
            assert_eq!(close_order.fetch_add(1, Ordering::SeqCst), 1);
            Ok(())
        }));
        let work_order = Arc::clone(&order);
        harness.shared.work.push(fire_and_forget(move |_| {
            assert_eq!(work_order.fetch_add(1, Ordering::SeqCst), 0);
            Ok(())
        }));

        harness.wake().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completion_less_errors_are_fatal_to_the_drain() {
        let mut harness = Harness::new();
        harness
            .shared
            .work
            .push(fire_and_forget(|_| Err(LoopError::Work("boom".into()))));
        let error = harness.wake().unwrap_err();
        assert_eq!(error.to_string(), "work item failed: boom");
    }

    #[test]
    fn completion_routed_errors_do_not_kill_the_drain() {
        let mut harness = Harness::new();
        let (tx, mut rx) = oneshot::channel();
        harness.shared.work.push(WorkItem {
            run: Box::new(|_| Err(LoopError::Work("routed".into()))),
            completion: Some(tx),
        });

        assert!(harness.wake().is_ok());
        let routed = rx.try_recv().unwrap();
        assert_eq!(routed.unwrap_err().to_string(), "work item failed: routed");
    }

    #[test]
    fn panicking_items_with_completion_are_routed_not_fatal() {
        let mut harness = Harness::new();
        let (tx, mut rx) = oneshot::channel();
        harness.shared.work.push(WorkItem {
            run: Box::new(|_| panic!("kaboom")),
            completion: Some(tx),
        });

        assert!(harness.wake().is_ok());
        let routed = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(routed.to_string(), "posted work panicked: kaboom");
    }
}
