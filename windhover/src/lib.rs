// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue unreferenced windhover

//! # windhover
//!
//! The event-loop-bound dispatch core and connection output pump of a
//! high-performance HTTP server front-end. Two interlocking subsystems:
//!
//! 1. **The loop thread** ([`LoopThread`]) — a dedicated OS thread that owns
//!    the I/O reactor ([`mio::Poll`], epoll on Linux / kqueue on macOS). It
//!    serializes every native handle mutation, executes cross-thread work in
//!    batches, coordinates the bounded three-phase shutdown, and routes
//!    handle closes so native resources are released on the thread that
//!    created them.
//! 2. **The output pump** ([`OutputPump`]) — one cooperative task per
//!    connection that drains an in-memory byte channel ([`ByteChannel`])
//!    filled by request-processing code, hops onto the loop thread to touch
//!    the socket, and half-closes in an orderly way on cancellation.
//!
//! # Architecture
//!
//! ```text
//! any thread                      │ loop thread (owns mio::Poll)
//!                                 │
//! post()/post_async() ──┐         │   ┌──────────────────────────────┐
//!                        ▼        │   │ wake handler (≤ MAX_LOOPS):  │
//!              ┌──────────────┐  wake │   swap+drain work queue      │
//!              │ lock-free    │ ─────►│   swap+drain close queue     │
//!              │ swap queue   │   │   └──────────────────────────────┘
//!              └──────────────┘   │   ┌──────────────────────────────┐
//! queue_close_handle() ─────────► │   │ handle registry              │
//!                                 │   │  wake · sockets · host       │
//! ByteChannel ◄── request         │   └──────────────────────────────┘
//!     │           pipeline        │   ┌──────────────────────────────┐
//!     ▼ (await)                   │   │ write-request pool (≤ 1024)  │
//!  OutputPump ── posted closure ──┼──►│ stage + write / park / FIN   │
//!     ▲                           │   └──────────────────────────────┘
//!     └───── completion oneshot ──┘
//! ```
//!
//! # The affinity invariant
//!
//! Every native handle — the reactor, the wake primitive, sockets — is
//! created, mutated, and destroyed on the loop thread only. The compile-time
//! boundary is [`LoopContext`]: it is constructed nowhere but the loop
//! thread, and everything that touches a handle is a method on it. Off-loop
//! code reaches handles only through [`LoopThread::post`] and the
//! close-handle queue.
//!
//! # Shutdown
//!
//! [`LoopThread::stop`] first closes connections cooperatively (bounded by
//! [`ServerConfig::shutdown_timeout`]) and disposes the pools, then
//! escalates through three phases, each bounded by a third of the caller's
//! timeout: *AllowStop* (unreference the wake primitive), *StopRude* (close
//! every non-wake handle), *StopImmediate* (force the reactor to return and
//! deliberately leak whatever remains). A fatal error captured on the loop
//! is rethrown from `stop()`.

pub mod config;
pub mod error;
pub mod lifetime;
pub mod loop_thread;
pub mod net;
pub mod output;
pub mod tracing_setup;

pub use config::*;
pub use error::{LoopError, LoopResult};
pub use lifetime::*;
pub use loop_thread::{CloseCx, HandleId, LoopContext, LoopHandle, LoopThread, MAX_LOOPS};
pub use net::{Connection, ConnectionManager, WriteOutcome};
pub use output::{BLOCK_SIZE, ByteChannel, ChannelCursor, ChannelError, ChannelRead,
                 MAX_POOLED_WRITE_REQS, MemoryPool, OutputPump};
pub use tracing_setup::*;
