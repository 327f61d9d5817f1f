// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The dedicated loop thread: controller, work/close queues, handle
//! registry, and the loop-thread-only context. See
//! [`controller`] for the architecture overview.

pub mod context;
pub mod controller;
pub mod registry;

pub(crate) mod close_queue;
pub(crate) mod work_queue;

pub use context::LoopContext;
pub use controller::{LoopThread, MAX_LOOPS};
pub use registry::{CloseCx, HandleId, LoopHandle};
