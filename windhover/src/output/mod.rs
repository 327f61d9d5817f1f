// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The output side of a connection: memory-pool-backed byte channel, pooled
//! write requests, and the per-connection output pump.

pub mod byte_channel;
pub mod memory_pool;
pub mod output_pump;

pub(crate) mod write_pool;

pub use byte_channel::{ByteChannel, ChannelCursor, ChannelError, ChannelRead};
pub use memory_pool::{BLOCK_SIZE, MemoryPool};
pub use output_pump::OutputPump;
pub use write_pool::MAX_POOLED_WRITE_REQS;
