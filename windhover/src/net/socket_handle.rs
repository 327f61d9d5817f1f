// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Stream-socket handle owned by the loop thread.
//!
//! The socket is registered with the reactor for WRITABLE interest at
//! creation. Readiness is edge-triggered: the write path runs until the
//! kernel reports `WouldBlock`, parks the in-flight request on this slot, and
//! resumes when the next writable edge arrives. At most one write is in
//! flight per socket.

use crate::{loop_thread::registry::{CloseCx, LoopHandle},
            output::{byte_channel::{ByteChannel, ChannelCursor},
                     write_pool::WriteRequest}};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Delivered to the output pump when a submitted write finishes.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Bytes written, or the error that ended the write.
    pub result: std::io::Result<usize>,
    /// How many channel blocks the staged range covered.
    pub block_count: usize,
    /// True once the socket is closed or closing; the pump exits its loop.
    pub socket_closed: bool,
}

/// Delivered to the output pump after the cancellation half-close.
#[derive(Debug)]
pub(crate) enum FinOutcome {
    /// The socket was already closed; nothing to do.
    AlreadyClosed,
    /// `shutdown(Write)` was issued with this result.
    Sent(std::io::Result<()>),
}

/// A write parked on `WouldBlock`, waiting for the next writable edge.
pub(crate) struct InFlightWrite {
    pub req: WriteRequest,
    pub end: ChannelCursor,
    pub channel: Arc<ByteChannel>,
    pub completion: oneshot::Sender<WriteOutcome>,
}

pub(crate) struct SocketHandle {
    pub(crate) stream: mio::net::TcpStream,
    pub(crate) parked: Option<InFlightWrite>,
}

impl SocketHandle {
    pub(crate) fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            parked: None,
        }
    }
}

impl LoopHandle for SocketHandle {
    fn name(&self) -> &'static str {
        "tcp-socket"
    }

    fn poll_close(&mut self, cx: &mut CloseCx<'_>) -> bool {
        // A parked write dies with the socket: its request goes back to the
        // pool and dropping the completion sender tells the pump the socket
        // closed under it.
        if let Some(inflight) = self.parked.take() {
            inflight.channel.consumed(inflight.end);
            cx.write_pool.checkin(inflight.req);
        }
        // Deregistration failure is moot: dropping the stream closes the fd
        // and the OS removes it from the poller anyway.
        let _ = cx.poll_registry.deregister(&mut self.stream);
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
