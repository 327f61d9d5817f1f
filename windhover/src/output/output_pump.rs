// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-connection output pump.
//!
//! One pump per connection, spawned as an async task. Its lifetime alternates
//! between two execution contexts:
//!
//! 1. **Runtime side**: await the byte channel (resumes on any runtime
//!    thread).
//! 2. **Loop side**: a posted closure snapshots the channel's readable range,
//!    stages it into a pooled write request, and drives the socket write.
//!    The posted closure *is* the context switch onto the loop thread; the
//!    completion oneshot is the switch back.
//!
//! The loop-side completion path is guaranteed: whether the write succeeded
//! or failed, the staged range is marked consumed and the request returns to
//! the pool before the completion fires. The pump's own guaranteed-release
//! block then queues the socket close, notifies the connection exactly once,
//! and disposes the channel.
//!
//! Cancellation is cooperative: cancelling the byte channel surfaces at the
//! pump's next channel await (after pending bytes drain), which triggers an
//! orderly half-close (FIN) before release.

use super::byte_channel::{ByteChannel, ChannelRead};
use crate::{loop_thread::{controller::LoopThread, registry::HandleId},
            net::{connection::Connection,
                  socket_handle::{FinOutcome, WriteOutcome}}};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Why the pump's main loop ended. Logged in the release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    SocketClosed,
    Cancelled,
    ChannelDisposed,
    LoopGone,
}

/// Cooperative task draining one connection's byte channel to its socket.
pub struct OutputPump {
    loop_thread: Arc<LoopThread>,
    socket: HandleId,
    channel: Arc<ByteChannel>,
    connection: Arc<Connection>,
}

impl std::fmt::Debug for OutputPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPump")
            .field("connection", &self.connection.id())
            .finish_non_exhaustive()
    }
}

impl OutputPump {
    pub(crate) fn new(
        loop_thread: Arc<LoopThread>,
        socket: HandleId,
        channel: Arc<ByteChannel>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            loop_thread,
            socket,
            channel,
            connection,
        }
    }

    /// Runs until the socket closes or the pump is stopped, then releases
    /// everything. Success or failure, the release block runs.
    pub async fn run(self) {
        let reason = self.pump().await;
        self.release(reason);
    }

    async fn pump(&self) -> StopReason {
        loop {
            match self.channel.readable().await {
                ChannelRead::Readable => {}
                ChannelRead::Cancelled => {
                    self.write_fin().await;
                    return StopReason::Cancelled;
                }
                ChannelRead::Disposed => return StopReason::ChannelDisposed,
            }

            let (tx, rx) = oneshot::channel::<WriteOutcome>();
            let socket = self.socket;
            let channel = Arc::clone(&self.channel);
            if self
                .loop_thread
                .post(move |ctx| {
                    ctx.write_channel_range(socket, &channel, tx);
                    Ok(())
                })
                .is_err()
            {
                return StopReason::LoopGone;
            }

            match rx.await {
                Ok(outcome) => {
                    match &outcome.result {
                        Ok(bytes) => {
                            tracing::debug!(
                                connection = self.connection.id(),
                                bytes = *bytes,
                                blocks = outcome.block_count,
                                "connection_write_callback"
                            );
                        }
                        Err(error) => {
                            tracing::warn!(
                                connection = self.connection.id(),
                                %error,
                                "connection_error"
                            );
                            self.connection.abort();
                        }
                    }
                    if outcome.socket_closed {
                        return StopReason::SocketClosed;
                    }
                }
                // Completion dropped: the socket was closed out from under
                // the in-flight write.
                Err(_) => return StopReason::SocketClosed,
            }
        }
    }

    /// Orderly half-close after cancellation: skip if the socket is already
    /// closed, otherwise send FIN and log its status.
    async fn write_fin(&self) {
        let (tx, rx) = oneshot::channel::<FinOutcome>();
        let socket = self.socket;
        if self
            .loop_thread
            .post(move |ctx| {
                ctx.shutdown_socket_write(socket, tx);
                Ok(())
            })
            .is_err()
        {
            return;
        }

        match rx.await {
            Ok(FinOutcome::AlreadyClosed) | Err(_) => {}
            Ok(FinOutcome::Sent(Ok(()))) => {
                tracing::debug!(connection = self.connection.id(), "connection_wrote_fin");
            }
            Ok(FinOutcome::Sent(Err(error))) => {
                tracing::debug!(
                    connection = self.connection.id(),
                    %error,
                    "connection_wrote_fin"
                );
            }
        }
    }

    /// Guaranteed-release: dispose the socket handle on the loop, notify the
    /// connection once, dispose the channel, log the stop.
    fn release(&self, reason: StopReason) {
        let socket = self.socket;
        // A dead loop has already leaked the handle deliberately.
        let _ = self.loop_thread.queue_close_handle(move |ctx| {
            ctx.begin_close(socket);
            Ok(())
        });
        self.connection.on_socket_closed();
        self.channel.dispose();
        tracing::debug!(
            connection = self.connection.id(),
            ?reason,
            "connection_stop"
        );
    }
}
