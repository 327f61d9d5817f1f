// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! One accepted connection, as seen by the output side.
//!
//! The connection owns nothing native: the socket lives in the loop's handle
//! registry and is only ever touched there. What lives here is the output
//! byte channel, the abort/close controls, and the exactly-once
//! socket-closed notification toward the connection manager.

use super::connection_manager::ConnectionManager;
use crate::{error::{LoopError, LoopResult},
            loop_thread::{controller::LoopThread, registry::HandleId},
            output::{byte_channel::ByteChannel, output_pump::OutputPump}};
use std::sync::{Arc, Weak,
                atomic::{AtomicBool, Ordering}};
use tokio::sync::oneshot;

/// Per-connection state shared between the output pump, the request
/// pipeline, and the connection manager.
pub struct Connection {
    id: u64,
    socket: HandleId,
    output: Arc<ByteChannel>,
    aborted: AtomicBool,
    socket_closed: AtomicBool,
    manager: Weak<ConnectionManager>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("aborted", &self.aborted.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Adopts an accepted socket: registers it with the reactor on the loop
    /// thread, tracks the connection in the manager, and spawns its output
    /// pump on the async runtime.
    ///
    /// # Errors
    ///
    /// Fails when the loop is gone ([`LoopError::AlreadyDisposed`]) or the
    /// socket cannot be registered with the reactor.
    pub async fn open(
        loop_thread: &Arc<LoopThread>,
        stream: std::net::TcpStream,
    ) -> LoopResult<Arc<Self>> {
        let manager = Arc::clone(loop_thread.connections());
        let (tx, rx) = oneshot::channel::<LoopResult<HandleId>>();
        loop_thread.post(move |ctx| {
            // Registration failures are this connection's problem, not the
            // loop's: route them through the completion.
            let _ = tx.send(ctx.register_socket(stream));
            Ok(())
        })?;
        let socket = rx.await.map_err(|_| LoopError::AlreadyDisposed)??;

        let connection = Arc::new(Self {
            id: manager.next_id(),
            socket,
            output: Arc::new(ByteChannel::new(Arc::clone(loop_thread.memory_pool()))),
            aborted: AtomicBool::new(false),
            socket_closed: AtomicBool::new(false),
            manager: Arc::downgrade(&manager),
        });
        manager.register(&connection);

        tokio::spawn(
            OutputPump::new(
                Arc::clone(loop_thread),
                connection.socket(),
                Arc::clone(&connection.output),
                Arc::clone(&connection),
            )
            .run(),
        );
        Ok(connection)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The output byte channel the request pipeline writes into.
    #[must_use]
    pub fn output(&self) -> &Arc<ByteChannel> {
        &self.output
    }

    pub(crate) fn socket(&self) -> HandleId {
        self.socket
    }

    /// Aborts the connection after an unrecoverable error: cancels the
    /// output channel so the pump winds down. Idempotent.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            self.output.cancel();
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Requests cooperative shutdown: the pump observes the cancelled channel
    /// at its next await, half-closes, and releases the socket.
    pub fn close(&self) {
        self.output.cancel();
    }

    /// Called by the pump's guaranteed-release path once the socket handle
    /// has been queued for disposal. Notifies the manager exactly once.
    pub(crate) fn on_socket_closed(&self) {
        if !self.socket_closed.swap(true, Ordering::AcqRel)
            && let Some(manager) = self.manager.upgrade()
        {
            manager.on_connection_stopped(self.id);
        }
    }
}
