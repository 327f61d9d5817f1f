// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The loop thread's working context.
//!
//! A [`LoopContext`] is handed to every posted work item and close callback,
//! and only ever constructed on the loop thread — it is the compile-time
//! boundary of the affinity invariant. Everything that touches a native
//! handle (socket registration, writes, half-closes, walks, handle disposal)
//! goes through methods here, so no handle can be touched from any other
//! thread.

use super::registry::{HandleId, HandleRegistry, LoopHandle};
use crate::{error::{LoopError, LoopResult},
            net::socket_handle::{FinOutcome, InFlightWrite, SocketHandle, WriteOutcome},
            output::{byte_channel::ByteChannel, write_pool::WriteRequestPool}};
use std::{io::Write, sync::Arc};
use tokio::sync::oneshot;

/// Loop-thread-only view over the reactor's mutable state.
pub struct LoopContext<'a> {
    pub(crate) registry: &'a mut HandleRegistry,
    pub(crate) poll_registry: &'a mio::Registry,
    pub(crate) write_pool: &'a mut WriteRequestPool,
}

impl std::fmt::Debug for LoopContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopContext")
            .field("live_handles", &self.registry.live_count())
            .finish_non_exhaustive()
    }
}

impl LoopContext<'_> {
    /// Registers a host-provided handle with the loop. While `referenced` is
    /// true the handle keeps the loop alive.
    pub fn register_handle(&mut self, handle: Box<dyn LoopHandle>, referenced: bool) -> HandleId {
        self.registry.insert(handle, referenced)
    }

    /// Registers a stream socket with the reactor (WRITABLE interest,
    /// edge-triggered) and tracks it as a referenced handle.
    ///
    /// # Errors
    ///
    /// Propagates the OS error when the socket cannot be made non-blocking or
    /// registered with the poller.
    pub fn register_socket(&mut self, stream: std::net::TcpStream) -> LoopResult<HandleId> {
        stream
            .set_nonblocking(true)
            .map_err(|e| LoopError::io("socket set_nonblocking", e))?;
        let stream = mio::net::TcpStream::from_std(stream);
        let id = self
            .registry
            .insert(Box::new(SocketHandle::new(stream)), true);

        let register_result = {
            let socket = self
                .registry
                .handle_mut::<SocketHandle>(id)
                .expect("socket slot was inserted just above");
            self.poll_registry
                .register(&mut socket.stream, id.token(), mio::Interest::WRITABLE)
        };
        if let Err(e) = register_result {
            self.registry.begin_close(id);
            return Err(LoopError::io("socket register", e));
        }
        Ok(id)
    }

    /// Executes `f` once per live native handle.
    pub fn walk(&mut self, f: impl FnMut(HandleId, &mut dyn LoopHandle)) {
        self.registry.walk(f);
    }

    /// Begins closing `id`; the close completes on a subsequent reactor tick.
    /// Idempotent.
    pub fn begin_close(&mut self, id: HandleId) {
        self.registry.begin_close(id);
    }

    /// Unreferences the wake primitive so the reactor may exit once nothing
    /// else keeps it busy. Idempotent.
    pub fn unreference_wake(&mut self) {
        self.registry.unreference_wake();
    }

    /// Begins closing every handle except the wake primitive. The rude-stop
    /// walk.
    pub(crate) fn begin_close_all_except_wake(&mut self) {
        self.registry.begin_close_all_except_wake();
    }

    /// Disposes the write-request pool (stop's pre-phase). Later check-ins
    /// fall into the disposal sink.
    pub(crate) fn dispose_write_pool(&mut self) {
        self.write_pool.dispose();
    }

    /// Idle write requests currently pooled. Exposed for shutdown accounting
    /// and tests.
    #[must_use]
    pub fn pooled_write_reqs(&self) -> usize {
        self.write_pool.pooled()
    }

    /// Snapshots the channel's readable range, stages it into a pooled write
    /// request, and drives the write. The completion fires when the socket
    /// has accepted every staged byte (possibly after parking on
    /// `WouldBlock`) or on error.
    pub(crate) fn write_channel_range(
        &mut self,
        id: HandleId,
        channel: &Arc<ByteChannel>,
        completion: oneshot::Sender<WriteOutcome>,
    ) {
        if !self.registry.is_open(id) {
            let _ = completion.send(WriteOutcome {
                result: Ok(0),
                block_count: 0,
                socket_closed: true,
            });
            return;
        }

        let mut req = self.write_pool.take();
        let Some(staged) = channel.stage_into(req.buf_mut()) else {
            // Raced with a consumer-side drain; nothing to write.
            self.write_pool.checkin(req);
            let _ = completion.send(WriteOutcome {
                result: Ok(0),
                block_count: 0,
                socket_closed: false,
            });
            return;
        };
        req.begin(staged.block_count);

        self.drive_write(
            id,
            InFlightWrite {
                req,
                end: staged.end,
                channel: Arc::clone(channel),
                completion,
            },
        );
    }

    /// Resumes the parked write on the socket behind `token` after a writable
    /// edge. Spurious events (stale token, no parked write) are ignored.
    pub(crate) fn resume_socket_write(&mut self, token: mio::Token) {
        let Some(id) = self.registry.id_at_token(token) else {
            return;
        };
        let Some(inflight) = self
            .registry
            .handle_mut::<SocketHandle>(id)
            .and_then(|socket| socket.parked.take())
        else {
            return;
        };
        self.drive_write(id, inflight);
    }

    /// Issues the cancellation half-close on `id`, reporting through
    /// `completion`. Already-closed sockets report [`FinOutcome::AlreadyClosed`].
    pub(crate) fn shutdown_socket_write(
        &mut self,
        id: HandleId,
        completion: oneshot::Sender<FinOutcome>,
    ) {
        let outcome = match self.registry.handle_mut::<SocketHandle>(id) {
            None => FinOutcome::AlreadyClosed,
            Some(socket) => FinOutcome::Sent(socket.stream.shutdown(std::net::Shutdown::Write)),
        };
        let _ = completion.send(outcome);
    }

    /// Writes until done, `WouldBlock` (park for the next writable edge), or
    /// error, then completes.
    fn drive_write(&mut self, id: HandleId, mut inflight: InFlightWrite) {
        enum Step {
            Done(InFlightWrite, std::io::Result<usize>),
            Parked,
        }

        if self.registry.handle_mut::<SocketHandle>(id).is_none() {
            // Closed while the write was parked.
            self.finish_write(
                id,
                inflight,
                Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            );
            return;
        }

        let step = {
            let socket = self
                .registry
                .handle_mut::<SocketHandle>(id)
                .expect("socket liveness checked just above");
            loop {
                if inflight.req.is_done() {
                    let written = inflight.req.total_bytes();
                    break Step::Done(inflight, Ok(written));
                }
                match socket.stream.write(inflight.req.pending()) {
                    Ok(0) => {
                        let error = std::io::Error::from(std::io::ErrorKind::WriteZero);
                        break Step::Done(inflight, Err(error));
                    }
                    Ok(accepted) => inflight.req.advance(accepted),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        socket.parked = Some(inflight);
                        break Step::Parked;
                    }
                    // EINTR: interrupted by a signal, safe to retry.
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => break Step::Done(inflight, Err(e)),
                }
            }
        };

        match step {
            Step::Parked => {}
            Step::Done(inflight, result) => self.finish_write(id, inflight, result),
        }
    }

    /// Guaranteed completion path: mark the staged range consumed, return the
    /// request to the pool, close the socket on error, then fire the
    /// completion.
    fn finish_write(
        &mut self,
        id: HandleId,
        inflight: InFlightWrite,
        result: std::io::Result<usize>,
    ) {
        let InFlightWrite {
            req,
            end,
            channel,
            completion,
        } = inflight;
        channel.consumed(end);
        let block_count = req.block_count();
        self.write_pool.checkin(req);

        if result.is_err() {
            self.registry.begin_close(id);
        }
        let socket_closed = !self.registry.is_open(id);
        let _ = completion.send(WriteOutcome {
            result,
            block_count,
            socket_closed,
        });
    }
}
