// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Native handle registry owned by the loop thread.
//!
//! Every native resource the loop owns — the wake primitive, stream sockets,
//! and any handle the host registers — occupies one slot here. The registry
//! answers the two questions the reactor loop asks every tick:
//!
//! 1. **Liveness**: does any handle still keep the loop alive? A handle keeps
//!    the loop alive while it is *referenced* and open, or while a close is in
//!    progress. The wake handle starts referenced; unreferencing it is how
//!    the first stop phase lets the reactor return naturally once nothing
//!    else is left. Unreferencing twice is a no-op.
//! 2. **Close progress**: which handles are mid-close and need another
//!    [`LoopHandle::poll_close`] attempt this tick?
//!
//! Slots are only touched from the loop thread; no synchronization.

use crate::output::write_pool::WriteRequestPool;

/// Identifies a registered handle. The slot index doubles as the handle's
/// [`mio::Token`] value; the wake primitive uses a reserved out-of-band token
/// instead, so the two can never collide. The generation guards against slot
/// reuse: a stale id for a slot that has since been recycled matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: usize,
    generation: u64,
}

impl HandleId {
    #[must_use]
    pub(crate) fn token(self) -> mio::Token {
        mio::Token(self.index)
    }
}

/// Resources a closing handle may need to release. External [`LoopHandle`]
/// implementations (host-registered handles) can ignore this.
pub struct CloseCx<'a> {
    pub(crate) poll_registry: &'a mio::Registry,
    pub(crate) write_pool: &'a mut WriteRequestPool,
}

impl std::fmt::Debug for CloseCx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseCx").finish_non_exhaustive()
    }
}

/// A native resource bound to the loop thread.
///
/// Implemented internally for the wake marker and stream sockets, and
/// externally by hosts that attach their own loop-bound resources (the
/// acceptance layer's listener, timers). All methods run on the loop thread.
pub trait LoopHandle: Send {
    /// Short, static name for logs and walks.
    fn name(&self) -> &'static str;

    /// Drives an in-progress close. Returns `true` once the handle is fully
    /// closed; until then it is called again on subsequent reactor ticks and
    /// the pending close keeps the loop alive.
    fn poll_close(&mut self, _cx: &mut CloseCx<'_>) -> bool {
        true
    }

    /// Downcast support for internal socket access.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Marker handle occupying the wake primitive's registry slot. The actual
/// `mio::Waker` lives on the shared state (producers need it); this slot
/// carries the wake primitive's reference bit for loop liveness.
pub(crate) struct WakeHandle;

impl LoopHandle for WakeHandle {
    fn name(&self) -> &'static str {
        "wake"
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

struct HandleSlot {
    handle: Box<dyn LoopHandle>,
    referenced: bool,
    closing: bool,
    generation: u64,
}

/// Slab of live handles. Loop thread only.
pub(crate) struct HandleRegistry {
    slots: Vec<Option<HandleSlot>>,
    wake_slot: Option<HandleId>,
    next_generation: u64,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            wake_slot: None,
            next_generation: 0,
        }
    }

    /// Registers a handle, reusing a free slot when one exists.
    pub(crate) fn insert(&mut self, handle: Box<dyn LoopHandle>, referenced: bool) -> HandleId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = HandleSlot {
            handle,
            referenced,
            closing: false,
            generation,
        };
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return HandleId { index, generation };
            }
        }
        self.slots.push(Some(slot));
        HandleId {
            index: self.slots.len() - 1,
            generation,
        }
    }

    /// Records which slot is the wake primitive. Set once at loop startup and
    /// never reassigned while the loop runs, so identity comparison against
    /// it cannot alias.
    pub(crate) fn set_wake_slot(&mut self, id: HandleId) {
        debug_assert!(self.wake_slot.is_none());
        self.wake_slot = Some(id);
    }

    pub(crate) fn wake_slot(&self) -> Option<HandleId> {
        self.wake_slot
    }

    /// True while any handle is (referenced and open) or mid-close. This is
    /// the reactor's run condition.
    pub(crate) fn keeps_loop_alive(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.referenced || slot.closing)
    }

    /// True while any close is in progress (the reactor shortens its poll
    /// timeout so multi-tick closes make progress without an I/O event).
    pub(crate) fn has_closing(&self) -> bool {
        self.slots.iter().flatten().any(|slot| slot.closing)
    }

    /// True while the slot holds an open, not-yet-closing handle.
    pub(crate) fn is_open(&self, id: HandleId) -> bool {
        self.slot(id).is_some_and(|slot| !slot.closing)
    }

    /// Clears the wake primitive's reference bit. Idempotent: unreferencing
    /// an already-unreferenced handle changes nothing.
    pub(crate) fn unreference_wake(&mut self) {
        if let Some(id) = self.wake_slot
            && let Some(slot) = self.slot_mut(id)
        {
            slot.referenced = false;
        }
    }

    /// Begins closing `id`. Idempotent; unknown ids are ignored (the handle
    /// already finished closing).
    pub(crate) fn begin_close(&mut self, id: HandleId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.closing = true;
        }
    }

    /// Begins closing every handle except the wake primitive's slot. This is
    /// the rude-stop walk.
    pub(crate) fn begin_close_all_except_wake(&mut self) {
        let wake = self.wake_slot;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = entry {
                let id = HandleId {
                    index,
                    generation: slot.generation,
                };
                if wake == Some(id) {
                    continue;
                }
                slot.closing = true;
            }
        }
    }

    /// Runs `f` once per live handle.
    pub(crate) fn walk(&mut self, mut f: impl FnMut(HandleId, &mut dyn LoopHandle)) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = entry {
                let id = HandleId {
                    index,
                    generation: slot.generation,
                };
                f(id, slot.handle.as_mut());
            }
        }
    }

    /// Drives every mid-close handle one step and frees the slots that
    /// finished. Returns how many handles fully closed this pass.
    pub(crate) fn reap_closing(&mut self, cx: &mut CloseCx<'_>) -> usize {
        let mut reaped = 0;
        for entry in &mut self.slots {
            let finished = match entry {
                Some(slot) if slot.closing => slot.handle.poll_close(cx),
                _ => false,
            };
            if finished {
                *entry = None;
                reaped += 1;
            }
        }
        reaped
    }

    /// Mutable access to a live handle's implementation, downcast to `T`.
    pub(crate) fn handle_mut<T: 'static>(&mut self, id: HandleId) -> Option<&mut T> {
        let slot = self.slot_mut(id)?;
        if slot.closing {
            return None;
        }
        slot.handle.as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Current id of the live handle at a token's slot index, if any. Used by
    /// the event dispatch path, where only the token is known.
    pub(crate) fn id_at_token(&self, token: mio::Token) -> Option<HandleId> {
        let slot = self.slots.get(token.0)?.as_ref()?;
        Some(HandleId {
            index: token.0,
            generation: slot.generation,
        })
    }

    /// Looks up `id`, refusing stale ids whose slot has been recycled.
    fn slot(&self, id: HandleId) -> Option<&HandleSlot> {
        self.slots
            .get(id.index)
            .and_then(Option::as_ref)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: HandleId) -> Option<&mut HandleSlot> {
        self.slots
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .filter(|slot| slot.generation == id.generation)
    }
}
