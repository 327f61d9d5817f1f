// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words Treiber

//! The cross-thread work queue and its wake-signal deduplicator.
//!
//! # Double buffering via pointer swap
//!
//! [`SwapQueue`] is a multi-producer / single-consumer FIFO. Producers push
//! onto an atomic intrusive list (one CAS per push, no locks). The consumer's
//! [`swap_drain()`] exchanges the list head for null in a single atomic swap:
//! the whole *adding* buffer becomes the consumer's private *running* buffer,
//! and producers keep pushing onto a fresh, empty adding buffer. A producer
//! can never observe the running buffer — it only ever sees the head pointer,
//! and after the swap that points at an empty list.
//!
//! Pushes produce a LIFO list; reversing it on drain restores the total push
//! order, so items enqueued from one thread are consumed in that thread's
//! program order. Ordering between different producers is unspecified.
//!
//! # The posted flag
//!
//! [`PostedFlag`] deduplicates wake signals. The protocol (and its fencing):
//!
//! 1. A producer enqueues, **then** CASes `armed → fired` with [`Release`];
//!    only the winner signals the wake primitive.
//! 2. The consumer CASes `fired → armed` with [`Acquire`] **before** it
//!    drains.
//!
//! If an item is enqueued after the consumer re-arms but before the drain
//! finishes, the next producer observes `armed`, wins the CAS, and re-signals
//! — so the item cannot be lost. The cost is at most one redundant wake per
//! drain.
//!
//! [`Acquire`]: std::sync::atomic::Ordering::Acquire
//! [`Release`]: std::sync::atomic::Ordering::Release
//! [`swap_drain()`]: SwapQueue::swap_drain

use std::{ptr,
          sync::atomic::{AtomicBool, AtomicPtr, Ordering}};

/// One link in the intrusive push list.
struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Lock-free multi-producer / single-consumer FIFO with swap-drain double
/// buffering. See the [module docs](self) for the protocol.
pub(crate) struct SwapQueue<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> SwapQueue<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `value`. Wait-free apart from CAS retries under contention.
    pub(crate) fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` came from Box::into_raw above and has not been
            // shared yet; writing its `next` field is exclusive access.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Atomically takes the entire adding buffer and returns its items in
    /// FIFO push order. Consumer side only.
    pub(crate) fn swap_drain(&self) -> Vec<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut items = Vec::new();
        while !head.is_null() {
            // SAFETY: the swap above made this list private to the consumer;
            // each node was created by Box::into_raw in push() and is consumed
            // exactly once here.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            items.push(node.value);
        }
        items.reverse();
        items
    }

    /// True when the adding buffer has no items. Approximate under concurrent
    /// pushes; exact once producers have quiesced.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for SwapQueue<T> {
    fn drop(&mut self) {
        // Reclaim whatever is still queued so nodes are not leaked.
        drop(self.swap_drain());
    }
}

// SAFETY: the queue hands values across threads by ownership transfer; the
// only shared state is the atomic head pointer.
unsafe impl<T: Send> Send for SwapQueue<T> {}
unsafe impl<T: Send> Sync for SwapQueue<T> {}

/// Single-bit wake-signal deduplicator: `armed` (false) / `fired` (true).
pub(crate) struct PostedFlag {
    fired: AtomicBool,
}

impl PostedFlag {
    pub(crate) const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Producer side. Must be called *after* the enqueue. Returns true iff
    /// this caller won the `armed → fired` transition and must signal the
    /// wake primitive.
    pub(crate) fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Consumer side. Re-arms the flag; must be called *before* draining.
    pub(crate) fn rearm(&self) {
        self.fired.swap(false, Ordering::Acquire);
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn single_producer_order_is_preserved() {
        let queue = SwapQueue::new();
        for i in 0..100 {
            queue.push(i);
        }
        assert_eq!(queue.swap_drain(), (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn swap_drain_leaves_fresh_adding_buffer() {
        let queue = SwapQueue::new();
        queue.push(1);
        let first = queue.swap_drain();
        queue.push(2);
        let second = queue.swap_drain();
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
    }

    /// Boundary behavior: posting from N threads concurrently with drains in
    /// progress delivers every item exactly once.
    #[test]
    fn concurrent_producers_deliver_every_item_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let queue = Arc::new(SwapQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(producer * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        // Drain concurrently with the producers, like the wake handler does.
        let mut seen = Vec::new();
        while seen.len() < PRODUCERS * PER_PRODUCER {
            seen.extend(queue.swap_drain());
        }
        for handle in handles {
            handle.join().unwrap();
        }
        seen.extend(queue.swap_drain());

        seen.sort_unstable();
        assert_eq!(seen, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    }

    /// Per-producer program order survives interleaved drains.
    #[test]
    fn per_producer_order_survives_concurrent_drain() {
        let queue = Arc::new(SwapQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    queue.push(i);
                }
            })
        };

        let mut last_seen = None;
        let mut total = 0;
        while total < 10_000 {
            for value in queue.swap_drain() {
                if let Some(last) = last_seen {
                    assert!(value > last, "out of order: {value} after {last}");
                }
                last_seen = Some(value);
                total += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn posted_flag_fires_once_until_rearmed() {
        let flag = PostedFlag::new();
        assert!(flag.try_fire());
        assert!(!flag.try_fire());
        flag.rearm();
        assert!(!flag.is_fired());
        assert!(flag.try_fire());
    }

    #[test]
    fn rearm_on_armed_flag_is_a_no_op() {
        let flag = PostedFlag::new();
        flag.rearm();
        assert!(flag.try_fire());
    }
}
