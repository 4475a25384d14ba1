// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Bounded lock-free MPMC queue following the classic sequence-based design:
//! every slot carries a monotonic sequence counter that encodes whether the
//! slot is free for the producer at position `pos` (`seq == pos`) or holds a
//! value for the consumer at `pos` (`seq == pos + 1`). Full and empty return
//! immediately; a slot observed one step behind belongs to a peer that is
//! between its CAS and its sequence publication, so the caller yields and
//! retries.

use crate::error::TreeError;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct RingBuffer<T> {
    mask: usize,
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// The slot protocol guarantees each value is written by exactly one producer
// and read by exactly one consumer between two synchronizing sequence updates.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Capacity must be a power of two and at least 2.
    pub fn with_capacity(capacity: usize) -> Result<Self, TreeError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(TreeError::InvalidCapacity);
        }
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ok(Self {
            mask: capacity - 1,
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Fails immediately when the queue is full, handing the value back.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let delta = seq as isize - pos as isize;

            if delta == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { (*slot.value.get()).write(value) };
                    slot.sequence.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
                continue;
            }
            if delta < 0 {
                return Err(value);
            }
            std::thread::yield_now();
        }
    }

    /// Returns `None` immediately when the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let delta = seq as isize - (pos + 1) as isize;

            if delta == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.sequence
                        .store(pos + self.capacity(), Ordering::Release);
                    return Some(value);
                }
                continue;
            }
            if delta < 0 {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rejects_invalid_capacities() {
        for capacity in [0usize, 1, 3, 6, 100] {
            assert_eq!(
                RingBuffer::<u32>::with_capacity(capacity).err(),
                Some(TreeError::InvalidCapacity),
            );
        }
        assert!(RingBuffer::<u32>::with_capacity(2).is_ok());
        assert!(RingBuffer::<u32>::with_capacity(1024).is_ok());
    }

    #[test]
    fn fifo_and_capacity_bounds() {
        let queue = RingBuffer::with_capacity(8).unwrap();
        for i in 0..8 {
            assert!(queue.enqueue(i).is_ok());
        }
        // The ninth enqueue fails and hands the value back.
        assert_eq!(queue.enqueue(99), Err(99));

        for expected in 0..8 {
            assert_eq!(queue.dequeue(), Some(expected));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn drops_undrained_values() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let queue = RingBuffer::with_capacity(4).unwrap();
        for _ in 0..3 {
            assert!(queue.enqueue(Counted).is_ok());
        }
        drop(queue.dequeue());
        drop(queue);
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let queue = RingBuffer::with_capacity(1024).unwrap();
        let produced_sum = AtomicUsize::new(0);
        let consumed_sum = AtomicUsize::new(0);
        let consumed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                let produced_sum = &produced_sum;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        loop {
                            match queue.enqueue(value) {
                                Ok(()) => break,
                                Err(back) => value = back,
                            }
                        }
                        produced_sum.fetch_add(value, Ordering::Relaxed);
                    }
                });
            }
            for _ in 0..CONSUMERS {
                let queue = &queue;
                let consumed = &consumed;
                let consumed_sum = &consumed_sum;
                scope.spawn(move || loop {
                    if consumed.load(Ordering::SeqCst) >= TOTAL {
                        return;
                    }
                    if let Some(value) = queue.dequeue() {
                        consumed_sum.fetch_add(value, Ordering::Relaxed);
                        consumed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        std::thread::yield_now();
                    }
                });
            }
        });

        assert_eq!(consumed.load(Ordering::SeqCst), TOTAL);
        assert_eq!(
            consumed_sum.load(Ordering::Relaxed),
            produced_sum.load(Ordering::Relaxed),
        );
    }
}
