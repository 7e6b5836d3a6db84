// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded MPMC ring.
//!
//! Serves both the per-worker inboxes (other workers pushing
//! affinity-targeted fibers) and the fast path of the global queue. Each
//! slot carries a sequence number; producers claim a slot by CAS on the
//! tail, publish the task, then advance the slot's sequence, so a consumer
//! that wins the head CAS only reads a fully written slot. The transient
//! "tail advanced, slot not yet written" state is invisible to consumers:
//! they observe the old sequence number and treat the ring as empty.

use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::task::{FiberTask, TaskRef};
use core::ptr;
use crossbeam_utils::{Backoff, CachePadded};

struct Slot {
    seq: AtomicUsize,
    task: AtomicPtr<FiberTask>,
}

pub(crate) struct Ring {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot]>,
}

// === impl Ring ===

impl Ring {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());

        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                task: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();

        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
        }
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Approximate number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a task.
    ///
    /// # Errors
    ///
    /// Returns the task back when the ring is full.
    pub(crate) fn push(&self, task: TaskRef) -> Result<(), TaskRef> {
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[tail & self.mask()];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.task.store(task.as_ptr(), Ordering::Relaxed);
                        // Sequence advance publishes the task store above.
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => tail = actual,
                }
            } else if (seq.wrapping_sub(tail) as isize) < 0 {
                // The slot is a full lap behind: the ring is full.
                return Err(task);
            } else {
                // Lost the slot to a concurrent producer; re-read the tail.
                backoff.snooze();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops a task, or `None` when the ring is empty.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[head & self.mask()];
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = head.wrapping_add(1);

            if seq == expected {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let task = slot.task.swap(ptr::null_mut(), Ordering::Relaxed);
                        // Free the slot for the producer one lap ahead.
                        slot.seq
                            .store(head.wrapping_add(self.mask() + 1), Ordering::Release);
                        return TaskRef::from_ptr(task);
                    }
                    Err(actual) => head = actual,
                }
            } else if (seq.wrapping_sub(expected) as isize) < 0 {
                // Slot not yet published: the ring is empty (or the producer
                // is mid-publish, which the caller treats the same way).
                return None;
            } else {
                backoff.snooze();
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FiberId, FiberTask};

    fn leaked_task(id: u64) -> TaskRef {
        TaskRef::from_ptr(Box::into_raw(Box::new(FiberTask::new(FiberId::from_raw(
            id,
        )))))
        .unwrap()
    }

    #[cfg(not(loom))]
    #[test]
    fn fifo_order() {
        let ring = Ring::new(8);
        for i in 0..8 {
            ring.push(leaked_task(i)).unwrap();
        }
        assert!(ring.push(leaked_task(99)).is_err());
        for i in 0..8 {
            assert_eq!(ring.pop().unwrap().task().id(), FiberId::from_raw(i));
        }
        assert!(ring.pop().is_none());
    }

    #[cfg(not(loom))]
    #[test]
    fn wraps_around() {
        let ring = Ring::new(4);
        for lap in 0..10u64 {
            for i in 0..4 {
                ring.push(leaked_task(lap * 4 + i)).unwrap();
            }
            for i in 0..4 {
                assert_eq!(
                    ring.pop().unwrap().task().id(),
                    FiberId::from_raw(lap * 4 + i)
                );
            }
        }
    }

    #[cfg(not(loom))]
    #[test]
    fn mpmc_preserves_all_tasks() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        const PER_PRODUCER: u64 = 500;
        let ring = Arc::new(Ring::new(64));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let producers: Vec<_> = (0..2)
            .map(|p| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut task = leaked_task(p * PER_PRODUCER + i);
                        loop {
                            match ring.push(task) {
                                Ok(()) => break,
                                Err(back) => {
                                    task = back;
                                    std::thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    let mut got = 0;
                    while got < PER_PRODUCER {
                        if let Some(task) = ring.pop() {
                            let fresh = seen.lock().unwrap().insert(task.task().id().as_u64());
                            assert!(fresh, "task popped twice");
                            got += 1;
                        } else {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for t in producers.into_iter().chain(consumers) {
            t.join().unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), (2 * PER_PRODUCER) as usize);
    }

    /// Model two producers racing for the last slot: one push must succeed,
    /// the other must observe the ring full, and the task must survive.
    #[test]
    fn contended_push_pop() {
        crate::loom::model(|| {
            use crate::loom::sync::Arc;

            let ring = Arc::new(Ring::new(2));
            ring.push(leaked_task(0)).unwrap();

            let producer = {
                let ring = Arc::clone(&ring);
                crate::loom::thread::spawn(move || ring.push(leaked_task(1)).is_ok())
            };
            let consumer = {
                let ring = Arc::clone(&ring);
                crate::loom::thread::spawn(move || ring.pop().is_some())
            };

            let pushed = producer.join().unwrap();
            let popped = consumer.join().unwrap();

            // The consumer raced one guaranteed entry; it may miss it only if
            // the producer's push already claimed the tail. Either way no
            // entry may be lost: drain and count.
            let mut remaining = 0;
            while ring.pop().is_some() {
                remaining += 1;
            }
            let total = usize::from(popped) + remaining;
            assert_eq!(total, 1 + usize::from(pushed));
        });
    }
}
