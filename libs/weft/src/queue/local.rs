// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker local run queue.
//!
//! A fixed-capacity array ring with a single producer (the owning worker)
//! and multiple consumers. Consumers - the owner popping and other workers
//! stealing - use the same claim protocol: atomically exchange the head slot
//! with null, and only the claimant that won the slot advances the head.
//! A claimant that loses the exchange retries against the (eventually)
//! advanced head, up to a bound.

use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::task::{FiberTask, TaskRef};
use core::ptr;
use crossbeam_utils::CachePadded;

/// Capacity of a worker's local queue. Power of two so indices mask cheaply.
/// Tiny under loom so the model stays tractable.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = if cfg!(loom) { 4 } else { 256 };

/// Bound on claim retries before a consumer reports the queue as empty. A
/// retry loses only to a concurrent claimant that *did* take a task, so
/// giving up early never loses work.
const CLAIM_RETRIES: usize = 8;

pub(crate) struct LocalQueue {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[AtomicPtr<FiberTask>]>,
}

// === impl LocalQueue ===

impl LocalQueue {
    pub(crate) fn new() -> Self {
        let slots = (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
        }
    }

    /// Approximate number of queued tasks. Exact only when quiescent.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a task. Owner only.
    ///
    /// # Errors
    ///
    /// Returns the task back when the queue is full; the caller falls back
    /// to an inbox or the global queue.
    pub(crate) fn push(&self, task: TaskRef) -> Result<(), TaskRef> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= LOCAL_QUEUE_CAPACITY {
            return Err(task);
        }

        let slot = &self.slots[tail % LOCAL_QUEUE_CAPACITY];
        let prev = slot.swap(task.as_ptr(), Ordering::Release);
        debug_assert!(prev.is_null(), "local queue slot was still occupied");

        // Publish the slot before the new tail so a consumer that sees the
        // index also sees the task.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Claims one task from the head. Used by both the owner (pop) and other
    /// workers (steal); the protocol is identical.
    pub(crate) fn claim(&self) -> Option<TaskRef> {
        for _ in 0..CLAIM_RETRIES {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);

            if head == tail {
                return None;
            }

            let slot = &self.slots[head % LOCAL_QUEUE_CAPACITY];
            let claimed = slot.swap(ptr::null_mut(), Ordering::AcqRel);

            if let Some(task) = TaskRef::from_ptr(claimed) {
                // Only the winner of the slot advances the head, so this CAS
                // cannot lose.
                let advanced = self.head.compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                debug_assert!(advanced.is_ok(), "head advanced by a non-claimant");
                return Some(task);
            }

            // Lost the slot to a concurrent claimant that has not advanced
            // the head yet; spin and retry against the new head.
            core::hint::spin_loop();
        }

        None
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
    fn fifo_push_pop() {
        let q = LocalQueue::new();
        for i in 0..10 {
            q.push(leaked_task(i)).unwrap();
        }
        assert_eq!(q.len(), 10);
        for i in 0..10 {
            assert_eq!(q.claim().unwrap().task().id(), FiberId::from_raw(i));
        }
        assert!(q.claim().is_none());
        assert!(q.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn push_fails_when_full() {
        let q = LocalQueue::new();
        for i in 0..LOCAL_QUEUE_CAPACITY {
            q.push(leaked_task(i as u64)).unwrap();
        }
        assert!(q.push(leaked_task(9999)).is_err());

        // popping one makes room again
        q.claim().unwrap();
        q.push(leaked_task(10_000)).unwrap();
    }

    #[cfg(not(loom))]
    #[test]
    fn concurrent_steals_preserve_all_tasks() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::sync::Mutex;

        const TASKS: u64 = 200;
        let q = Arc::new(LocalQueue::new());
        for i in 0..TASKS {
            q.push(leaked_task(i)).unwrap();
        }

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    loop {
                        match q.claim() {
                            Some(task) => {
                                let fresh =
                                    seen.lock().unwrap().insert(task.task().id().as_u64());
                                assert!(fresh, "task claimed twice");
                            }
                            None if q.is_empty() => break,
                            // bounded-retry miss under contention; try again
                            None => std::hint::spin_loop(),
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), TASKS as usize);
    }

    /// Model the claim protocol: two consumers racing on a single-entry
    /// queue must hand out the task exactly once.
    #[test]
    fn claim_is_exclusive() {
        crate::loom::model(|| {
            use crate::loom::sync::Arc;
            use crate::loom::sync::atomic::AtomicUsize;

            let q = Arc::new(LocalQueue::new());
            q.push(leaked_task(1)).unwrap();

            let claims = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let q = Arc::clone(&q);
                    let claims = Arc::clone(&claims);
                    crate::loom::thread::spawn(move || {
                        if q.claim().is_some() {
                            claims.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(claims.load(Ordering::Relaxed), 1);
        });
    }
}
