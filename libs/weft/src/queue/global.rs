// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global run queue: a bounded MPMC ring with a mutex-guarded overflow
//! list, so pushing never fails.
//!
//! Pushes try the ring first and fall back to appending to the list; pops
//! try the ring first and then take one entry from the list. The list is
//! intrusive (`FiberTask::queue_next`), FIFO, and only touched under the
//! mutex.

use crate::queue::Ring;
use crate::task::{FiberTask, TaskRef};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Capacity of the global ring; overflow beyond this spills to the list.
const GLOBAL_RING_CAPACITY: usize = if cfg!(loom) { 4 } else { 1024 };

struct Overflow {
    head: *mut FiberTask,
    tail: *mut FiberTask,
}

// Safety: the raw list pointers are only dereferenced under the mutex.
unsafe impl Send for Overflow {}

pub(crate) struct GlobalQueue {
    ring: Ring,
    overflow: Mutex<Overflow>,
    overflow_len: AtomicUsize,
}

// === impl GlobalQueue ===

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            ring: Ring::new(GLOBAL_RING_CAPACITY),
            overflow: Mutex::new(Overflow {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
            overflow_len: AtomicUsize::new(0),
        }
    }

    /// Approximate number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        self.ring.len() + self.overflow_len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a task; never fails. Ring first, overflow list second.
    pub(crate) fn push(&self, task: TaskRef) {
        let Err(task) = self.ring.push(task) else {
            return;
        };

        tracing::trace!(fiber = %task.task().id(), "global ring full, overflowing");

        let mut list = self.overflow.lock().expect("overflow mutex poisoned");
        let t = task.as_ptr();
        task.task().queue_next.store(ptr::null_mut(), Ordering::Relaxed);
        if list.tail.is_null() {
            list.head = t;
        } else {
            // Safety: list pointers are valid tasks, mutated under the mutex.
            unsafe { (*list.tail).queue_next.store(t, Ordering::Relaxed) };
        }
        list.tail = t;
        self.overflow_len.fetch_add(1, Ordering::Release);
    }

    /// Pops a task: ring first, then one entry from the overflow list.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        if let Some(task) = self.ring.pop() {
            return Some(task);
        }

        if self.overflow_len.load(Ordering::Acquire) == 0 {
            return None;
        }

        let mut list = self.overflow.lock().expect("overflow mutex poisoned");
        let head = list.head;
        let task = TaskRef::from_ptr(head)?;

        let next = task.task().queue_next.swap(ptr::null_mut(), Ordering::Relaxed);
        list.head = next;
        if next.is_null() {
            list.tail = ptr::null_mut();
        }
        self.overflow_len.fetch_sub(1, Ordering::Release);
        Some(task)
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
    fn overflow_and_reingestion() {
        let q = GlobalQueue::new();
        let total = GLOBAL_RING_CAPACITY as u64 + 10;

        for i in 0..total {
            q.push(leaked_task(i));
        }
        assert_eq!(q.len(), total as usize);

        // Ring entries drain first, then the overflow list in FIFO order.
        let mut got: Vec<u64> = Vec::new();
        while let Some(task) = q.pop() {
            got.push(task.task().id().as_u64());
        }
        assert_eq!(got.len(), total as usize);

        let ring_part = &got[..GLOBAL_RING_CAPACITY];
        let list_part = &got[GLOBAL_RING_CAPACITY..];
        assert!(ring_part.windows(2).all(|w| w[0] < w[1]));
        assert!(list_part.windows(2).all(|w| w[0] < w[1]));
    }

    #[cfg(not(loom))]
    #[test]
    fn empty_pop() {
        let q = GlobalQueue::new();
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}
