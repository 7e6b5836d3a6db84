// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sleep queue.
//!
//! Sleeping fibers sit on a single mutex-guarded intrusive list, ordered by
//! insertion. Sysmon (and workers about to sleep) walk the list and move
//! fibers whose deadline has passed to the global queue. The list is short
//! and the walk is O(n); the simplicity beats a timer wheel at the scale the
//! scheduler runs timers (coarse fiber sleeps, not I/O timeouts).

use crate::queue::GlobalQueue;
use crate::task::{FiberTask, TaskRef};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct SleepQueue {
    head: Mutex<SleepList>,
    len: AtomicUsize,
}

struct SleepList(*mut FiberTask);

// Safety: the raw list pointer is only dereferenced under the mutex.
unsafe impl Send for SleepList {}

// === impl SleepQueue ===

impl SleepQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: Mutex::new(SleepList(ptr::null_mut())),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Adds a fiber whose `sleep_deadline` is already set. Prepends; order
    /// does not matter, the drain walks the whole list.
    pub(crate) fn push(&self, task: TaskRef) {
        let mut list = self.head.lock().expect("sleep mutex poisoned");
        task.task().sleep_next.store(list.0, Ordering::Relaxed);
        list.0 = task.as_ptr();
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Moves every fiber whose deadline is at or before `now` to the global
    /// queue. Returns how many were moved so the caller can wake sleepers.
    pub(crate) fn drain(&self, now: u64, global: &GlobalQueue) -> usize {
        if self.len.load(Ordering::Acquire) == 0 {
            return 0;
        }

        let mut list = self.head.lock().expect("sleep mutex poisoned");
        let mut moved = 0;

        let mut prev: *mut FiberTask = ptr::null_mut();
        let mut cursor = list.0;

        while let Some(task) = TaskRef::from_ptr(cursor) {
            let t = task.task();
            let next = t.sleep_next.load(Ordering::Relaxed);

            if t.sleep_deadline.load(Ordering::Acquire) <= now {
                // Unlink and re-enqueue.
                if prev.is_null() {
                    list.0 = next;
                } else {
                    // Safety: `prev` is a list node; we hold the mutex.
                    unsafe { (*prev).sleep_next.store(next, Ordering::Relaxed) };
                }
                t.sleep_next.store(ptr::null_mut(), Ordering::Relaxed);
                global.push(task);
                moved += 1;
            } else {
                prev = cursor;
            }

            cursor = next;
        }

        if moved > 0 {
            self.len.fetch_sub(moved, Ordering::Release);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FiberId, FiberTask};

    fn sleeping_task(id: u64, deadline: u64) -> TaskRef {
        let task = TaskRef::from_ptr(Box::into_raw(Box::new(FiberTask::new(FiberId::from_raw(
            id,
        )))))
        .unwrap();
        task.task().sleep_deadline.store(deadline, Ordering::Relaxed);
        task
    }

    #[cfg(not(loom))]
    #[test]
    fn drains_only_expired() {
        let sleep = SleepQueue::new();
        let global = GlobalQueue::new();

        sleep.push(sleeping_task(1, 100));
        sleep.push(sleeping_task(2, 300));
        sleep.push(sleeping_task(3, 200));
        assert_eq!(sleep.len(), 3);

        assert_eq!(sleep.drain(50, &global), 0);
        assert_eq!(sleep.drain(200, &global), 2);
        assert_eq!(sleep.len(), 1);
        assert_eq!(global.len(), 2);

        assert_eq!(sleep.drain(1000, &global), 1);
        assert_eq!(sleep.len(), 0);
        assert_eq!(global.len(), 3);
    }

    #[cfg(not(loom))]
    #[test]
    fn drain_empty_is_cheap() {
        let sleep = SleepQueue::new();
        let global = GlobalQueue::new();
        assert_eq!(sleep.drain(u64::MAX, &global), 0);
    }
}
