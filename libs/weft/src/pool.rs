// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber pool.
//!
//! Tasks (and their strands, including the mapped stacks) are allocated once
//! and recycled through a lock-free LIFO free list. A second intrusive list
//! tracks every task ever allocated, for diagnostics dumps and teardown. The
//! pool is the single owner of all task memory; it is freed only when the
//! scheduler's shared state drops.

use crate::task::{FiberId, FiberTask, TaskRef};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

pub(crate) struct FiberPool {
    /// LIFO free list through `FiberTask::pool_next`.
    free: AtomicPtr<FiberTask>,
    /// Every task ever allocated, through `FiberTask::all_next`.
    all: AtomicPtr<FiberTask>,
    next_id: AtomicU64,
    allocated: AtomicUsize,
}

// === impl FiberPool ===

impl FiberPool {
    pub(crate) fn new() -> Self {
        Self {
            free: AtomicPtr::new(ptr::null_mut()),
            all: AtomicPtr::new(ptr::null_mut()),
            next_id: AtomicU64::new(1),
            allocated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Pops a pooled task, or allocates a fresh one. The returned task is
    /// exclusively owned by the caller until it is spawned (control IDLE).
    pub(crate) fn acquire(&self) -> TaskRef {
        if let Some(task) = self.pop_free() {
            task.task().reset_for_spawn();
            return task;
        }
        self.allocate()
    }

    fn allocate(&self) -> TaskRef {
        let id = FiberId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Box::into_raw(Box::new(FiberTask::new(id)));
        self.allocated.fetch_add(1, Ordering::Relaxed);

        // Push onto the all-fibers list; write-once per task.
        let task_ref = TaskRef::from_ptr(task).expect("Box::into_raw returned null");
        let mut head = self.all.load(Ordering::Relaxed);
        loop {
            task_ref.task().all_next.store(head, Ordering::Relaxed);
            match self
                .all
                .compare_exchange_weak(head, task, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        tracing::trace!(fiber = %id, total = self.allocated(), "allocated fiber task");
        task_ref
    }

    /// Returns a reclaimed task (control already claimed back to IDLE) to
    /// the free list.
    pub(crate) fn release(&self, task: TaskRef) {
        // Drop a result that was never taken before the slot goes back on
        // the shelf.
        // Safety: the caller won the DONE -> IDLE claim, so it owns the task.
        unsafe { task.task().result.vacate() };

        let ptr = task.as_ptr();
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            task.task().pool_next.store(head, Ordering::Relaxed);
            match self
                .free
                .compare_exchange_weak(head, ptr, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    fn pop_free(&self) -> Option<TaskRef> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            let task = TaskRef::from_ptr(head)?;
            let next = task.task().pool_next.load(Ordering::Relaxed);
            match self
                .free
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    task.task().pool_next.store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(task);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Visits every task ever allocated. Entries are append-only, so the
    /// walk is safe concurrent with allocation.
    pub(crate) fn for_each(&self, mut f: impl FnMut(TaskRef)) {
        let mut cursor = self.all.load(Ordering::Acquire);
        while let Some(task) = TaskRef::from_ptr(cursor) {
            f(task);
            cursor = task.task().all_next.load(Ordering::Relaxed);
        }
    }

    /// Frees every task. Must only be called from the shared state's `Drop`,
    /// when no queue, handle, or worker can reference task memory anymore.
    pub(crate) unsafe fn drop_all(&self) {
        let mut cursor = self.all.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            // Safety: exclusive teardown access, each task allocated by Box.
            unsafe {
                let next = (*cursor).all_next.load(Ordering::Relaxed);
                (*cursor).result.vacate();
                drop(Box::from_raw(cursor));
                cursor = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::state::ControlState;

    #[cfg(not(loom))]
    #[test]
    fn reuse_is_lifo_and_preserves_id() {
        let pool = FiberPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.task().id(), b.task().id());
        assert_eq!(pool.allocated(), 2);

        let a_id = a.task().id();
        pool.release(a);
        let c = pool.acquire();
        // LIFO: the most recently released slot comes back first, with its
        // id intact.
        assert_eq!(c.task().id(), a_id);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(c.task().control.load(), ControlState::Idle);

        unsafe { pool.drop_all() };
    }

    #[cfg(not(loom))]
    #[test]
    fn all_list_sees_every_task() {
        let pool = FiberPool::new();
        for _ in 0..5 {
            pool.acquire();
        }
        let mut count = 0;
        pool.for_each(|_| count += 1);
        assert_eq!(count, 5);

        unsafe { pool.drop_all() };
    }
}
