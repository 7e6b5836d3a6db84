// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Joining fibers from threads and from other fibers.
//!
//! The join path escalates: a fast `done` check, thread-context spin phases,
//! waiter registration, and finally a context-dependent slow path. A fiber
//! joiner parks itself (its worker keeps scheduling other fibers); a thread
//! joiner blocks on the fiber's lazily created mutex+condvar pair. A fiber
//! join never burns its worker on a spin.

use crate::context;
use crate::error::JoinError;
use crate::scheduler::Shared;
use crate::task::state::ControlState;
use crate::task::{FiberId, FiberWaiter, TaskRef};
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering;
use crossbeam_utils::Backoff;
use std::sync::Arc;

/// An owned permission to join a fiber and take its result.
///
/// Dropping the handle without joining *detaches* the fiber: it keeps
/// running, and its task is recycled by the scheduler when it completes.
pub struct JoinHandle<T> {
    shared: Arc<Shared>,
    task: TaskRef,
    joined: bool,
    _marker: PhantomData<fn() -> T>,
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(shared: Arc<Shared>, task: TaskRef) -> Self {
        Self {
            shared,
            task,
            joined: false,
            _marker: PhantomData,
        }
    }

    /// The fiber's slot ID (stable across pool reuse, for diagnostics).
    pub fn id(&self) -> FiberId {
        self.task.task().id()
    }

    /// Returns `true` once user code has returned from the fiber.
    pub fn is_finished(&self) -> bool {
        self.task.task().done.load(Ordering::Acquire) != 0
    }

    /// A cloneable handle that can wake this fiber out of a park.
    pub fn unparker(&self) -> Unparker {
        Unparker {
            shared: Arc::clone(&self.shared),
            task: self.task,
        }
    }

    /// Waits for the fiber to finish and returns its result.
    ///
    /// Callable from a thread or from another fiber. A fiber caller parks
    /// cooperatively; a thread caller spins briefly, then blocks on the
    /// fiber's condvar.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError`] if the fiber panicked; the panic payload is
    /// preserved.
    pub fn join(mut self) -> Result<T, JoinError> {
        self.joined = true;
        let shared = Arc::clone(&self.shared);
        let task = self.task;
        let t = task.task();

        tracing::trace!(fiber = %t.id(), "join");

        if t.done.load(Ordering::Acquire) == 0 {
            let current = context::current();
            let in_fiber = current.is_some();

            if shared.config.debug_join {
                tracing::debug!(fiber = %t.id(), in_fiber, "join: target not done yet");
            }

            // Spin phases, thread context only. A fiber spinning here would
            // stall its worker instead of letting the target run.
            if !in_fiber {
                let mut found = false;
                for _ in 0..shared.config.spin_fast_iters {
                    if t.done.load(Ordering::Acquire) != 0 {
                        found = true;
                        break;
                    }
                    core::hint::spin_loop();
                }
                if !found {
                    for _ in 0..shared.config.spin_yield_iters {
                        if t.done.load(Ordering::Acquire) != 0 {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }

            if t.done.load(Ordering::SeqCst) == 0 {
                t.join.waiters.fetch_add(1, Ordering::SeqCst);

                if t.done.load(Ordering::SeqCst) == 0 {
                    match current {
                        Some(me) => Self::join_slow_fiber(task, me),
                        None => Self::join_slow_thread(&shared, task),
                    }
                }

                t.join.waiters.fetch_sub(1, Ordering::SeqCst);
            }
        }

        // The stack is released (control stored DONE) promptly after `done`
        // is set; wait it out so reclaiming cannot race the worker.
        let backoff = Backoff::new();
        while t.control.load() != ControlState::Done {
            backoff.snooze();
        }

        // Safety: `done` then `control == DONE` were observed, we are the
        // single joiner, and `T` matches the spawn that produced this handle.
        let result: std::thread::Result<T> = unsafe { t.result.take() };

        // Reclaim the slot for the pool. The claim cannot fail: detach is
        // excluded (the handle is consumed) and there is no other joiner.
        let reclaimed = t.control.try_reclaim(shared.now());
        debug_assert!(reclaimed);
        shared.release_task(task);

        result.map_err(JoinError::panicked)
    }

    /// Fiber-context slow path: register as the single parked waiter, then
    /// park on `done`.
    fn join_slow_fiber(task: TaskRef, me: context::Current) {
        let t = task.task();

        let mut wait = t.join.lock.lock();
        // Re-check under the spinlock: the exit path takes the same lock
        // before it reads the waiter slot.
        if t.done.load(Ordering::SeqCst) != 0 {
            return;
        }
        debug_assert!(wait.fiber_waiter.is_none(), "fiber joined twice");
        wait.fiber_waiter = Some(FiberWaiter {
            shared: me.shared,
            task: me.task,
        });
        drop(wait);

        while t.done.load(Ordering::SeqCst) == 0 {
            context::park_while(&t.done, 0, "join");
        }
    }

    /// Thread-context slow path: lazily create the condvar pair, lock its
    /// mutex *before* releasing the join spinlock so the completion broadcast
    /// cannot slip between the two, then block.
    fn join_slow_thread(shared: &Arc<Shared>, task: TaskRef) {
        let t = task.task();

        let mut wait = t.join.lock.lock();
        if t.done.load(Ordering::SeqCst) != 0 {
            return;
        }
        let cv = Arc::clone(
            wait.thread_cv
                .get_or_insert_with(|| Arc::new(crate::task::ThreadWait::new())),
        );
        let mut signalled = cv.mutex.lock().expect("join mutex poisoned");
        drop(wait);

        // The target fiber needs a worker to run on while this thread blocks.
        shared.wake.wake_one();

        shared.blocked_threads.fetch_add(1, Ordering::SeqCst);
        while !*signalled && t.done.load(Ordering::SeqCst) == 0 {
            signalled = cv.cv.wait(signalled).expect("join mutex poisoned");
        }
        shared.blocked_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        let t = self.task.task();

        // Detach latch, the mirror image of the park/unpark Dekker pair: we
        // store `detached` then read the control word; the completion path
        // stores DONE then reads `detached`. At least one side observes the
        // other, and the DONE -> IDLE claim picks a single reclaimer.
        t.detached.store(true, Ordering::SeqCst);
        if t.control.load() == ControlState::Done && t.control.try_reclaim(self.shared.now()) {
            self.shared.release_task(self.task);
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("fiber", &self.task.task().id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// A cloneable handle that wakes a parked fiber.
///
/// Unparking is level-triggered: if the fiber is not currently parked the
/// wake is latched and consumed by its next park attempt. Unparking a fiber
/// that already completed is a no-op. After the fiber's slot is recycled an
/// `Unparker` may wake the slot's next occupant early; parks tolerate such
/// spurious wakes by re-checking their condition.
pub struct Unparker {
    shared: Arc<Shared>,
    task: TaskRef,
}

// === impl Unparker ===

impl Unparker {
    pub(crate) fn new(shared: Arc<Shared>, task: TaskRef) -> Self {
        Self { shared, task }
    }

    /// Wakes the fiber if it is parked; latches the wake otherwise.
    pub fn unpark(&self) {
        self.shared.unpark_ref(self.task);
    }

    /// The fiber's slot ID.
    pub fn id(&self) -> FiberId {
        self.task.task().id()
    }
}

impl Clone for Unparker {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            task: self.task,
        }
    }
}

impl fmt::Debug for Unparker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unparker")
            .field("fiber", &self.task.task().id())
            .finish()
    }
}
