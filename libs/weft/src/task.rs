// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber task: per-fiber metadata and the atomic lifecycle/ownership
//! state machine.
//!
//! Tasks are owned by their scheduler's pool for the whole life of the
//! scheduler and are recycled through a free list. Everything reachable from
//! the outside ([`JoinHandle`](crate::JoinHandle), [`Unparker`](crate::Unparker))
//! holds only a [`TaskRef`] identity plus an `Arc` on the scheduler that
//! keeps the arena alive.

pub(crate) mod id;
pub(crate) mod join;
pub(crate) mod state;

use crate::loom::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::panic::Location;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex};
use strand::{Strand, Yielder};

pub use id::FiberId;
pub use join::{JoinHandle, Unparker};

use state::ControlWord;

/// The strand instantiation used by the scheduler: nothing flows in on
/// resume, a [`Switch`] flows out on every suspension, nothing is returned
/// (results travel through the task's [`ResultCell`]).
pub(crate) type Co = Strand<(), Switch, ()>;
pub(crate) type CoYielder = Yielder<(), Switch>;

/// Sentinel for [`FiberTask::last_worker`]: the fiber has no affinity yet.
pub(crate) const NO_WORKER: usize = usize::MAX;

/// What a fiber asks its worker to do with it after a suspension. Travels as
/// the strand's yield value and is read exactly once by the worker
/// trampoline, which commits it on a quiescent stack.
pub(crate) enum Switch {
    /// Suspend until unparked, unless `cond` no longer holds or a pending
    /// unpark is latched.
    Park {
        cond: Option<ParkCond>,
        site: ParkSite,
    },
    /// Re-enqueue on the current worker's local queue.
    YieldLocal,
    /// Re-enqueue on the global queue.
    YieldGlobal,
    /// Move to the sleep queue until `deadline` (scheduler-epoch nanos).
    Sleep { deadline: u64 },
}

// Safety: the raw condition pointer is only dereferenced by the worker that
// owns the suspended fiber, and it points at memory the parked fiber's stack
// keeps borrowed for the duration of the park.
unsafe impl Send for Switch {}

/// A conditional-park predicate: park only while `*flag == expected`.
#[derive(Clone, Copy)]
pub(crate) struct ParkCond {
    pub(crate) flag: *const core::sync::atomic::AtomicU32,
    pub(crate) expected: u32,
}

impl ParkCond {
    /// Re-evaluates the condition.
    ///
    /// # Safety
    ///
    /// The flag must still be live; guaranteed while the owning fiber is
    /// suspended in `park_while`.
    pub(crate) unsafe fn holds(&self, order: core::sync::atomic::Ordering) -> bool {
        // Safety: ensured by caller
        unsafe { (*self.flag).load(order) == self.expected }
    }
}

/// Debug identity of a park: why and where.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ParkSite {
    pub(crate) reason: &'static str,
    pub(crate) location: &'static Location<'static>,
}

impl fmt::Display for ParkSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.reason, self.location)
    }
}

/// Size of the inline result buffer. Return values that fit (and don't need
/// more than 16-byte alignment) are passed through the task without touching
/// the heap.
pub(crate) const INLINE_RESULT_SIZE: usize = 48;

#[repr(C, align(16))]
struct InlineBuf([MaybeUninit<u8>; INLINE_RESULT_SIZE]);

/// The result slot of a fiber.
///
/// Access is synchronized entirely by the lifecycle protocol:
///
/// 1. The fiber writes with [`put`](Self::put) before `done` is published.
/// 2. A joiner reads with [`take`](Self::take) after observing `done` (and
///    `control == DONE`), which happens-after the write.
/// 3. The pool calls [`vacate`](Self::vacate) on a slot it owns exclusively
///    to drop a result that was never taken (detached fibers).
pub(crate) struct ResultCell {
    inline: UnsafeCell<InlineBuf>,
    spill: UnsafeCell<*mut u8>,
    drop_fn: UnsafeCell<Option<unsafe fn(&ResultCell)>>,
}

// Safety: see the access protocol above; the cell itself is inert data.
unsafe impl Send for ResultCell {}
unsafe impl Sync for ResultCell {}

// === impl ResultCell ===

impl ResultCell {
    fn new() -> Self {
        Self {
            inline: UnsafeCell::new(InlineBuf([MaybeUninit::uninit(); INLINE_RESULT_SIZE])),
            spill: UnsafeCell::new(ptr::null_mut()),
            drop_fn: UnsafeCell::new(None),
        }
    }

    const fn is_inline<T>() -> bool {
        size_of::<T>() <= INLINE_RESULT_SIZE && align_of::<T>() <= align_of::<InlineBuf>()
    }

    /// Stores `value`, inline when it fits.
    ///
    /// # Safety
    ///
    /// Caller must be the running fiber, before publishing `done`; the cell
    /// must be vacant.
    pub(crate) unsafe fn put<T>(&self, value: T) {
        // Safety: exclusive access per the protocol above.
        unsafe {
            if Self::is_inline::<T>() {
                self.inline
                    .with_mut(|buf| ptr::write(buf.cast::<T>(), value));
                self.drop_fn.with_mut(|f| *f = Some(Self::drop_inline::<T>));
            } else {
                let boxed = Box::into_raw(Box::new(value));
                self.spill.with_mut(|s| *s = boxed.cast::<u8>());
                self.drop_fn.with_mut(|f| *f = Some(Self::drop_spill::<T>));
            }
        }
    }

    /// Takes the stored value.
    ///
    /// # Safety
    ///
    /// Caller must have observed completion (`done`, then `control == DONE`),
    /// `T` must be the type passed to [`put`](Self::put), and the cell must
    /// be taken at most once.
    pub(crate) unsafe fn take<T>(&self) -> T {
        // Safety: exclusive access per the protocol above.
        unsafe {
            self.drop_fn.with_mut(|f| *f = None);
            if Self::is_inline::<T>() {
                self.inline.with(|buf| ptr::read(buf.cast::<T>()))
            } else {
                let spilled = self.spill.with_mut(|s| {
                    let p = *s;
                    *s = ptr::null_mut();
                    p
                });
                *Box::from_raw(spilled.cast::<T>())
            }
        }
    }

    /// Drops a stored-but-never-taken result, if any.
    ///
    /// # Safety
    ///
    /// Caller must own the task exclusively (pool reset path).
    pub(crate) unsafe fn vacate(&self) {
        // Safety: exclusive access per the protocol above.
        unsafe {
            if let Some(drop_fn) = self.drop_fn.with_mut(|f| (*f).take()) {
                drop_fn(self);
            }
        }
    }

    unsafe fn drop_inline<T>(cell: &ResultCell) {
        // Safety: only installed by put::<T> for an inline T.
        unsafe {
            cell.inline
                .with_mut(|buf| ptr::drop_in_place(buf.cast::<T>()));
        }
    }

    unsafe fn drop_spill<T>(cell: &ResultCell) {
        // Safety: only installed by put::<T> for a spilled T.
        unsafe {
            let spilled = cell.spill.with_mut(|s| {
                let p = *s;
                *s = ptr::null_mut();
                p
            });
            drop(Box::from_raw(spilled.cast::<T>()));
        }
    }
}

/// Join synchronisation state of one fiber.
pub(crate) struct JoinSync {
    /// Number of registered waiters, for accounting and diagnostics.
    pub(crate) waiters: AtomicUsize,
    /// Spinlock guarding the waiter slot and the lazily created condvar.
    pub(crate) lock: spin::Mutex<JoinWait>,
}

pub(crate) struct JoinWait {
    /// At most one fiber may park itself waiting for this fiber.
    pub(crate) fiber_waiter: Option<FiberWaiter>,
    /// Lazily created on first thread-context join. The allocation is
    /// preserved across pool reuse; only the signalled flag is reset.
    pub(crate) thread_cv: Option<Arc<ThreadWait>>,
}

/// Identity of a parked fiber joiner: the task plus the scheduler that must
/// re-enqueue it (joins may cross scheduler instances).
pub(crate) struct FiberWaiter {
    pub(crate) shared: *const crate::scheduler::Shared,
    pub(crate) task: TaskRef,
}

// Safety: the shared pointer is only dereferenced to unpark, and the waiting
// fiber keeps its scheduler alive for the duration of the join.
unsafe impl Send for FiberWaiter {}

/// The mutex+condvar pair thread-context joiners block on.
pub(crate) struct ThreadWait {
    pub(crate) mutex: Mutex<bool>,
    pub(crate) cv: Condvar,
}

// === impl ThreadWait ===

impl ThreadWait {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Marks the fiber complete and wakes all blocked joiners.
    pub(crate) fn signal(&self) {
        let mut signalled = self.mutex.lock().expect("join mutex poisoned");
        *signalled = true;
        drop(signalled);
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.mutex.lock().expect("join mutex poisoned") = false;
    }
}

/// The central per-fiber entity.
pub(crate) struct FiberTask {
    /// Lifecycle + ownership state machine.
    pub(crate) control: ControlWord,
    id: FiberId,
    /// Set the instant user code returns, under the join spinlock.
    pub(crate) done: AtomicU32,
    /// Unpark latch: set by unparkers that caught the fiber outside PARKED,
    /// consumed by the next park attempt. One half of the Dekker pair.
    pub(crate) pending_unpark: AtomicBool,
    /// Set when the `JoinHandle` was dropped without joining; the completion
    /// path recycles the task itself.
    pub(crate) detached: AtomicBool,
    /// Monotonic wakeup deadline while on the sleep queue.
    pub(crate) sleep_deadline: AtomicU64,
    /// Affinity hint: the worker that last resumed this fiber.
    pub(crate) last_worker: AtomicUsize,
    /// Opaque object this fiber is parked on, for diagnostics dumps.
    pub(crate) park_obj: AtomicPtr<()>,
    /// Address of the strand's yielder slot; fixed for the lifetime of one
    /// binding, published at fiber entry so suspension helpers can reach it
    /// from whichever worker currently runs the fiber.
    pub(crate) yielder: AtomicPtr<CoYielder>,
    /// The coroutine. Retained (with its stack) across pool reuse.
    ///
    /// Exclusive access follows the control word: the spawning caller may
    /// touch it while the task is IDLE-from-pool, the owning worker while it
    /// holds OWNED. No other access is allowed.
    strand: UnsafeCell<Option<Co>>,
    pub(crate) result: ResultCell,
    pub(crate) join: JoinSync,
    /// Why/where the fiber parked; written by the trampoline before the park
    /// commit, read by stall and deadlock dumps.
    pub(crate) park_site: spin::Mutex<Option<ParkSite>>,

    /// Free-list link (pool, LIFO CAS stack).
    pub(crate) pool_next: AtomicPtr<FiberTask>,
    /// Global-queue overflow-list link, guarded by the overflow mutex.
    pub(crate) queue_next: AtomicPtr<FiberTask>,
    /// Sleep-queue link, guarded by the sleep mutex.
    pub(crate) sleep_next: AtomicPtr<FiberTask>,
    /// All-fibers diagnostics list link; written once at allocation.
    pub(crate) all_next: AtomicPtr<FiberTask>,
}

// Safety: all mutable state is either atomic or guarded by the control-word
// ownership protocol documented on the fields.
unsafe impl Send for FiberTask {}
unsafe impl Sync for FiberTask {}

// === impl FiberTask ===

impl FiberTask {
    pub(crate) fn new(id: FiberId) -> Self {
        Self {
            control: ControlWord::new(),
            id,
            done: AtomicU32::new(0),
            pending_unpark: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            sleep_deadline: AtomicU64::new(0),
            last_worker: AtomicUsize::new(NO_WORKER),
            park_obj: AtomicPtr::new(ptr::null_mut()),
            yielder: AtomicPtr::new(ptr::null_mut()),
            strand: UnsafeCell::new(None),
            result: ResultCell::new(),
            join: JoinSync {
                waiters: AtomicUsize::new(0),
                lock: spin::Mutex::new(JoinWait {
                    fiber_waiter: None,
                    thread_cv: None,
                }),
            },
            park_site: spin::Mutex::new(None),
            pool_next: AtomicPtr::new(ptr::null_mut()),
            queue_next: AtomicPtr::new(ptr::null_mut()),
            sleep_next: AtomicPtr::new(ptr::null_mut()),
            all_next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Grants access to the coroutine slot.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive right documented on the field:
    /// either OWNED of this fiber, or IDLE-from-pool possession.
    pub(crate) unsafe fn with_strand<R>(&self, f: impl FnOnce(&mut Option<Co>) -> R) -> R {
        // Safety: ensured by caller
        self.strand.with_mut(|s| f(unsafe { &mut *s }))
    }

    /// Resets runtime state for a fresh spawn. The strand (with its stack),
    /// the fiber id and the join condvar allocation are preserved.
    ///
    /// Caller must own the task exclusively (pool acquire path).
    pub(crate) fn reset_for_spawn(&self) {
        use core::sync::atomic::Ordering::Relaxed;

        // Safety: exclusive possession per the caller contract.
        unsafe { self.result.vacate() };

        self.done.store(0, Relaxed);
        self.pending_unpark.store(false, Relaxed);
        self.detached.store(false, Relaxed);
        self.sleep_deadline.store(0, Relaxed);
        self.last_worker.store(NO_WORKER, Relaxed);
        self.park_obj.store(ptr::null_mut(), Relaxed);
        self.yielder.store(ptr::null_mut(), Relaxed);
        *self.park_site.lock() = None;

        let mut wait = self.join.lock.lock();
        debug_assert!(wait.fiber_waiter.is_none());
        if let Some(cv) = wait.thread_cv.as_ref() {
            cv.reset();
        }
        drop(wait);
    }
}

impl fmt::Debug for FiberTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberTask")
            .field("id", &self.id)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

/// A copyable identity handle to a [`FiberTask`].
///
/// The scheduler's pool owns all tasks for the scheduler's lifetime, so a
/// `TaskRef` is valid as long as the `Shared` it came from is alive; public
/// handles pair it with an `Arc` on the scheduler to guarantee that.
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct TaskRef(NonNull<FiberTask>);

// Safety: `FiberTask` is Sync and the pointee outlives all refs (arena).
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn from_ptr(ptr: *mut FiberTask) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub(crate) fn as_ptr(self) -> *mut FiberTask {
        self.0.as_ptr()
    }

    pub(crate) fn task(&self) -> &FiberTask {
        // Safety: arena ownership, see type docs.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.task().id())
            .field("addr", &self.0)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn result_cell_inline_round_trip() {
        let cell = ResultCell::new();
        // Safety: single-threaded test upholding the access protocol.
        unsafe {
            cell.put(41_u64);
            assert_eq!(cell.take::<u64>(), 41);
        }
    }

    #[test]
    fn result_cell_spill_round_trip() {
        let cell = ResultCell::new();
        let big = [7_u8; 128];
        assert!(!ResultCell::is_inline::<[u8; 128]>());
        // Safety: single-threaded test upholding the access protocol.
        unsafe {
            cell.put(big);
            assert_eq!(cell.take::<[u8; 128]>(), big);
        }
    }

    #[test]
    fn result_cell_vacate_drops() {
        use std::sync::Arc as StdArc;

        let witness = StdArc::new(());
        let cell = ResultCell::new();
        // Safety: single-threaded test upholding the access protocol.
        unsafe {
            cell.put(StdArc::clone(&witness));
            assert_eq!(StdArc::strong_count(&witness), 2);
            cell.vacate();
            assert_eq!(StdArc::strong_count(&witness), 1);
            // vacating an empty cell is a no-op
            cell.vacate();
        }
    }

    #[test]
    fn inline_classification() {
        assert!(ResultCell::is_inline::<u8>());
        assert!(ResultCell::is_inline::<[u8; INLINE_RESULT_SIZE]>());
        assert!(!ResultCell::is_inline::<[u8; INLINE_RESULT_SIZE + 1]>());
        assert!(ResultCell::is_inline::<std::thread::Result<u32>>());
    }
}
