// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber-side operation surface.
//!
//! While a worker executes a fiber it publishes the fiber's identity in a
//! thread-local; the free functions here read it, so user code inside a
//! fiber can suspend itself without holding any scheduler handle. All of
//! them panic (or return `None`/`false`) when called from a plain thread.

use crate::error::SpawnError;
use crate::scheduler::{self, Shared};
use crate::task::{FiberId, JoinHandle, ParkCond, ParkSite, Switch, TaskRef, Unparker};
use core::cell::Cell;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

/// Identity of the fiber currently executing on this thread.
#[derive(Clone, Copy)]
pub(crate) struct Current {
    pub(crate) shared: *const Shared,
    /// Index of the executing base worker, or [`crate::task::NO_WORKER`] on
    /// a replacement worker.
    pub(crate) worker: usize,
    pub(crate) task: TaskRef,
}

thread_local! {
    static CURRENT: Cell<Option<Current>> = const { Cell::new(None) };
}

/// RAII guard installed by a worker around a fiber resume.
pub(crate) struct Entered(Option<Current>);

pub(crate) fn enter(ctx: Current) -> Entered {
    Entered(CURRENT.with(|c| c.replace(Some(ctx))))
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.0.take()));
    }
}

pub(crate) fn current() -> Option<Current> {
    CURRENT.with(Cell::get)
}

fn expect_current(what: &str) -> Current {
    current().unwrap_or_else(|| panic!("{what} called outside of a fiber"))
}

fn shared(ctx: &Current) -> &Shared {
    // Safety: the scheduler outlives every fiber it executes; workers hold
    // an Arc on it for the whole resume.
    unsafe { &*ctx.shared }
}

/// Suspends the current fiber, handing `switch` to the worker trampoline.
fn suspend(task: TaskRef, switch: Switch) {
    let yielder = task.task().yielder.load(Ordering::Acquire);
    debug_assert!(!yielder.is_null(), "suspending a fiber that never entered");
    // Safety: the yielder slot lives on the fiber's own stack for the
    // lifetime of the current binding, and we *are* that fiber.
    unsafe {
        (*yielder).suspend(switch);
    }
}

/// Returns `true` when called from inside a fiber.
pub fn in_fiber() -> bool {
    current().is_some()
}

/// The ID of the current fiber, if any.
pub fn current_id() -> Option<FiberId> {
    current().map(|c| c.task.task().id())
}

/// An [`Unparker`] for the current fiber, if any.
///
/// The canonical pattern for parking on an external event: hand this to the
/// event source, then [`park`]/[`park_while`].
pub fn current_unparker() -> Option<Unparker> {
    current().map(|c| {
        // Safety: upgrading the worker's own Arc, see `shared`.
        let shared = unsafe { scheduler::arc_from_ptr(c.shared) };
        Unparker::new(shared, c.task)
    })
}

/// Spawns a fiber onto the scheduler of the *currently running* fiber.
///
/// # Panics
///
/// Panics when called outside of a fiber, or when the spawn fails; see
/// [`try_spawn`] for the fallible variant.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    try_spawn(f).expect("spawn failed")
}

/// Fallible [`spawn`].
///
/// # Errors
///
/// Anything [`Scheduler::try_spawn`](crate::Scheduler::try_spawn) returns.
///
/// # Panics
///
/// Panics when called outside of a fiber.
pub fn try_spawn<F, T>(f: F) -> Result<JoinHandle<T>, SpawnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let ctx = expect_current("spawn");
    // Safety: upgrading the worker's own Arc, see `shared`.
    let shared = unsafe { scheduler::arc_from_ptr(ctx.shared) };
    scheduler::spawn_inner(&shared, f)
}

/// Yields the current fiber back to its worker's local queue.
///
/// The fiber stays runnable; this only lets other queued fibers run first.
#[track_caller]
pub fn yield_now() {
    let ctx = expect_current("yield_now");
    suspend(ctx.task, Switch::YieldLocal);
}

/// Yields the current fiber to the global queue, donating it to whichever
/// worker polls next. Useful to shed work from a loaded worker.
#[track_caller]
pub fn yield_global() {
    let ctx = expect_current("yield_global");
    suspend(ctx.task, Switch::YieldGlobal);
}

/// Puts the current fiber to sleep for at least `duration`.
///
/// Sleeping fibers cost nothing on the workers; expired sleepers are
/// re-enqueued by sysmon within about a millisecond of their deadline.
pub fn sleep(duration: Duration) {
    let ctx = expect_current("sleep");
    let deadline = shared(&ctx)
        .now()
        .saturating_add(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));
    suspend(ctx.task, Switch::Sleep { deadline });
}

/// [`sleep`] with a millisecond argument.
pub fn sleep_ms(millis: u32) {
    sleep(Duration::from_millis(u64::from(millis)));
}

/// Parks the current fiber until some other party unparks it.
///
/// `reason` shows up in stall and deadlock dumps. If an unpark was latched
/// while the fiber was running, the park returns immediately; spurious
/// returns are possible and callers must re-check their own condition.
#[track_caller]
pub fn park(reason: &'static str) {
    park_inner(None, reason, Location::caller());
}

/// Parks the current fiber as long as `*flag == expected`.
///
/// The condition is re-checked on the worker after the fiber's stack is
/// quiescent, and once more after the park committed, so a concurrent
/// `flag` flip plus [`Unparker::unpark`] can never be lost.
#[track_caller]
pub fn park_while(flag: &AtomicU32, expected: u32, reason: &'static str) {
    park_inner(
        Some(ParkCond {
            flag: ptr::from_ref(flag),
            expected,
        }),
        reason,
        Location::caller(),
    );
}

fn park_inner(cond: Option<ParkCond>, reason: &'static str, location: &'static Location<'static>) {
    let ctx = expect_current("park");
    let t = ctx.task.task();

    // Fast path: consume a latched unpark without suspending.
    if t.pending_unpark.swap(false, Ordering::SeqCst) {
        return;
    }
    // Fast path: the condition already changed.
    if let Some(cond) = &cond {
        // Safety: `flag` is a live borrow held by our caller.
        if unsafe { !cond.holds(Ordering::SeqCst) } {
            return;
        }
    }

    suspend(
        ctx.task,
        Switch::Park {
            cond,
            site: ParkSite { reason, location },
        },
    );

    // Resumed: clear the debug fields.
    *t.park_site.lock() = None;
    t.park_obj.store(ptr::null_mut(), Ordering::Relaxed);
}

/// Drops a latched unpark on the current fiber, if any.
///
/// For protocols that know a latched wake is stale (e.g. after consuming a
/// channel message through another path).
pub fn clear_pending_unpark() {
    let ctx = expect_current("clear_pending_unpark");
    ctx.task
        .task()
        .pending_unpark
        .store(false, Ordering::SeqCst);
}

/// Records the object the current fiber is about to park on, for
/// diagnostics dumps. The pointer is never dereferenced.
pub fn set_park_obj(obj: *const ()) {
    let ctx = expect_current("set_park_obj");
    ctx.task.task().park_obj.store(obj.cast_mut(), Ordering::Relaxed);
}
