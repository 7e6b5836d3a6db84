// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler: process-wide state, spawn, unpark, deadlock detection and
//! shutdown.
//!
//! A [`Scheduler`] owns N base worker threads, an optional sysmon thread and
//! the shared state ([`Shared`]) everything else hangs off: per-worker
//! queues, the global queue, the sleep queue, the fiber pool, the wake
//! primitive and the counters. Handles ([`JoinHandle`], [`Unparker`]) pin
//! the shared state with an `Arc`, so the task arena outlives everything
//! that can name a fiber.

use crate::clock;
use crate::config::{
    Config, DEADLOCK_PERSIST_NANOS, INBOX_OVERLOADED, ORPHAN_THRESHOLD_NANOS,
};
use crate::context;
use crate::error::SpawnError;
use crate::queue::{GlobalQueue, LocalQueue, Ring, SleepQueue};
use crate::stats::Stats;
use crate::task::state::ControlState;
use crate::task::{Co, CoYielder, JoinHandle, NO_WORKER, TaskRef};
use crate::wake::WakeCounter;
use crate::{sysmon, worker};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use crossbeam_utils::CachePadded;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::time::Instant;
use strand::{Strand, StrandStack};

/// Capacity of a per-worker inbox.
const INBOX_CAPACITY: usize = if cfg!(loom) { 4 } else { 256 };

/// Per-worker state reachable by every thread: the stealable queues and the
/// heartbeat.
pub(crate) struct WorkerShared {
    pub(crate) local: LocalQueue,
    pub(crate) inbox: Ring,
    /// Scheduler-epoch nanos of the worker's last liveness beat. Cache-line
    /// isolated: sysmon reads all of these in a tight loop.
    pub(crate) heartbeat: CachePadded<AtomicU64>,
}

// === impl WorkerShared ===

impl WorkerShared {
    fn new() -> Self {
        Self {
            local: LocalQueue::new(),
            inbox: Ring::new(INBOX_CAPACITY),
            heartbeat: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// State shared by workers, sysmon, handles and the owning [`Scheduler`].
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) workers: Box<[WorkerShared]>,
    pub(crate) global: GlobalQueue,
    pub(crate) sleep: SleepQueue,
    pub(crate) pool: crate::pool::FiberPool,
    pub(crate) wake: WakeCounter,
    pub(crate) running: AtomicBool,
    pub(crate) stats: Stats,
    epoch: Instant,
    pub(crate) cores: usize,

    /// Fibers spawned whose user code has not returned yet.
    pub(crate) pending: CachePadded<AtomicUsize>,
    /// Base workers in the fast/yield spin phases of the idle path.
    pub(crate) spinning: CachePadded<AtomicUsize>,
    /// Base workers at or past the sleeping transition of the idle path.
    pub(crate) sleeping: CachePadded<AtomicUsize>,
    /// Fibers whose control word is PARKED.
    pub(crate) parked: CachePadded<AtomicUsize>,
    /// OS threads blocked in a thread-context join.
    pub(crate) blocked_threads: CachePadded<AtomicUsize>,
    /// Live replacement workers.
    pub(crate) temp_workers: CachePadded<AtomicUsize>,

    /// First time the deadlock condition was observed, 0 when clear.
    pub(crate) deadlock_since: AtomicU64,
    pub(crate) deadlock_reported: AtomicBool,
    pub(crate) last_replacement_spawn: AtomicU64,
    pub(crate) replacement_seq: AtomicUsize,
    /// Round-robin cursor for the spawn-path inbox fallback.
    rr_inbox: AtomicUsize,
    inbox_overflow_warned: AtomicBool,
}

assert_impl_all!(Shared: Send, Sync);

// === impl Shared ===

impl Shared {
    /// Monotonic nanoseconds since this scheduler was created.
    pub(crate) fn now(&self) -> u64 {
        clock::nanos_since(self.epoch)
    }

    /// Whether any run queue currently holds a runnable fiber.
    pub(crate) fn runnable_work(&self) -> bool {
        !self.global.is_empty()
            || self
                .workers
                .iter()
                .any(|w| !w.local.is_empty() || !w.inbox.is_empty())
    }

    /// Pushes into a specific worker's inbox, falling back to the global
    /// queue when full (spilling is normal under load, not an error).
    pub(crate) fn push_inbox(&self, wid: usize, task: TaskRef) {
        if let Err(task) = self.workers[wid].inbox.push(task) {
            Stats::bump(&self.stats.inbox_overflows);
            if !self.inbox_overflow_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(worker = wid, "inbox full, overflowing to global queue");
            }
            if self.config.debug_inbox {
                tracing::debug!(worker = wid, "inbox overflow");
            }
            self.global.push(task);
        }
    }

    /// Unparks a fiber: PARKED -> QUEUED plus re-enqueue, or latch the wake
    /// for the fiber's next park attempt.
    pub(crate) fn unpark_ref(&self, task: TaskRef) {
        let t = task.task();
        loop {
            match t.control.load() {
                ControlState::Parked => {
                    if t.control.try_unpark(self.now()) {
                        self.parked.fetch_sub(1, Ordering::SeqCst);
                        Stats::bump(&self.stats.unparks);
                        if self.config.debug_wake {
                            tracing::debug!(fiber = %t.id(), "unpark: re-enqueue");
                        }
                        self.enqueue_unparked(task);
                        return;
                    }
                    // Lost to a concurrent unparker; re-read the state.
                }
                ControlState::Owned(_) | ControlState::Queued => {
                    t.pending_unpark.store(true, Ordering::SeqCst);
                    // Dekker re-check: the park may have committed between
                    // the state read above and the latch store. If it did,
                    // loop and take the PARKED path; a leftover latch is
                    // consumed harmlessly by the next park.
                    if t.control.load() == ControlState::Parked {
                        continue;
                    }
                    if self.config.debug_wake {
                        tracing::debug!(fiber = %t.id(), "unpark: latched");
                    }
                    return;
                }
                // Completed or pooled: nothing to wake.
                ControlState::Done | ControlState::Idle => return,
            }
        }
    }

    /// Affinity-aware enqueue of a freshly unparked fiber.
    pub(crate) fn enqueue_unparked(&self, task: TaskRef) {
        let wid = task.task().last_worker.load(Ordering::Relaxed);
        let now = self.now();

        if wid < self.workers.len() {
            let w = &self.workers[wid];
            let heartbeat = w.heartbeat.load(Ordering::Acquire);
            let stale = now.saturating_sub(heartbeat) > ORPHAN_THRESHOLD_NANOS;

            // The starvation escape hatch: never target a stalled or
            // overloaded worker.
            if !stale && w.inbox.len() < INBOX_OVERLOADED {
                if let Some(ctx) = context::current() {
                    if ptr::eq(ctx.shared, self) && ctx.worker == wid {
                        match w.local.push(task) {
                            // Our own queue: we will service it, skip the wake.
                            Ok(()) => return,
                            Err(task) => {
                                self.global.push(task);
                                self.wake.wake_one();
                                return;
                            }
                        }
                    }
                }
                self.push_inbox(wid, task);
                self.wake.wake_one();
                return;
            }
        }

        self.global.push(task);
        // Unconditional: bumping the counter even with nobody sleeping
        // closes the window against a worker mid-transition to sleep.
        self.wake.wake_one();
    }

    /// The deadlock detector, invoked by base workers about to sleep.
    ///
    /// Condition: every execution context is blocked (sleeping workers plus
    /// blocked joiner threads cover all workers) while parked fibers exist.
    /// Fires only after the condition persisted for a full window.
    pub(crate) fn check_deadlock(&self) {
        let sleeping = self.sleeping.load(Ordering::SeqCst);
        let blocked = self.blocked_threads.load(Ordering::SeqCst);
        let total = self.workers.len() + self.temp_workers.load(Ordering::SeqCst);
        let parked = self.parked.load(Ordering::SeqCst);

        if parked > 0 && sleeping + blocked >= total {
            let now = self.now();
            let since = match self.deadlock_since.compare_exchange(
                0,
                now,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => now,
                Err(seen) => seen,
            };

            if self.config.debug_deadlock {
                tracing::debug!(sleeping, blocked, parked, total, "deadlock condition holds");
            }

            if now.saturating_sub(since) >= DEADLOCK_PERSIST_NANOS {
                self.report_deadlock();
            }
        } else {
            self.deadlock_since.store(0, Ordering::SeqCst);
        }
    }

    fn report_deadlock(&self) {
        if self.config.deadlock_abort {
            self.dump_state("deadlock detected");
            std::process::exit(124);
        }
        if !self.deadlock_reported.swap(true, Ordering::SeqCst) {
            self.dump_state("deadlock detected (abort disabled)");
        }
    }

    /// Writes a full diagnostic dump to stderr. Works without a tracing
    /// subscriber; this is the output of last resort.
    pub(crate) fn dump_state(&self, why: &str) {
        eprintln!("weft: {why}");
        eprintln!(
            "weft: pending={} parked={} sleeping={} spinning={} blocked_threads={} temp_workers={}",
            self.pending.load(Ordering::SeqCst),
            self.parked.load(Ordering::SeqCst),
            self.sleeping.load(Ordering::SeqCst),
            self.spinning.load(Ordering::SeqCst),
            self.blocked_threads.load(Ordering::SeqCst),
            self.temp_workers.load(Ordering::SeqCst),
        );
        eprintln!(
            "weft: global={} sleep={} fibers_allocated={}",
            self.global.len(),
            self.sleep.len(),
            self.pool.allocated(),
        );
        for (wid, w) in self.workers.iter().enumerate() {
            eprintln!(
                "weft: worker {wid}: local={} inbox={} heartbeat={}ns",
                w.local.len(),
                w.inbox.len(),
                w.heartbeat.load(Ordering::Acquire),
            );
        }
        let now = self.now();
        self.pool.for_each(|task| {
            let t = task.task();
            let state = t.control.load();
            if state == ControlState::Idle {
                return;
            }
            let site = *t.park_site.lock();
            let obj = t.park_obj.load(Ordering::Relaxed);
            match site {
                Some(site) => eprintln!(
                    "weft: fiber {}: {state} ({site}, obj={obj:p}, last transition {}ms ago)",
                    t.id(),
                    now.saturating_sub(t.control.last_transition()) / clock::NANOS_PER_MILLI,
                ),
                None => eprintln!(
                    "weft: fiber {}: {state} (last transition {}ms ago)",
                    t.id(),
                    now.saturating_sub(t.control.last_transition()) / clock::NANOS_PER_MILLI,
                ),
            }
        });
    }

    /// Returns a reclaimed task to the pool.
    pub(crate) fn release_task(&self, task: TaskRef) {
        Stats::bump(&self.stats.completed);
        self.pool.release(task);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last Arc gone: no worker, handle or queue can reference task
        // memory anymore.
        // Safety: see above.
        unsafe { self.pool.drop_all() };
    }
}

/// Upgrades a raw shared pointer (from worker TLS) back to an `Arc`.
///
/// # Safety
///
/// `ptr` must originate from `Arc::as_ptr` on a live `Arc<Shared>` that the
/// calling context keeps alive (workers hold one for the whole resume).
pub(crate) unsafe fn arc_from_ptr(ptr: *const Shared) -> Arc<Shared> {
    // Safety: ensured by caller
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Send-able wrapper for the shared pointer captured by fiber entries.
struct SharedHandle(*const Shared);

// Safety: only dereferenced while the fiber runs, and the scheduler outlives
// every fiber it executes.
unsafe impl Send for SharedHandle {}

impl SharedHandle {
    fn get(&self) -> &Shared {
        // Safety: see the Send justification.
        unsafe { &*self.0 }
    }
}

/// Binds (or rebinds) a task's strand to run `f`.
///
/// The entry wrapper owns the whole fiber-side lifecycle: publish the
/// yielder, run user code under a panic guard, store the result, then the
/// completion protocol (set `done` under the join spinlock, wake joiners,
/// decrement `pending`). The QUEUED/OWNED/DONE bookkeeping stays with the
/// worker trampoline.
fn bind_strand<F, T>(shared: &Arc<Shared>, task: TaskRef, f: F) -> Result<(), SpawnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let sp = SharedHandle(Arc::as_ptr(shared));

    let entry = move |(): (), yielder: &CoYielder| {
        let t = task.task();
        t.yielder
            .store(ptr::from_ref(yielder).cast_mut(), Ordering::Release);

        let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(f));

        // Safety: we are the running fiber and the slot was vacated at reset.
        unsafe { t.result.put::<std::thread::Result<T>>(result) };

        // Completion: set `done` under the join spinlock so a registering
        // joiner either sees it or is seen.
        let mut wait = t.join.lock.lock();
        t.done.store(1, Ordering::SeqCst);
        let waiter = wait.fiber_waiter.take();
        let cv = wait.thread_cv.clone();
        drop(wait);

        if let Some(waiter) = waiter {
            // Safety: a parked joiner keeps its scheduler alive.
            unsafe { (*waiter.shared).unpark_ref(waiter.task) };
        }
        if let Some(cv) = cv {
            cv.signal();
        }

        sp.get().pending.fetch_sub(1, Ordering::SeqCst);
    };

    // Safety: the task is IDLE-from-pool, we own the strand slot.
    unsafe {
        task.task().with_strand(|slot| match slot {
            Some(strand) => {
                debug_assert!(
                    strand.done() || !strand.started(),
                    "pooled strand still suspended"
                );
                strand.rebind(entry);
                Ok(())
            }
            None => {
                let stack =
                    StrandStack::new(shared.config.stack_size).map_err(SpawnError::Stack)?;
                *slot = Some(Strand::new(stack, entry));
                Ok(())
            }
        })
    }
}

/// Spawn path shared by [`Scheduler::try_spawn`] and the fiber-context
/// [`crate::context::try_spawn`].
pub(crate) fn spawn_inner<F, T>(
    shared: &Arc<Shared>,
    f: F,
) -> Result<JoinHandle<T>, SpawnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if !shared.running.load(Ordering::Acquire) {
        return Err(SpawnError::Closed);
    }

    let timing_start = shared.config.spawn_timing.then(Instant::now);

    let task = shared.pool.acquire();
    if let Err(err) = bind_strand(shared, task, f) {
        shared.pool.release(task);
        return Err(err);
    }

    let now = shared.now();
    if !task.task().control.try_spawn(now) {
        shared.pool.release(task);
        return Err(SpawnError::UnexpectedState);
    }

    shared.pending.fetch_add(1, Ordering::SeqCst);
    Stats::bump(&shared.stats.spawned);
    tracing::trace!(fiber = %task.task().id(), "spawn");

    // Enqueue: current worker's local queue when we are on one, else a
    // round-robin inbox, else global.
    let mut own_local = false;
    match context::current() {
        Some(ctx) if ptr::eq(ctx.shared, Arc::as_ptr(shared)) && ctx.worker != NO_WORKER => {
            match shared.workers[ctx.worker].local.push(task) {
                Ok(()) => own_local = true,
                Err(task) => {
                    let n = shared.workers.len();
                    let wid = shared.rr_inbox.fetch_add(1, Ordering::Relaxed) % n;
                    shared.push_inbox(wid, task);
                }
            }
        }
        _ => shared.global.push(task),
    }

    // Conditional wake: spinning workers will find the task themselves, and
    // our own local queue is serviced by us.
    if !own_local
        && shared.spinning.load(Ordering::SeqCst) == 0
        && shared.sleeping.load(Ordering::SeqCst) > 0
    {
        shared.wake.wake_one();
    }

    if let Some(start) = timing_start {
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        shared.stats.spawn_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    Ok(JoinHandle::new(Arc::clone(shared), task))
}

/// An M:N fiber scheduler: many cooperative fibers multiplexed onto a small
/// pool of worker threads.
///
/// Dropping the scheduler shuts it down: it waits (bounded) for in-flight
/// fibers, stops and joins the workers and sysmon, and frees all pooled
/// fibers and stacks.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    sysmon: Option<std::thread::JoinHandle<()>>,
}

assert_impl_all!(Scheduler: Send);

// === impl Scheduler ===

impl Scheduler {
    /// A scheduler with `workers` base workers and defaults (plus
    /// environment overrides) for everything else.
    pub fn new(workers: usize) -> Self {
        Self::with_config(Config::from_env().workers(workers))
    }

    /// A scheduler configured entirely from defaults and the environment.
    pub fn from_env() -> Self {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        let workers: Box<[WorkerShared]> =
            (0..config.workers).map(|_| WorkerShared::new()).collect();

        let shared = Arc::new(Shared {
            workers,
            global: GlobalQueue::new(),
            sleep: SleepQueue::new(),
            pool: crate::pool::FiberPool::new(),
            wake: WakeCounter::new(),
            running: AtomicBool::new(true),
            stats: Stats::new(),
            epoch: Instant::now(),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            pending: CachePadded::new(AtomicUsize::new(0)),
            spinning: CachePadded::new(AtomicUsize::new(0)),
            sleeping: CachePadded::new(AtomicUsize::new(0)),
            parked: CachePadded::new(AtomicUsize::new(0)),
            blocked_threads: CachePadded::new(AtomicUsize::new(0)),
            temp_workers: CachePadded::new(AtomicUsize::new(0)),
            deadlock_since: AtomicU64::new(0),
            deadlock_reported: AtomicBool::new(false),
            last_replacement_spawn: AtomicU64::new(0),
            replacement_seq: AtomicUsize::new(0),
            rr_inbox: AtomicUsize::new(0),
            inbox_overflow_warned: AtomicBool::new(false),
            config,
        });

        let worker_threads = (0..shared.config.workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("weft-worker-{id}"))
                    .spawn(move || worker::run_base(shared, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        let sysmon = (shared.config.workers > 1 && shared.config.sysmon).then(|| {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("weft-sysmon".into())
                .spawn(move || sysmon::run(shared))
                .expect("failed to spawn sysmon thread")
        });

        tracing::debug!(
            workers = shared.config.workers,
            sysmon = sysmon.is_some(),
            "scheduler started"
        );

        Self {
            shared,
            workers: worker_threads,
            sysmon,
        }
    }

    /// Spawns a fiber.
    ///
    /// # Panics
    ///
    /// Panics when the spawn fails; see [`Self::try_spawn`].
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_spawn(f).expect("spawn failed")
    }

    /// Spawns a fiber.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler is shutting down, when the stack allocation
    /// fails, or when the pooled fiber was in an unexpected state.
    pub fn try_spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>, SpawnError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        spawn_inner(&self.shared, f)
    }

    /// Pre-allocates `n` pooled fibers with mapped stacks, so the first `n`
    /// spawns take the rebind fast path instead of calling `mmap`.
    ///
    /// # Errors
    ///
    /// Fails when a stack allocation fails; already-created fibers stay
    /// pooled.
    pub fn prewarm(&self, n: usize) -> Result<(), SpawnError> {
        let mut tasks = Vec::with_capacity(n);
        // Hold all n before releasing so we warm n distinct slots.
        for _ in 0..n {
            let task = self.shared.pool.acquire();
            // Safety: freshly acquired, we own the strand slot.
            let bound = unsafe {
                task.task().with_strand(|slot| {
                    if slot.is_none() {
                        let stack = StrandStack::new(self.shared.config.stack_size)
                            .map_err(SpawnError::Stack)?;
                        *slot = Some(Co::new(stack, |(), _yielder: &CoYielder| {}));
                    }
                    Ok(())
                })
            };
            tasks.push(task);
            if let Err(err) = bound {
                for task in tasks {
                    self.shared.pool.release(task);
                }
                return Err(err);
            }
        }
        for task in tasks {
            self.shared.pool.release(task);
        }
        Ok(())
    }

    /// Number of base workers.
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// `false` once shutdown has begun.
    pub fn is_active(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of fibers whose user code has not returned yet.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Shuts the scheduler down: bounded wait for in-flight fibers, then
    /// stop and join all threads and drain the queues. Also runs on drop.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.workers.is_empty() && self.sysmon.is_none() {
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.shared.pending.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let abandoned = self.shared.pending.load(Ordering::SeqCst);
        if abandoned > 0 {
            tracing::warn!(abandoned, "shutting down with unfinished fibers");
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.wake_all();

        if let Some(sysmon) = self.sysmon.take() {
            let _ = sysmon.join();
        }
        for handle in self.workers.drain(..) {
            // Re-wake before each join: a worker may have been mid-transition
            // to sleep when the first broadcast fired.
            self.shared.wake.wake_all();
            let _ = handle.join();
        }

        // Drain every queue so no stale task pointers survive into teardown.
        self.shared.sleep.drain(u64::MAX, &self.shared.global);
        while self.shared.global.pop().is_some() {}
        for w in self.shared.workers.iter() {
            while w.local.claim().is_some() {}
            while w.inbox.pop().is_some() {}
        }

        self.shared.stats.report(&self.shared.config);
        tracing::debug!("scheduler stopped");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.shared.workers.len())
            .field("pending", &self.pending())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn trace() -> impl Drop {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    fn small_stacks(workers: usize) -> Config {
        Config::default().workers(workers).stack_size(64 * 1024)
    }

    #[test]
    fn spawn_join_identity() {
        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(2));

        let arg = 41_u64;
        let handle = sched.spawn(move || arg + 1);
        assert_eq!(handle.join().unwrap(), 42);

        sched.shutdown();
    }

    #[test]
    fn nested_spawn_and_fiber_join() {
        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(2));

        let handle = sched.spawn(|| {
            let inner = crate::context::spawn(|| 41_u64);
            inner.join().unwrap() + 1
        });
        assert_eq!(handle.join().unwrap(), 42);

        sched.shutdown();
    }

    #[test]
    fn results_spill_to_the_heap_when_large() {
        let sched = Scheduler::with_config(small_stacks(1));

        let handle = sched.spawn(|| [7_u8; 200]);
        assert_eq!(handle.join().unwrap(), [7_u8; 200]);

        sched.shutdown();
    }

    #[test]
    fn panics_propagate_through_join() {
        let sched = Scheduler::with_config(small_stacks(1));

        let handle = sched.spawn(|| -> u32 { panic!("boom") });
        let err = handle.join().unwrap_err();
        let payload = err.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

        // the worker survives a fiber panic
        let handle = sched.spawn(|| 7_u32);
        assert_eq!(handle.join().unwrap(), 7);

        sched.shutdown();
    }

    #[test]
    fn yields_round_trip() {
        let sched = Scheduler::with_config(small_stacks(2));

        let handle = sched.spawn(|| {
            for i in 0..100 {
                if i % 2 == 0 {
                    crate::context::yield_now();
                } else {
                    crate::context::yield_global();
                }
            }
            "survived"
        });
        assert_eq!(handle.join().unwrap(), "survived");

        sched.shutdown();
    }

    /// Ping-pong on a flag: fiber parks while the flag holds, the main
    /// thread flips it and unparks, repeatedly. No iteration may lose the
    /// wakeup.
    #[test]
    fn flag_ping_pong() {
        use std::sync::Arc as StdArc;

        const ROUNDS: u32 = 10_000;

        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(2));
        let flag = StdArc::new(AtomicU32::new(0));

        let handle = {
            let flag = StdArc::clone(&flag);
            sched.spawn(move || {
                for _ in 0..ROUNDS {
                    flag.store(1, Ordering::SeqCst);
                    while flag.load(Ordering::SeqCst) == 1 {
                        crate::context::park_while(&flag, 1, "ping-pong");
                    }
                    assert_eq!(flag.load(Ordering::SeqCst), 2);
                    flag.store(0, Ordering::SeqCst);
                }
            })
        };
        let unparker = handle.unparker();

        for _ in 0..ROUNDS {
            while flag.load(Ordering::SeqCst) != 1 {
                std::hint::spin_loop();
            }
            flag.store(2, Ordering::SeqCst);
            unparker.unpark();
        }

        handle.join().unwrap();
        sched.shutdown();
    }

    /// A thousand fibers park on dedicated flags; one producer flips every
    /// flag and unparks each once. Nobody may stay parked.
    #[test]
    fn park_storm_resumes_everyone() {
        use std::sync::Arc as StdArc;

        const FIBERS: usize = 1_000;

        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(4));

        let mut handles = Vec::with_capacity(FIBERS);
        let mut flags = Vec::with_capacity(FIBERS);
        for _ in 0..FIBERS {
            let flag = StdArc::new(AtomicU32::new(0));
            flags.push(StdArc::clone(&flag));
            handles.push(sched.spawn(move || {
                while flag.load(Ordering::SeqCst) == 0 {
                    crate::context::park_while(&flag, 0, "storm");
                }
                flag.load(Ordering::SeqCst)
            }));
        }

        let unparkers: Vec<_> = handles.iter().map(JoinHandle::unparker).collect();
        for (flag, unparker) in flags.iter().zip(&unparkers) {
            flag.store(1, Ordering::SeqCst);
            unparker.unpark();
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(sched.shared().parked.load(Ordering::SeqCst), 0);

        sched.shutdown();
    }

    /// A hundred thousand small fibers spawned from one thread onto eight
    /// workers: every worker must end up executing a comparable share
    /// (min/max ratio of at least 0.5), or the stealing paths are broken.
    #[test]
    fn work_stealing_balances_load() {
        use std::sync::Arc as StdArc;
        use std::sync::atomic::AtomicUsize;

        const WORKERS: usize = 8;
        const FIBERS: usize = 100_000;

        let _trace = trace();
        let sched =
            Scheduler::with_config(Config::default().workers(WORKERS).stack_size(16 * 1024));
        let per_worker: StdArc<[AtomicUsize; WORKERS]> = StdArc::new(Default::default());

        let mut handles = Vec::with_capacity(FIBERS);
        for _ in 0..FIBERS {
            let per_worker = StdArc::clone(&per_worker);
            handles.push(sched.spawn(move || {
                // identify the executing worker through its thread name
                if let Some(counter) = std::thread::current().name().and_then(|name| {
                    let id: usize = name.strip_prefix("weft-worker-")?.parse().ok()?;
                    per_worker.get(id)
                }) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                let mut acc = 0_u64;
                for i in 0..200_u64 {
                    acc = acc.wrapping_add(core::hint::black_box(i));
                }
                acc
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let counts: Vec<usize> = per_worker
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        // replacement workers have different thread names and count nowhere
        assert!(counts.iter().sum::<usize>() <= FIBERS);

        let min = counts.iter().min().copied().unwrap();
        let max = counts.iter().max().copied().unwrap();
        assert!(max > 0);
        assert!(
            min * 2 >= max,
            "stealing failed to balance: per-worker counts {counts:?}"
        );

        sched.shutdown();
    }

    /// A burst spawned from inside one fiber lands on that worker's local
    /// queue first and overflows through the inboxes into the global queue;
    /// the other workers drain all of it.
    #[test]
    fn local_burst_overflows_and_completes() {
        const FIBERS: u64 = 4_000;

        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(4));

        let root = sched.spawn(move || {
            let children: Vec<_> = (0..FIBERS)
                .map(|i| crate::context::spawn(move || i * 2))
                .collect();
            children
                .into_iter()
                .map(|c| c.join().unwrap())
                .sum::<u64>()
        });
        assert_eq!(root.join().unwrap(), (0..FIBERS).map(|i| i * 2).sum());

        sched.shutdown();
    }

    #[test]
    fn sleep_respects_the_deadline() {
        use std::time::Instant;

        const FIBERS: usize = 1_000;
        const SLEEP: Duration = Duration::from_millis(50);

        let _trace = trace();
        let sched = Scheduler::with_config(small_stacks(4));

        let handles: Vec<_> = (0..FIBERS)
            .map(|_| {
                sched.spawn(move || {
                    let start = Instant::now();
                    crate::context::sleep(SLEEP);
                    start.elapsed()
                })
            })
            .collect();

        let mut elapsed: Vec<Duration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        elapsed.sort();

        // never early
        assert!(elapsed[0] >= SLEEP);
        // p99 at most ~10ms over the deadline: expired sleepers are re-driven
        // every ~250us, so the tail is resume latency, not timer latency
        let p99 = elapsed[FIBERS * 99 / 100 - 1];
        assert!(p99 <= Duration::from_millis(60), "p99 was {p99:?}");

        sched.shutdown();
    }

    #[test]
    fn detached_fibers_complete_and_recycle() {
        let sched = Scheduler::with_config(small_stacks(2));

        for _ in 0..100 {
            // handle dropped immediately: fiber is detached
            drop(sched.spawn(|| 5_u32));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sched.pending() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sched.pending(), 0);

        sched.shutdown();
    }

    /// Pool reuse: a joined fiber's slot (same id) is handed to the next
    /// spawn, and behaves like a fresh fiber.
    #[test]
    fn spawn_after_join_reuses_the_slot() {
        let sched = Scheduler::with_config(small_stacks(1));

        let first = sched.spawn(|| 1_u32);
        let first_id = first.id();
        first.join().unwrap();

        let second = sched.spawn(|| 2_u32);
        assert_eq!(second.id(), first_id);
        assert_eq!(second.join().unwrap(), 2);

        assert_eq!(sched.shared().pool.allocated(), 1);

        sched.shutdown();
    }

    #[test]
    fn prewarm_populates_the_pool() {
        let sched = Scheduler::with_config(small_stacks(1));

        sched.prewarm(4).unwrap();
        assert_eq!(sched.shared().pool.allocated(), 4);

        // sequential spawn+join cycles never need a fifth slot
        for i in 0..8_u32 {
            let handle = sched.spawn(move || i);
            assert_eq!(handle.join().unwrap(), i);
        }
        assert_eq!(sched.shared().pool.allocated(), 4);

        sched.shutdown();
    }

    #[test]
    fn join_from_thread_while_worker_busy() {
        let sched = Scheduler::with_config(small_stacks(1));

        // a long-ish fiber so the joining thread actually blocks
        let handle = sched.spawn(|| {
            for _ in 0..50 {
                crate::context::yield_now();
                std::thread::sleep(Duration::from_micros(100));
            }
            "done"
        });

        assert_eq!(handle.join().unwrap(), "done");
        sched.shutdown();
    }

    #[test]
    fn context_queries() {
        let sched = Scheduler::with_config(small_stacks(1));

        assert!(!crate::context::in_fiber());
        assert!(crate::context::current_id().is_none());

        let handle = sched.spawn(|| {
            assert!(crate::context::in_fiber());
            crate::context::current_id().expect("fiber must have an id")
        });
        let inside = handle.join().unwrap();
        assert_eq!(inside.as_u64(), 1);

        sched.shutdown();
    }

    #[test]
    fn spawn_fails_after_shutdown_begins() {
        let sched = Scheduler::with_config(small_stacks(1));
        sched.shared().running.store(false, Ordering::SeqCst);

        let err = sched.try_spawn(|| ()).unwrap_err();
        assert!(matches!(err, SpawnError::Closed));

        // restore so shutdown's own path stays exercised
        sched.shared().running.store(true, Ordering::SeqCst);
        sched.shutdown();
    }

    /// A fiber parked forever with every worker asleep must trip the
    /// detector; with abort disabled it logs once instead of exiting.
    #[test]
    fn deadlock_detector_reports() {
        use std::sync::Arc as StdArc;

        let _trace = trace();
        let sched = Scheduler::with_config(
            small_stacks(1)
                .sysmon(false)
                .deadlock_abort(false),
        );

        let flag = StdArc::new(AtomicU32::new(0));
        let handle = {
            let flag = StdArc::clone(&flag);
            sched.spawn(move || {
                while flag.load(Ordering::SeqCst) == 0 {
                    crate::context::park_while(&flag, 0, "test: waiting forever");
                }
            })
        };
        let unparker = handle.unparker();

        // detector needs: condition observed, then persisting for >= 1s
        std::thread::sleep(Duration::from_millis(2_500));
        assert!(sched.shared().deadlock_reported.load(Ordering::SeqCst));
        assert_eq!(sched.shared().parked.load(Ordering::SeqCst), 1);

        flag.store(1, Ordering::SeqCst);
        unparker.unpark();
        handle.join().unwrap();

        sched.shutdown();
    }

    /// The abort path of the detector: a fiber parked forever with nobody
    /// to wake it must terminate the process with exit code 124. Runs the
    /// parking scheduler in a child process (this test binary re-executed
    /// against its own name), so the exit can be observed from outside.
    #[test]
    #[ignore = "re-executes the test binary and waits out the detection window"]
    fn deadlock_detector_aborts_with_124() {
        if std::env::var_os("WEFT_DEADLOCK_CHILD").is_some() {
            let sched = Scheduler::with_config(small_stacks(1).sysmon(false));
            let _handle = sched.spawn(|| crate::context::park("test: waiting forever"));
            // the detector fires out of the worker's sleep path within ~2s
            std::thread::sleep(Duration::from_secs(10));
            unreachable!("deadlock detector did not fire");
        }

        let exe = std::env::current_exe().unwrap();
        let status = std::process::Command::new(exe)
            .args([
                "--exact",
                "scheduler::tests::deadlock_detector_aborts_with_124",
                "--ignored",
                "--nocapture",
            ])
            .env("WEFT_DEADLOCK_CHILD", "1")
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(124));
    }
}
