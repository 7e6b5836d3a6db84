// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker loop and the yield-commit trampoline.
//!
//! Workers drain queues in priority order (local, own inbox, global), steal
//! in batches when empty, and walk a spin -> yield -> sleep ladder when
//! idle. Every fiber resume ends back in the trampoline, which commits the
//! fiber's requested suspension *after* the fiber's stack is quiescent -
//! that is what makes the park commit safe against concurrent unparks.
//!
//! Replacement workers (spawned by sysmon when a base worker stalls) run a
//! simplified loop over the same building blocks: global queue plus
//! stealing, no local queue, self-retiring after an idle timeout.

use crate::config::{BATCH, GLOBAL_POLL_INTERVAL, REPLACEMENT_RETIRE_NANOS, SLEEP_TIMEOUT_MILLIS};
use crate::context::{self, Current};
use crate::scheduler::{Shared, WorkerShared};
use crate::stats::Stats;
use crate::task::{NO_WORKER, ParkCond, ParkSite, Switch, TaskRef};
use arrayvec::ArrayVec;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;
use strand::StrandResult;

pub(crate) fn run_base(shared: Arc<Shared>, id: usize) {
    let _span = tracing::debug_span!("worker", id).entered();
    Worker::new_base(shared, id).run();
}

pub(crate) fn run_replacement(shared: Arc<Shared>, owner_id: usize) {
    let _span = tracing::debug_span!("replacement", id = owner_id).entered();
    let mut worker = Worker::new_replacement(shared, owner_id);
    worker.run_replacement_loop();
    worker.shared.temp_workers.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(id = owner_id, "replacement worker retired");
}

struct Worker {
    shared: Arc<Shared>,
    /// Owner identity stored in the control word while executing fibers.
    /// Unique among live workers; base workers use their index, replacement
    /// workers get ids past the base range.
    owner_id: usize,
    /// Index into `shared.workers`, or `None` for replacement workers (no
    /// local queue, no inbox, no heartbeat).
    home: Option<usize>,
    rng: fastrand::Rng,
    /// Batches completed since the last global-queue poll, for the fairness
    /// injection.
    local_batches: u32,
}

// === impl Worker ===

impl Worker {
    fn new_base(shared: Arc<Shared>, id: usize) -> Self {
        let seed = 0x9E37_79B9_7F4A_7C15_u64.wrapping_mul(id as u64 + 1);
        Self {
            shared,
            owner_id: id,
            home: Some(id),
            rng: fastrand::Rng::with_seed(seed),
            local_batches: 0,
        }
    }

    fn new_replacement(shared: Arc<Shared>, owner_id: usize) -> Self {
        let seed = shared.now() | 1;
        Self {
            shared,
            owner_id,
            home: None,
            rng: fastrand::Rng::with_seed(seed),
            local_batches: 0,
        }
    }

    fn me(&self) -> Option<&WorkerShared> {
        self.home.map(|id| &self.shared.workers[id])
    }

    fn touch_heartbeat(&self) {
        if let Some(me) = self.me() {
            me.heartbeat.store(self.shared.now(), Ordering::Release);
        }
    }

    // === base worker loop ===

    fn run(mut self) {
        let mut batch: ArrayVec<TaskRef, BATCH> = ArrayVec::new();

        while self.shared.running.load(Ordering::Acquire) {
            self.touch_heartbeat();

            self.collect_batch(&mut batch);
            if batch.is_empty() {
                if let Some(task) = self.steal() {
                    batch.push(task);
                }
            }

            if batch.is_empty() {
                self.idle();
                continue;
            }

            for task in batch.drain(..) {
                self.run_task(task);
            }
        }

        tracing::debug!("worker shutting down");
    }

    /// Collects up to [`BATCH`] tasks in priority order: local queue, own
    /// inbox, global queue. Every [`GLOBAL_POLL_INTERVAL`] local-only
    /// batches, one global pop is injected first so global work cannot
    /// starve behind a busy local queue.
    fn collect_batch(&mut self, batch: &mut ArrayVec<TaskRef, BATCH>) {
        let mut polled_global = false;

        if self.local_batches >= GLOBAL_POLL_INTERVAL {
            if let Some(task) = self.shared.global.pop() {
                batch.push(task);
            }
            polled_global = true;
        }

        let me = self.me().expect("collect_batch on a replacement worker");
        while !batch.is_full() {
            let Some(task) = me.local.claim() else { break };
            batch.push(task);
        }
        while !batch.is_full() {
            let Some(task) = me.inbox.pop() else { break };
            batch.push(task);
        }
        while !batch.is_full() {
            let Some(task) = self.shared.global.pop() else {
                break;
            };
            batch.push(task);
            polled_global = true;
        }

        if polled_global {
            self.local_batches = 0;
        } else {
            self.local_batches += 1;
        }
    }

    /// One poll over every queue we can service, in priority order. `steal`
    /// controls whether a miss escalates to stealing.
    fn poll_once(&mut self, steal: bool) -> Option<TaskRef> {
        if let Some(me) = self.me() {
            if let Some(task) = me.local.claim() {
                return Some(task);
            }
            if let Some(task) = me.inbox.pop() {
                return Some(task);
            }
        }
        if let Some(task) = self.shared.global.pop() {
            return Some(task);
        }
        if steal { self.steal() } else { None }
    }

    /// Batched stealing: scan victims from a random start; take one inbox
    /// task if there is one, else steal up to half of a victim's local
    /// queue, keeping the first task and queueing the rest locally.
    fn steal(&mut self) -> Option<TaskRef> {
        let n = self.shared.workers.len();
        if n <= 1 && self.home.is_some() {
            return None;
        }

        let start = self.rng.usize(0..n);
        for i in 0..n {
            let v = (start + i) % n;
            if Some(v) == self.home {
                continue;
            }
            let victim = &self.shared.workers[v];

            if let Some(task) = victim.inbox.pop() {
                Stats::bump(&self.shared.stats.steals);
                Stats::bump(&self.shared.stats.stolen_tasks);
                return Some(task);
            }

            if let Some(task) = self.steal_half(v) {
                return Some(task);
            }
        }

        None
    }

    fn steal_half(&self, victim: usize) -> Option<TaskRef> {
        let victim = &self.shared.workers[victim];
        let first = victim.local.claim()?;

        Stats::bump(&self.shared.stats.steals);
        Stats::bump(&self.shared.stats.stolen_tasks);

        // Move up to half of what the victim still holds into our queue
        // (global when we have none or ours fills up).
        let extra = victim.local.len() / 2;
        for _ in 0..extra {
            let Some(task) = victim.local.claim() else {
                break;
            };
            Stats::bump(&self.shared.stats.stolen_tasks);
            match self.me() {
                Some(me) => {
                    if let Err(task) = me.local.push(task) {
                        self.shared.global.push(task);
                    }
                }
                None => self.shared.global.push(task),
            }
        }

        tracing::trace!(extra, "stole tasks");
        Some(first)
    }

    // === execution ===

    /// Resumes one queued fiber: claim exclusive ownership, switch to its
    /// stack, and commit whatever it asked for when it comes back.
    fn run_task(&mut self, task: TaskRef) {
        let t = task.task();

        if !t.control.try_acquire(self.owner_id, self.shared.now()) {
            // Stale entry: the fiber was claimed through another queue entry.
            tracing::trace!(fiber = %t.id(), "stale queue entry dropped");
            return;
        }

        t.last_worker.store(
            self.home.unwrap_or(NO_WORKER),
            Ordering::Relaxed,
        );
        self.touch_heartbeat();

        let result = {
            let _entered = context::enter(Current {
                shared: Arc::as_ptr(&self.shared),
                worker: self.home.unwrap_or(NO_WORKER),
                task,
            });

            // Safety: we hold OWNED, which is exactly the exclusive right
            // the strand slot requires.
            unsafe {
                t.with_strand(|slot| {
                    let strand = slot.as_mut().unwrap_or_else(|| {
                        panic!(
                            "fiber {} is OWNED but has no strand; scheduler invariant violated",
                            t.id()
                        )
                    });
                    strand.resume(())
                })
            }
        };

        self.commit(task, result);
    }

    /// The trampoline: runs with the fiber's stack quiescent and the
    /// control word still OWNED(self), and commits the suspension the fiber
    /// requested.
    fn commit(&mut self, task: TaskRef, result: StrandResult<Switch, ()>) {
        let t = task.task();
        let now = self.shared.now();

        match result {
            // User code returned; `done` and `pending` were already handled
            // by the fiber's own exit path. Release the stack, then let the
            // detach latch decide who recycles.
            StrandResult::Return(()) => {
                t.control.release_done(self.owner_id, now);
                if t.detached.load(Ordering::SeqCst) && t.control.try_reclaim(self.shared.now()) {
                    self.shared.release_task(task);
                }
            }

            StrandResult::Yield(Switch::YieldLocal) => {
                t.control.release_queued(self.owner_id, now);
                match self.me() {
                    Some(me) => {
                        if let Err(task) = me.local.push(task) {
                            self.shared.global.push(task);
                        }
                        // No wake: we service our own local queue.
                    }
                    None => {
                        self.shared.global.push(task);
                        self.conditional_wake();
                    }
                }
            }

            StrandResult::Yield(Switch::YieldGlobal) => {
                t.control.release_queued(self.owner_id, now);
                self.shared.global.push(task);
                self.conditional_wake();
            }

            StrandResult::Yield(Switch::Sleep { deadline }) => {
                t.sleep_deadline.store(deadline, Ordering::Release);
                t.control.release_queued(self.owner_id, now);
                self.shared.sleep.push(task);
            }

            StrandResult::Yield(Switch::Park { cond, site }) => {
                self.commit_park(task, cond, site);
            }
        }
    }

    /// The park commit. The fiber already consumed its fast paths before
    /// suspending; everything here re-runs on the worker with the stack
    /// quiescent, so an unparker that wins any race finds a fiber that is
    /// safe to resume.
    fn commit_park(&mut self, task: TaskRef, cond: Option<ParkCond>, site: ParkSite) {
        let t = task.task();
        *t.park_site.lock() = Some(site);

        if self.shared.config.park_debug {
            tracing::debug!(fiber = %t.id(), reason = site.reason, "park");
        }

        // Pre-commit: an unpark latched while the fiber was suspending wins.
        if t.pending_unpark.swap(false, Ordering::SeqCst) {
            self.abort_park(task);
            return;
        }
        // Pre-commit: the condition changed while the fiber was suspending.
        if let Some(cond) = &cond {
            // Safety: the parked fiber's stack keeps the flag borrowed.
            if unsafe { !cond.holds(Ordering::SeqCst) } {
                self.abort_park(task);
                return;
            }
        }

        // Commit. The parked counter is incremented first so a concurrent
        // unparker that wins the PARKED -> QUEUED race decrements a counter
        // we already accounted.
        self.shared.parked.fetch_add(1, Ordering::SeqCst);
        t.control.commit_parked(self.owner_id, self.shared.now());

        // Post-commit Dekker step: we stored PARKED, now re-read the latch
        // with sequential consistency. The unparker stores the latch, then
        // re-reads the control word. Whatever the interleaving, one side
        // sees the other.
        if t.pending_unpark.swap(false, Ordering::SeqCst) {
            self.undo_park(task);
            return;
        }
        // Same reasoning for the condition.
        if let Some(cond) = &cond {
            // Safety: as above.
            if unsafe { !cond.holds(Ordering::SeqCst) } {
                self.undo_park(task);
                return;
            }
        }

        Stats::bump(&self.shared.stats.parks);
    }

    /// Abort before the commit: control is still OWNED, nobody else can
    /// touch the fiber. Hand it straight to the global queue.
    fn abort_park(&self, task: TaskRef) {
        task.task()
            .control
            .release_queued(self.owner_id, self.shared.now());
        self.shared.global.push(task);
    }

    /// Undo after the commit: the fiber is PARKED and fair game, so the
    /// QUEUED claim can lose to a concurrent unparker - then the unparker
    /// already re-enqueued it and there is nothing left to do.
    fn undo_park(&self, task: TaskRef) {
        let t = task.task();
        if t.control.try_unpark(self.shared.now()) {
            self.shared.parked.fetch_sub(1, Ordering::SeqCst);
            self.shared.global.push(task);
            self.shared.wake.wake_one();
        }
    }

    fn conditional_wake(&self) {
        if self.shared.spinning.load(Ordering::SeqCst) == 0
            && self.shared.sleeping.load(Ordering::SeqCst) > 0
        {
            self.shared.wake.wake_one();
        }
    }

    // === idle path ===

    /// The spin -> yield -> sleep ladder. Every transition is ordered so
    /// that a producer publishing work concurrently is seen by at least one
    /// re-check before the worker commits to the next (cheaper-to-wake but
    /// slower-to-run) stage.
    fn idle(&mut self) {
        self.shared.spinning.fetch_add(1, Ordering::SeqCst);

        let fast_iters = self.shared.config.spin_fast_iters;
        for i in 0..fast_iters {
            // Poll cheap every iteration, steal every 16th.
            if let Some(task) = self.poll_once(i % 16 == 15) {
                self.shared.spinning.fetch_sub(1, Ordering::SeqCst);
                self.run_task(task);
                return;
            }
            core::hint::spin_loop();
        }

        let yield_iters = self.shared.config.spin_yield_iters;
        for _ in 0..yield_iters {
            std::thread::yield_now();
            if let Some(task) = self.poll_once(true) {
                self.shared.spinning.fetch_sub(1, Ordering::SeqCst);
                self.run_task(task);
                return;
            }
        }

        // Transition towards sleep. `sleeping` rises *before* `spinning`
        // falls, so producers observing "no spinner" have a sleeper to wake
        // and the combined count never dips to zero with work in flight.
        self.shared.sleeping.fetch_add(1, Ordering::SeqCst);
        self.shared.spinning.fetch_sub(1, Ordering::SeqCst);

        // Re-check everything (including one last steal) now that we are
        // counted as sleeping: closes the race against a producer that
        // published right after our last poll.
        if let Some(task) = self.poll_once(true) {
            self.shared.sleeping.fetch_sub(1, Ordering::SeqCst);
            self.run_task(task);
            return;
        }

        // Drive expired sleepers ourselves; sysmon also does this, but a
        // sleeping worker must not depend on it.
        let drained = self
            .shared
            .sleep
            .drain(self.shared.now(), &self.shared.global);
        if drained > 0 {
            self.shared
                .stats
                .sleep_drained
                .fetch_add(drained as u64, Ordering::Relaxed);
            // We will pick one up on the re-poll below; wake peers for the
            // rest.
            for _ in 1..drained {
                self.shared.wake.wake_one();
            }
        }

        if let Some(task) = self.poll_once(false) {
            self.shared.sleeping.fetch_sub(1, Ordering::SeqCst);
            self.run_task(task);
            return;
        }

        self.shared.check_deadlock();

        // Snapshot strictly after every poll above; any wake bumping the
        // counter after this line makes the wait return immediately.
        let snapshot = self.shared.wake.value();
        if let Some(task) = self.poll_once(true) {
            self.shared.sleeping.fetch_sub(1, Ordering::SeqCst);
            self.run_task(task);
            return;
        }

        if self.shared.running.load(Ordering::Acquire) {
            self.shared
                .wake
                .wait_timeout(snapshot, Duration::from_millis(SLEEP_TIMEOUT_MILLIS));
        }
        self.shared.sleeping.fetch_sub(1, Ordering::SeqCst);
    }

    // === replacement worker loop ===

    fn run_replacement_loop(&mut self) {
        let mut idle_since: Option<u64> = None;

        while self.shared.running.load(Ordering::Acquire) {
            if let Some(task) = self.shared.global.pop().or_else(|| self.steal()) {
                idle_since = None;
                self.run_task(task);
                continue;
            }

            let now = self.shared.now();
            let since = *idle_since.get_or_insert(now);
            if now.saturating_sub(since) >= REPLACEMENT_RETIRE_NANOS {
                // Retire only after a final drain over every queue confirms
                // there is nothing left for us.
                if let Some(task) = self.final_drain() {
                    idle_since = None;
                    self.run_task(task);
                    continue;
                }
                return;
            }

            // Bounded spin, then sleep on the wake counter with a short
            // timeout so the retire clock keeps being evaluated.
            let snapshot = self.shared.wake.value();
            if let Some(task) = self.shared.global.pop().or_else(|| self.steal()) {
                idle_since = None;
                self.run_task(task);
                continue;
            }
            self.shared
                .wake
                .wait_timeout(snapshot, Duration::from_millis(50));
        }
    }

    fn final_drain(&mut self) -> Option<TaskRef> {
        if let Some(task) = self.shared.global.pop() {
            return Some(task);
        }
        for w in self.shared.workers.iter() {
            if let Some(task) = w.inbox.pop() {
                return Some(task);
            }
            if let Some(task) = w.local.claim() {
                return Some(task);
            }
        }
        None
    }
}
