// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sysmon: the scheduler's monitor thread.
//!
//! Started only for multi-worker schedulers. Every tick (~250 µs) it drains
//! the sleep queue, optionally scans for stalled (OWNED-for-too-long)
//! fibers, and - when a base worker's heartbeat goes stale while runnable
//! work exists - spawns detached, self-retiring replacement workers so a
//! fiber that hogs its worker cannot stall the whole scheduler.

use crate::clock;
use crate::config::{
    ORPHAN_THRESHOLD_NANOS, REPLACEMENT_SPAWN_INTERVAL_NANOS, STALL_THRESHOLD_NANOS,
    SYSMON_TICK_MICROS,
};
use crate::scheduler::Shared;
use crate::stats::Stats;
use crate::task::state::ControlState;
use crate::worker;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;

/// Cadence of the stall scan, relative to sysmon ticks.
const STALL_SCAN_INTERVAL_NANOS: u64 = 2_000 * clock::NANOS_PER_MILLI;

pub(crate) fn run(shared: Arc<Shared>) {
    let _span = tracing::debug_span!("sysmon").entered();
    let mut last_stall_scan = 0_u64;

    while shared.running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_micros(SYSMON_TICK_MICROS));
        let now = shared.now();

        // Expired sleepers back onto the global queue, one wake per fiber.
        let drained = shared.sleep.drain(now, &shared.global);
        if drained > 0 {
            shared
                .stats
                .sleep_drained
                .fetch_add(drained as u64, Ordering::Relaxed);
            if shared.config.debug_sysmon {
                tracing::debug!(drained, "sysmon re-enqueued expired sleepers");
            }
            for _ in 0..drained {
                shared.wake.wake_one();
            }
        }

        if shared.config.debug_stall
            && now.saturating_sub(last_stall_scan) >= STALL_SCAN_INTERVAL_NANOS
        {
            last_stall_scan = now;
            scan_stalls(&shared, now);
        }

        maybe_spawn_replacement(&shared, now);
    }

    tracing::debug!("sysmon shutting down");
}

/// Reports fibers that have held a worker without a control-word transition
/// for longer than the stall threshold.
fn scan_stalls(shared: &Arc<Shared>, now: u64) {
    shared.pool.for_each(|task| {
        let t = task.task();
        if let ControlState::Owned(wid) = t.control.load() {
            let age = now.saturating_sub(t.control.last_transition());
            if age >= STALL_THRESHOLD_NANOS {
                let site = *t.park_site.lock();
                match site {
                    Some(site) => eprintln!(
                        "weft: fiber {} stalled on worker {wid} for {}ms (last park: {site})",
                        t.id(),
                        age / clock::NANOS_PER_MILLI,
                    ),
                    None => eprintln!(
                        "weft: fiber {} stalled on worker {wid} for {}ms",
                        t.id(),
                        age / clock::NANOS_PER_MILLI,
                    ),
                }
            }
        }
    });
}

/// The orphan model: a base worker whose heartbeat stopped advancing while
/// runnable work exists is presumed stuck inside a fiber. Spawn a detached
/// replacement worker (rate-limited, capped at +50% of the base pool and at
/// 2x the core count overall) to pick up the slack; replacements retire on
/// their own once the backlog clears.
fn maybe_spawn_replacement(shared: &Arc<Shared>, now: u64) {
    let base = shared.workers.len();

    let any_stalled = shared
        .workers
        .iter()
        .any(|w| now.saturating_sub(w.heartbeat.load(Ordering::Acquire)) > ORPHAN_THRESHOLD_NANOS);
    if !any_stalled || !shared.runnable_work() {
        return;
    }

    let temps = shared.temp_workers.load(Ordering::SeqCst);
    let max_extra = (base / 2).max(1);
    if temps >= max_extra || base + temps >= 2 * shared.cores {
        return;
    }

    // Rate limit: at most one replacement per interval.
    let last = shared.last_replacement_spawn.load(Ordering::SeqCst);
    if now.saturating_sub(last) < REPLACEMENT_SPAWN_INTERVAL_NANOS {
        return;
    }
    if shared
        .last_replacement_spawn
        .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    shared.temp_workers.fetch_add(1, Ordering::SeqCst);
    Stats::bump(&shared.stats.replacements_spawned);

    let owner_id = base + shared.replacement_seq.fetch_add(1, Ordering::Relaxed);
    let spawn_shared = Arc::clone(shared);

    let spawned = std::thread::Builder::new()
        .name(format!("weft-replacement-{owner_id}"))
        .spawn(move || worker::run_replacement(spawn_shared, owner_id));

    match spawned {
        // Detached: replacements join nobody, they retire on their own.
        Ok(handle) => {
            drop(handle);
            if shared.config.debug_sysmon {
                tracing::debug!(owner_id, temps = temps + 1, "spawned replacement worker");
            }
        }
        Err(err) => {
            shared.temp_workers.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(%err, "failed to spawn replacement worker");
        }
    }
}
