// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduler configuration.
//!
//! Every knob can be set programmatically through the builder methods on
//! [`Config`]; [`Config::from_env`] additionally reads the environment
//! variables recognised at init:
//!
//! | Name | Effect |
//! |---|---|
//! | `WORKERS` | override worker count |
//! | `SPIN_FAST_ITERS`, `SPIN_YIELD_ITERS` | tune the idle transition |
//! | `SYSMON` (`=0` disables) | sysmon on/off |
//! | `FIBER_STATS`, `SPAWN_TIMING` | emit stats at shutdown |
//! | `DEBUG_DEADLOCK_RUNTIME`, `DEBUG_JOIN`, `DEBUG_WAKE`, `DEBUG_SYSMON`, `DEBUG_INBOX`, `DEBUG_STALL`, `PARK_DEBUG` | category diagnostics |
//! | `DEADLOCK_ABORT=0` | do not exit on deadlock detection |

use std::env;

/// Hard upper bound on the number of base workers.
pub const MAX_WORKERS: usize = 64;

/// Fibers executed per worker batch.
pub(crate) const BATCH: usize = 16;

/// Local-only batches between forced global-queue pops. Prime, so the
/// injection point drifts relative to power-of-two queue sizes.
pub(crate) const GLOBAL_POLL_INTERVAL: u32 = 61;

/// Inbox depth at which unpark enqueues divert to the global queue.
pub(crate) const INBOX_OVERLOADED: usize = 64;

/// Heartbeat age beyond which a worker counts as stalled, for both the
/// affinity divert and sysmon's replacement decision.
pub(crate) const ORPHAN_THRESHOLD_NANOS: u64 = 10 * crate::clock::NANOS_PER_MILLI;

/// How long an OWNED fiber may sit without a control-word transition before
/// the stall scanner reports it.
pub(crate) const STALL_THRESHOLD_NANOS: u64 = 5_000 * crate::clock::NANOS_PER_MILLI;

/// How long the deadlock condition must persist before the detector fires.
pub(crate) const DEADLOCK_PERSIST_NANOS: u64 = 1_000 * crate::clock::NANOS_PER_MILLI;

/// Sysmon cadence.
pub(crate) const SYSMON_TICK_MICROS: u64 = 250;

/// Idle time after which a replacement worker retires.
pub(crate) const REPLACEMENT_RETIRE_NANOS: u64 = 1_000 * crate::clock::NANOS_PER_MILLI;

/// Minimum spacing between replacement-worker spawns.
pub(crate) const REPLACEMENT_SPAWN_INTERVAL_NANOS: u64 = 10 * crate::clock::NANOS_PER_MILLI;

/// Worker sleep timeout; bounds the cost of a lost wakeup that slipped past
/// every re-check.
pub(crate) const SLEEP_TIMEOUT_MILLIS: u64 = 500;

/// Scheduler configuration, builder style.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) workers: usize,
    pub(crate) stack_size: usize,
    pub(crate) spin_fast_iters: u32,
    pub(crate) spin_yield_iters: u32,
    pub(crate) sysmon: bool,
    pub(crate) fiber_stats: bool,
    pub(crate) spawn_timing: bool,
    pub(crate) deadlock_abort: bool,
    pub(crate) debug_deadlock: bool,
    pub(crate) debug_join: bool,
    pub(crate) debug_wake: bool,
    pub(crate) debug_sysmon: bool,
    pub(crate) debug_inbox: bool,
    pub(crate) debug_stall: bool,
    pub(crate) park_debug: bool,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS);

        Self {
            workers,
            stack_size: strand::DEFAULT_STACK_SIZE,
            spin_fast_iters: 256,
            spin_yield_iters: 16,
            sysmon: true,
            fiber_stats: false,
            spawn_timing: false,
            deadlock_abort: true,
            debug_deadlock: false,
            debug_join: false,
            debug_wake: false,
            debug_sysmon: false,
            debug_inbox: false,
            debug_stall: false,
            park_debug: false,
        }
    }
}

impl Config {
    /// The default configuration with the environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(workers) = env_usize("WORKERS") {
            cfg.workers = workers.clamp(1, MAX_WORKERS);
        }
        if let Some(iters) = env_usize("SPIN_FAST_ITERS") {
            cfg.spin_fast_iters = u32::try_from(iters).unwrap_or(u32::MAX);
        }
        if let Some(iters) = env_usize("SPIN_YIELD_ITERS") {
            cfg.spin_yield_iters = u32::try_from(iters).unwrap_or(u32::MAX);
        }
        if env::var_os("SYSMON").is_some_and(|v| v == *"0") {
            cfg.sysmon = false;
        }
        if env::var_os("DEADLOCK_ABORT").is_some_and(|v| v == *"0") {
            cfg.deadlock_abort = false;
        }
        cfg.fiber_stats = env_flag("FIBER_STATS");
        cfg.spawn_timing = env_flag("SPAWN_TIMING");
        cfg.debug_deadlock = env_flag("DEBUG_DEADLOCK_RUNTIME");
        cfg.debug_join = env_flag("DEBUG_JOIN");
        cfg.debug_wake = env_flag("DEBUG_WAKE");
        cfg.debug_sysmon = env_flag("DEBUG_SYSMON");
        cfg.debug_inbox = env_flag("DEBUG_INBOX");
        cfg.debug_stall = env_flag("DEBUG_STALL");
        cfg.park_debug = env_flag("PARK_DEBUG");

        cfg
    }

    /// Override the number of base workers.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    /// Override the usable fiber stack size in bytes.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(strand::MIN_STACK_SIZE);
        self
    }

    /// Override the fast-spin iteration count of the idle transition.
    #[must_use]
    pub fn spin_fast_iters(mut self, iters: u32) -> Self {
        self.spin_fast_iters = iters;
        self
    }

    /// Override the yield-spin iteration count of the idle transition.
    #[must_use]
    pub fn spin_yield_iters(mut self, iters: u32) -> Self {
        self.spin_yield_iters = iters;
        self
    }

    /// Enable or disable the sysmon thread.
    #[must_use]
    pub fn sysmon(mut self, enabled: bool) -> Self {
        self.sysmon = enabled;
        self
    }

    /// Whether deadlock detection terminates the process (exit code 124) or
    /// only logs.
    #[must_use]
    pub fn deadlock_abort(mut self, abort: bool) -> Self {
        self.deadlock_abort = abort;
        self
    }

    /// Enable the OWNED-fiber stall scanner.
    #[must_use]
    pub fn debug_stall(mut self, enabled: bool) -> Self {
        self.debug_stall = enabled;
        self
    }

    /// Emit scheduler counters to stderr at shutdown.
    #[must_use]
    pub fn fiber_stats(mut self, enabled: bool) -> Self {
        self.fiber_stats = enabled;
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

fn env_flag(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| !v.is_empty() && v != *"0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.workers >= 1);
        assert!(cfg.workers <= MAX_WORKERS);
        assert!(cfg.sysmon);
        assert!(cfg.deadlock_abort);
    }

    #[test]
    fn builder_clamps() {
        let cfg = Config::default().workers(0);
        assert_eq!(cfg.workers, 1);
        let cfg = Config::default().workers(10_000);
        assert_eq!(cfg.workers, MAX_WORKERS);
    }
}
