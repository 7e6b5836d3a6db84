// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Always-on relaxed counters, reported to stderr at shutdown when
//! `FIBER_STATS` or `SPAWN_TIMING` is set.

use crate::config::Config;
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) spawned: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) stolen_tasks: AtomicU64,
    pub(crate) parks: AtomicU64,
    pub(crate) unparks: AtomicU64,
    pub(crate) inbox_overflows: AtomicU64,
    pub(crate) replacements_spawned: AtomicU64,
    pub(crate) sleep_drained: AtomicU64,
    pub(crate) spawn_nanos: AtomicU64,
}

// === impl Stats ===

impl Stats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn report(&self, config: &Config) {
        let spawned = self.spawned.load(Ordering::Relaxed);

        if config.fiber_stats {
            eprintln!(
                "weft: fibers spawned={spawned} completed={} parks={} unparks={} \
                 steals={} stolen_tasks={} inbox_overflows={} replacements={} sleep_drained={}",
                self.completed.load(Ordering::Relaxed),
                self.parks.load(Ordering::Relaxed),
                self.unparks.load(Ordering::Relaxed),
                self.steals.load(Ordering::Relaxed),
                self.stolen_tasks.load(Ordering::Relaxed),
                self.inbox_overflows.load(Ordering::Relaxed),
                self.replacements_spawned.load(Ordering::Relaxed),
                self.sleep_drained.load(Ordering::Relaxed),
            );
        }

        if config.spawn_timing && spawned > 0 {
            let total = self.spawn_nanos.load(Ordering::Relaxed);
            eprintln!(
                "weft: spawn timing: {spawned} spawns, {} ns avg",
                total / spawned
            );
        }
    }
}
