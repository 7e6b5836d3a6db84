// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber lifecycle control word.
//!
//! A single atomic `i64` encodes both lifecycle state and exclusive worker
//! ownership:
//!
//! - `IDLE` (0) - in the fiber pool.
//! - `QUEUED` (-1) - present in some run queue, runnable.
//! - `PARKED` (-2) - suspended, stack quiescent, safe to resume.
//! - `DONE` (-4) - completed; joiners may reclaim.
//! - `OWNED(wid)` = `wid + 1` (positive) - the stack is exclusively held by
//!   worker `wid`.
//!
//! At most one worker holds `OWNED` for a given fiber at any moment, and a
//! worker must hold `OWNED` to execute user code on that fiber's stack. All
//! contended transitions are compare-and-swap; the owner releases with plain
//! stores. Every successful transition stamps a timestamp for stall
//! diagnostics.

use crate::loom::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use core::fmt;

const IDLE: i64 = 0;
const QUEUED: i64 = -1;
const PARKED: i64 = -2;
/// Reserved sentinel from a legacy parking protocol. Never stored; kept so
/// the encoding stays compatible with dumps from older builds.
#[allow(dead_code)]
const PARKING: i64 = -3;
const DONE: i64 = -4;

/// Decoded view of the control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ControlState {
    Idle,
    Queued,
    Parked,
    Done,
    Owned(usize),
}

impl ControlState {
    fn decode(raw: i64) -> Self {
        match raw {
            IDLE => Self::Idle,
            QUEUED => Self::Queued,
            PARKED => Self::Parked,
            DONE => Self::Done,
            wid if wid > 0 => Self::Owned(usize::try_from(wid - 1).unwrap_or(usize::MAX)),
            _ => unreachable!("corrupt control word: {raw}"),
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Queued => f.write_str("queued"),
            Self::Parked => f.write_str("parked"),
            Self::Done => f.write_str("done"),
            Self::Owned(wid) => write!(f, "owned({wid})"),
        }
    }
}

pub(crate) struct ControlWord {
    state: AtomicI64,
    /// Timestamp of the last successful transition, scheduler-epoch nanos.
    last_transition: AtomicU64,
}

// === impl ControlWord ===

impl ControlWord {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicI64::new(IDLE),
            last_transition: AtomicU64::new(0),
        }
    }

    fn owned(wid: usize) -> i64 {
        i64::try_from(wid)
            .ok()
            .and_then(|wid| wid.checked_add(1))
            .expect("worker id out of range for the control word")
    }

    /// Current state. SeqCst: reads participate in the Dekker pairs with the
    /// pending-unpark and detach latches.
    pub(crate) fn load(&self) -> ControlState {
        ControlState::decode(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn last_transition(&self) -> u64 {
        self.last_transition.load(Ordering::Relaxed)
    }

    fn stamp(&self, now: u64) {
        self.last_transition.store(now, Ordering::Relaxed);
    }

    /// IDLE -> QUEUED, performed by spawn on a freshly acquired fiber.
    pub(crate) fn try_spawn(&self, now: u64) -> bool {
        let ok = self
            .state
            .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.stamp(now);
        }
        ok
    }

    /// QUEUED -> OWNED(wid), performed by a worker about to resume the fiber.
    ///
    /// Failure means the queue entry was stale (the fiber was concurrently
    /// claimed through a duplicate entry) and must be dropped silently.
    pub(crate) fn try_acquire(&self, wid: usize, now: u64) -> bool {
        let ok = self
            .state
            .compare_exchange(QUEUED, Self::owned(wid), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.stamp(now);
        }
        ok
    }

    /// OWNED(wid) -> QUEUED, owner release on a cooperative yield.
    pub(crate) fn release_queued(&self, wid: usize, now: u64) {
        let prev = self.state.swap(QUEUED, Ordering::AcqRel);
        debug_assert_eq!(prev, Self::owned(wid), "released a fiber we don't own");
        self.stamp(now);
    }

    /// OWNED(wid) -> PARKED, the park commit. SeqCst: this store is one half
    /// of the Dekker pair with `unpark`'s pending-latch store.
    pub(crate) fn commit_parked(&self, wid: usize, now: u64) {
        self.state
            .compare_exchange(Self::owned(wid), PARKED, Ordering::SeqCst, Ordering::SeqCst)
            .expect("park commit raced: fiber not owned by this worker");
        self.stamp(now);
    }

    /// PARKED -> QUEUED, performed by unpark (or the post-commit undo).
    pub(crate) fn try_unpark(&self, now: u64) -> bool {
        let ok = self
            .state
            .compare_exchange(PARKED, QUEUED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            self.stamp(now);
        }
        ok
    }

    /// OWNED(wid) -> DONE, owner release after the fiber returned.
    ///
    /// SeqCst: paired with the detach latch, so either the worker sees the
    /// detached flag or the handle-dropper sees DONE.
    pub(crate) fn release_done(&self, wid: usize, now: u64) {
        let prev = self.state.swap(DONE, Ordering::SeqCst);
        debug_assert_eq!(prev, Self::owned(wid), "released a fiber we don't own");
        self.stamp(now);
    }

    /// DONE -> IDLE, the reclaim claim. Exactly one caller (joiner, detached
    /// handle drop, or the completion path of a detached fiber) wins.
    pub(crate) fn try_reclaim(&self, now: u64) -> bool {
        let ok = self
            .state
            .compare_exchange(DONE, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            self.stamp(now);
        }
        ok
    }
}

impl fmt::Debug for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlWord")
            .field("state", &self.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn transition_dag() {
        loom::model(|| {
            let c = ControlWord::new();
            assert_eq!(c.load(), ControlState::Idle);

            assert!(c.try_spawn(1));
            assert_eq!(c.load(), ControlState::Queued);

            // a second spawn attempt must fail
            assert!(!c.try_spawn(2));

            assert!(c.try_acquire(3, 3));
            assert_eq!(c.load(), ControlState::Owned(3));

            c.commit_parked(3, 4);
            assert_eq!(c.load(), ControlState::Parked);

            assert!(c.try_unpark(5));
            assert!(!c.try_unpark(6));

            assert!(c.try_acquire(0, 7));
            c.release_done(0, 8);
            assert_eq!(c.load(), ControlState::Done);

            assert!(c.try_reclaim(9));
            assert_eq!(c.load(), ControlState::Idle);
        });
    }

    #[test]
    fn exclusive_ownership() {
        // Two workers race QUEUED -> OWNED; exactly one may win.
        loom::model(|| {
            let c = Arc::new(ControlWord::new());
            assert!(c.try_spawn(0));

            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..2)
                .map(|wid| {
                    let c = Arc::clone(&c);
                    let wins = Arc::clone(&wins);
                    loom::thread::spawn(move || {
                        if c.try_acquire(wid, 1) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn stale_queue_entries_fail_acquire() {
        loom::model(|| {
            let c = ControlWord::new();
            assert!(c.try_spawn(0));
            assert!(c.try_acquire(0, 1));
            // the duplicate entry's acquire fails silently
            assert!(!c.try_acquire(1, 2));
        });
    }
}
