// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker wake primitive: a one-shot wake over an atomic counter.
//!
//! A sleeper snapshots the counter, re-checks its business condition (the
//! run queues), and then blocks *against that snapshot*; any wake that bumps
//! the counter after the snapshot makes the wait return immediately, so no
//! wakeup can be lost between the last poll and the block. Producers must
//! publish their work (queue push) *before* bumping the counter.
//!
//! Backed by a futex on Linux; a mutex+condvar with the counter advanced
//! under the lock everywhere else.

use cfg_if::cfg_if;
use core::time::Duration;

cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), not(loom)))] {
        use core::sync::atomic::{AtomicU32, Ordering};

        pub(crate) struct WakeCounter {
            counter: AtomicU32,
        }

        // === impl WakeCounter ===

        impl WakeCounter {
            pub(crate) fn new() -> Self {
                Self { counter: AtomicU32::new(0) }
            }

            /// Snapshot to later wait against.
            pub(crate) fn value(&self) -> u32 {
                self.counter.load(Ordering::SeqCst)
            }

            /// Blocks until woken, the timeout expires, or the counter no
            /// longer equals `snapshot`. Spurious returns are allowed.
            pub(crate) fn wait_timeout(&self, snapshot: u32, timeout: Duration) {
                if self.counter.load(Ordering::SeqCst) != snapshot {
                    return;
                }

                let ts = libc::timespec {
                    tv_sec: libc::time_t::try_from(timeout.as_secs())
                        .unwrap_or(libc::time_t::MAX),
                    tv_nsec: timeout.subsec_nanos() as libc::c_long,
                };

                // Safety: FUTEX_WAIT on our own aligned u32; the kernel
                // re-checks the value against `snapshot` atomically, which is
                // what makes the snapshot protocol airtight.
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.counter.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        snapshot,
                        &raw const ts,
                    );
                }
            }

            /// Bumps the counter and wakes one sleeper.
            pub(crate) fn wake_one(&self) {
                self.counter.fetch_add(1, Ordering::SeqCst);
                self.futex_wake(1);
            }

            /// Bumps the counter and wakes every sleeper.
            pub(crate) fn wake_all(&self) {
                self.counter.fetch_add(1, Ordering::SeqCst);
                self.futex_wake(i32::MAX);
            }

            fn futex_wake(&self, n: i32) {
                // Safety: FUTEX_WAKE takes no pointer arguments beyond ours.
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.counter.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        n,
                    );
                }
            }
        }
    } else {
        use crate::loom::sync::atomic::{AtomicU32, Ordering};
        use crate::loom::sync::{Condvar, Mutex};

        pub(crate) struct WakeCounter {
            counter: AtomicU32,
            lock: Mutex<()>,
            cv: Condvar,
        }

        // === impl WakeCounter ===

        impl WakeCounter {
            pub(crate) fn new() -> Self {
                Self {
                    counter: AtomicU32::new(0),
                    lock: Mutex::new(()),
                    cv: Condvar::new(),
                }
            }

            /// Snapshot to later wait against.
            pub(crate) fn value(&self) -> u32 {
                self.counter.load(Ordering::SeqCst)
            }

            /// Blocks until woken, the timeout expires, or the counter no
            /// longer equals `snapshot`. Spurious returns are allowed.
            ///
            /// The counter re-check happens under the lock: a producer bumps
            /// under the same lock, so it either loses the race (we see the
            /// bump and return) or its notify lands after we started waiting.
            pub(crate) fn wait_timeout(&self, snapshot: u32, timeout: Duration) {
                let guard = self.lock.lock().expect("wake mutex poisoned");
                if self.counter.load(Ordering::SeqCst) != snapshot {
                    return;
                }

                cfg_if! {
                    if #[cfg(loom)] {
                        // loom has no timed waits; the model never needs the
                        // timeout to make progress.
                        let _ = timeout;
                        let _ = self.cv.wait(guard);
                    } else {
                        let _ = self.cv.wait_timeout(guard, timeout);
                    }
                }
            }

            /// Bumps the counter and wakes one sleeper.
            pub(crate) fn wake_one(&self) {
                {
                    let _guard = self.lock.lock().expect("wake mutex poisoned");
                    self.counter.fetch_add(1, Ordering::SeqCst);
                }
                self.cv.notify_one();
            }

            /// Bumps the counter and wakes every sleeper.
            pub(crate) fn wake_all(&self) {
                {
                    let _guard = self.lock.lock().expect("wake mutex poisoned");
                    self.counter.fetch_add(1, Ordering::SeqCst);
                }
                self.cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn wake_before_wait_returns_immediately() {
        let wake = WakeCounter::new();
        let snapshot = wake.value();
        wake.wake_one();
        // must not block
        wake.wait_timeout(snapshot, Duration::from_secs(60));
    }

    #[cfg(not(loom))]
    #[test]
    fn timeout_elapses() {
        use std::time::Instant;

        let wake = WakeCounter::new();
        let snapshot = wake.value();
        let start = Instant::now();
        wake.wait_timeout(snapshot, Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[cfg(not(loom))]
    #[test]
    fn cross_thread_wake() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let wake = Arc::new(WakeCounter::new());
        let flag = Arc::new(AtomicBool::new(false));

        let sleeper = {
            let wake = Arc::clone(&wake);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                loop {
                    let snapshot = wake.value();
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    wake.wait_timeout(snapshot, Duration::from_secs(10));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        wake.wake_one();

        sleeper.join().unwrap();
    }

    /// Model the no-lost-wakeup property: publish-then-bump on one side,
    /// snapshot-check-wait on the other.
    #[cfg(all(loom, test))]
    #[test]
    fn no_lost_wakeup() {
        crate::loom::model(|| {
            use crate::loom::sync::Arc;
            use crate::loom::sync::atomic::{AtomicBool, Ordering};

            let wake = Arc::new(WakeCounter::new());
            let published = Arc::new(AtomicBool::new(false));

            let producer = {
                let wake = Arc::clone(&wake);
                let published = Arc::clone(&published);
                crate::loom::thread::spawn(move || {
                    published.store(true, Ordering::SeqCst);
                    wake.wake_one();
                })
            };

            let snapshot = wake.value();
            if !published.load(Ordering::SeqCst) {
                wake.wait_timeout(snapshot, Duration::from_secs(1));
            }
            assert!(published.load(Ordering::SeqCst) || wake.value() != snapshot);

            producer.join().unwrap();
        });
    }
}
