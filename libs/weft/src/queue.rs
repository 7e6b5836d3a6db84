// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The run-queue family.
//!
//! Four kinds of queues hold runnable fibers:
//!
//! - [`LocalQueue`] - one per worker; single producer (the owner), multiple
//!   consumers (the owner pops, other workers steal).
//! - [`Ring`] - a bounded MPMC ring, used for the per-worker inboxes and as
//!   the fast path of the global queue.
//! - [`GlobalQueue`] - the MPMC ring plus a mutex-guarded overflow list, so
//!   a push never fails.
//! - [`SleepQueue`] - a mutex-guarded list of sleeping fibers drained by
//!   sysmon and by idling workers.
//!
//! A queue entry is just a task pointer; a fiber appears in at most one
//! queue at a time, and stale entries (a fiber re-enqueued through a race)
//! are detected at dequeue time by the failing QUEUED -> OWNED CAS and
//! dropped silently.

pub(crate) mod global;
pub(crate) mod local;
pub(crate) mod ring;
pub(crate) mod sleep;

pub(crate) use global::GlobalQueue;
pub(crate) use local::LocalQueue;
pub(crate) use ring::Ring;
pub(crate) use sleep::SleepQueue;
