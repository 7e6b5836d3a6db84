// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// An opaque ID identifying a fiber slot within its scheduler.
///
/// # Notes
///
/// - IDs are assigned monotonically when the slot is first allocated and are
///   *stable across pool reuse*: a recycled fiber keeps the ID of its slot.
///   They identify memory for diagnostics, not logical spawns.
/// - IDs are only unique within one [`Scheduler`](crate::Scheduler).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
