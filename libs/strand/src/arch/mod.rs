// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-architecture stack initialisation and context switching.
//!
//! Each backend provides the same surface:
//!
//! - `STACK_ALIGNMENT` - the hardware-required stack alignment.
//! - `init_stack` - lay out a fresh (or rebound) stack so the first
//!   `switch_and_link` lands in the entry trampoline.
//! - `switch_and_link` - resume a suspended strand, linking the stacks so
//!   unwinders can walk from the strand into its parent.
//! - `switch_yield` - suspend the running strand back to its parent.
//! - `switch_and_reset` - final switch out of a finished strand; reports a
//!   null stack pointer so the caller knows the strand is done.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("unsupported target architecture");
    }
}
