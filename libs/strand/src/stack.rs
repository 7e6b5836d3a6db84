// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guard-paged stacks for strands.
//!
//! A [`StrandStack`] is an anonymous mapping with an inaccessible guard page
//! at its low end, so running off the end of the stack faults instead of
//! silently corrupting adjacent memory. The mapping is retained for the
//! lifetime of the stack and is intended to be pooled by the embedding
//! scheduler; rebinding a finished strand reuses it without any syscalls.

use std::io::Error;
use std::ptr;

pub(crate) type StackPointer = core::num::NonZeroUsize;

/// Minimum usable size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 4096;

/// Default usable size of a stack, excluding the guard page.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

pub use crate::arch::STACK_ALIGNMENT;

/// A guard-paged, page-aligned stack allocation.
pub struct StrandStack {
    top: StackPointer,
    mmap_len: usize,
}

// Safety: the mapping is plain memory; whoever holds the `StrandStack` has
// exclusive use of it.
unsafe impl Send for StrandStack {}

impl StrandStack {
    /// Maps a new stack with at least `size` usable bytes plus a guard page.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the address space reservation or
    /// the protection change fails.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Add the guard page to the requested size and round up to a page
        // boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no aliasing concerns; error paths checked.
        unsafe {
            // Reserve the address space with no access rights at all.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Construct the result first so the mapping is released if the
            // mprotect below fails.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len)
                    .expect("mmap returned a mapping ending at address zero"),
                mmap_len,
            };

            // Make everything except the lowest page (the guard) accessible.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Highest address of the stack. Aligned to [`STACK_ALIGNMENT`].
    #[inline]
    pub fn top(&self) -> StackPointer {
        self.top
    }

    /// Lowest address of the mapping, including the guard page.
    #[inline]
    pub fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len)
            .expect("stack mapping wrapped the address space")
    }

    /// Usable size of the stack, excluding the guard page.
    pub fn usable_size(&self) -> usize {
        self.mmap_len - page_size()
    }
}

impl Default for StrandStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for StrandStack {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing may reference it once the
        // stack is dropped.
        unsafe {
            let mmap = self.top.get() - self.mmap_len;
            let ret = libc::munmap(mmap as *mut libc::c_void, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).expect("negative page size");
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_bounds() {
        let stack = StrandStack::new(64 * 1024).unwrap();
        assert!(stack.top().get() > stack.bottom().get());
        assert_eq!(stack.top().get() % STACK_ALIGNMENT, 0);
        assert!(stack.usable_size() >= 64 * 1024);
    }

    #[test]
    fn minimum_is_applied() {
        let stack = StrandStack::new(1).unwrap();
        assert!(stack.usable_size() >= MIN_STACK_SIZE);
    }
}
