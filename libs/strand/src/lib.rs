// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![feature(asm_unwind)]

//! Stackful coroutines on guard-paged stacks.
//!
//! This crate provides [`Strand`], a one-shot stackful coroutine: a function
//! running on its own [`StrandStack`] that can suspend itself with
//! [`Yielder::suspend`] and be driven with [`Strand::resume`]. It is the
//! context-switch primitive underneath the `weft` fiber scheduler.
//!
//! The switching code is heavily based off of [`corosensei`] by Amanieu
//! d'Antras, with two departures that matter for a scheduler:
//!
//! - a finished strand can be [rebound](Strand::rebind) to a new entry
//!   function, reinitialising the register context on the retained stack
//!   without touching the allocator or the kernel, and
//! - a suspended strand may be sent to another thread (see the `Send`
//!   contract below), which is what lets workers steal each other's fibers.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

mod arch;
mod frame;
pub mod stack;

use crate::frame::RawValue;
use crate::stack::StackPointer;
use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr;

pub use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE, STACK_ALIGNMENT, StrandStack};

/// Value returned from resuming a strand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrandResult<Out, Ret> {
    /// Value passed by the strand suspending itself through its [`Yielder`].
    Yield(Out),

    /// Value returned by the strand's entry function.
    Return(Ret),
}

impl<Out, Ret> StrandResult<Out, Ret> {
    /// Returns the `Yield` value, if any.
    pub fn into_yield(self) -> Option<Out> {
        match self {
            StrandResult::Yield(val) => Some(val),
            StrandResult::Return(_) => None,
        }
    }

    /// Returns the `Return` value, if any.
    pub fn into_return(self) -> Option<Ret> {
        match self {
            StrandResult::Yield(_) => None,
            StrandResult::Return(val) => Some(val),
        }
    }
}

/// Externally observable lifecycle of a strand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrandStatus {
    /// Bound to an entry function but never resumed.
    Unstarted,
    /// Suspended in its entry function or in a `suspend` call; resumable.
    Suspended,
    /// The entry function returned; the strand must be rebound before the
    /// next resume.
    Finished,
}

/// A stackful coroutine bound to a guard-paged stack.
///
/// `In` flows into the strand on every [`resume`](Self::resume), `Out` flows
/// out on every [`Yielder::suspend`], and `Ret` flows out when the entry
/// function returns.
pub struct Strand<In: 'static, Out: 'static, Ret: 'static> {
    /// The stack this strand executes on. Retained across rebinds; leaked
    /// (not unmapped) if the strand is dropped while suspended, since live
    /// frames may still reference it.
    stack: ManuallyDrop<StrandStack>,
    /// Suspended stack pointer holding the strand's register state. `None`
    /// once the entry function has returned.
    stack_ptr: Option<StackPointer>,
    /// Stack pointer value produced by the last (re)bind. A strand can never
    /// revert to it (suspending pushes state), so comparing against it tells
    /// us whether the strand has ever been resumed.
    initial_stack_ptr: StackPointer,
    /// Covariant over `Out` and `Ret`, contravariant over `In`.
    _m: PhantomData<fn(In) -> StrandResult<Out, Ret>>,
}

// Safety: a suspended strand is register state plus stack memory, neither of
// which is tied to the current thread. Moving one across threads is sound
// only if every value alive across the suspension point is `Send`; the
// compiler cannot see through the stack, so this contract is enforced by the
// embedding scheduler, which requires `Send` entry closures and `Send`
// yield/resume values. Entry functions are bound with `F: Send` below for the
// same reason.
unsafe impl<In: Send, Out: Send, Ret: Send> Send for Strand<In, Out, Ret> {}

impl<In, Out, Ret> Strand<In, Out, Ret>
where
    In: 'static,
    Out: 'static,
    Ret: 'static,
{
    /// Creates a new strand running `func` on `stack`.
    pub fn new<F>(stack: StrandStack, func: F) -> Self
    where
        F: FnOnce(In, &Yielder<In, Out>) -> Ret + Send + 'static,
    {
        let stack_ptr = Self::bind_stack(&stack, func);

        Self {
            stack: ManuallyDrop::new(stack),
            stack_ptr: Some(stack_ptr),
            initial_stack_ptr: stack_ptr,
            _m: PhantomData,
        }
    }

    /// Rebinds a finished strand to a new entry function.
    ///
    /// This is the reuse fast path: only the initial register frame and the
    /// entry object are written to the retained stack; there is no unmapping,
    /// mapping, or heap traffic involved.
    ///
    /// # Panics
    ///
    /// Panics if the strand has been started but has not finished (its stack
    /// would still hold live frames).
    pub fn rebind<F>(&mut self, func: F)
    where
        F: FnOnce(In, &Yielder<In, Out>) -> Ret + Send + 'static,
    {
        assert!(
            self.done() || !self.started(),
            "cannot rebind a strand that is still suspended"
        );

        let stack_ptr = Self::bind_stack(&self.stack, func);
        self.stack_ptr = Some(stack_ptr);
        self.initial_stack_ptr = stack_ptr;
    }

    fn bind_stack<F>(stack: &StrandStack, func: F) -> StackPointer
    where
        F: FnOnce(In, &Yielder<In, Out>) -> Ret + Send + 'static,
    {
        unsafe extern "C-unwind" fn strand_entry<In, Out, Ret, F>(
            input: RawValue,
            parent_link: &mut StackPointer,
            obj: *mut MaybeUninit<F>,
        ) -> !
        where
            F: FnOnce(In, &Yielder<In, Out>) -> Ret,
        {
            // Safety: init_stack placed a properly aligned `MaybeUninit<F>`
            // at `obj`, and the parent link this entry receives is the slot
            // the Yielder is a transparent wrapper around.
            unsafe {
                let yielder = &*(ptr::from_mut(parent_link).cast::<Yielder<In, Out>>());

                debug_assert_eq!(obj as usize % align_of::<F>(), 0);
                let func = (*obj).assume_init_read();

                let input: In = frame::unpack(input);

                let result = func(input, yielder);

                // Hand the return value to the parent context and mark the
                // strand finished by reporting a null stack pointer.
                let mut result = ManuallyDrop::new(result);
                arch::switch_and_reset(frame::pack(&mut result), yielder.stack_ptr.as_ptr());
            }
        }

        // Safety: the stack is freshly bound (or verified finished by the
        // caller), so we have exclusive access to its memory.
        unsafe {
            arch::init_stack(
                stack,
                strand_entry::<In, Out, Ret, F>,
                MaybeUninit::new(func),
            )
        }
    }

    /// Resumes the strand, passing `input` to it.
    ///
    /// `input` is returned from the `suspend` call the strand is blocked in
    /// (or passed as the entry argument on the first resume).
    ///
    /// # Panics
    ///
    /// Panics if the strand has already finished.
    pub fn resume(&mut self, input: In) -> StrandResult<Out, Ret> {
        let mut input = ManuallyDrop::new(input);

        let stack_ptr = self
            .stack_ptr
            .take()
            .expect("attempt to resume a finished strand");

        // Safety: `stack_ptr` was produced by init_stack or a previous
        // suspension on this stack, which we own exclusively.
        unsafe {
            let (result, stack_ptr) =
                arch::switch_and_link(frame::pack(&mut input), stack_ptr, self.stack.top());

            self.stack_ptr = stack_ptr;

            if stack_ptr.is_some() {
                StrandResult::Yield(frame::unpack(result))
            } else {
                StrandResult::Return(frame::unpack(result))
            }
        }
    }

    /// Returns whether this strand has been resumed since its last (re)bind.
    pub fn started(&self) -> bool {
        self.stack_ptr != Some(self.initial_stack_ptr)
    }

    /// Returns whether the entry function has returned.
    pub fn done(&self) -> bool {
        self.stack_ptr.is_none()
    }

    /// Externally observable lifecycle state.
    pub fn status(&self) -> StrandStatus {
        if self.done() {
            StrandStatus::Finished
        } else if self.started() {
            StrandStatus::Suspended
        } else {
            StrandStatus::Unstarted
        }
    }

    /// Usable size of the underlying stack, for diagnostics.
    pub fn stack_size(&self) -> usize {
        self.stack.usable_size()
    }
}

impl<In, Out, Ret> Drop for Strand<In, Out, Ret> {
    fn drop(&mut self) {
        // A suspended strand still has live frames on its stack; unmapping
        // underneath them is unsound, so the mapping is leaked instead. This
        // is only reachable when a scheduler tears down with fibers that
        // never completed. An unstarted strand leaks its entry object (its
        // destructor never runs) but the mapping itself is safe to release.
        if self.started() && !self.done() {
            return;
        }
        // Safety: single drop site, strand holds no live frames.
        unsafe { ManuallyDrop::drop(&mut self.stack) }
    }
}

/// The suspend side of a strand, available to its entry function.
///
/// Internally this is a transparent wrapper around the parent-link slot on
/// the strand stack, which is rewritten on every resume.
#[repr(transparent)]
pub struct Yielder<In, Out> {
    stack_ptr: Cell<StackPointer>,
    marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Yielder<In, Out> {
    /// Suspends the calling strand, passing `val` out of the pending
    /// [`Strand::resume`] call.
    pub fn suspend(&self, val: Out) -> In {
        // Safety: only callable from inside a running strand, where the
        // parent link is valid by construction.
        unsafe {
            let mut val = ManuallyDrop::new(val);
            let result = arch::switch_yield(frame::pack(&mut val), self.stack_ptr.as_ptr());

            frame::unpack(result)
        }
    }
}
