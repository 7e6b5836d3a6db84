// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 SysV backend.
//!
//! Suspended-strand stack layout, growing downwards:
//!
//! ```text
//! +--------------+  <- stack top
//! | Entry func   |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! ~     ...      ~
//! +--------------+
//! | Saved RIP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! ```
//!
//! The parent link is rewritten on every switch into the strand and is what
//! `switch_yield` and `switch_and_reset` return through. RBX and RBP are the
//! two callee-saved registers LLVM reserves, so they are moved by hand; the
//! rest are clobbers on the `asm!` blocks.

use crate::frame::{FrameWriter, RawValue};
use crate::stack::{StackPointer, StrandStack};
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

/// Prepares `stack` so that the next `switch_and_link` enters `func` through
/// the init trampoline, with `obj` placed on the strand stack.
#[inline]
pub unsafe fn init_stack<T>(
    stack: &StrandStack,
    func: unsafe extern "C-unwind" fn(arg: RawValue, sp: &mut StackPointer, obj: *mut T) -> !,
    obj: T,
) -> StackPointer {
    let mut frame = FrameWriter::new(stack.top());

    // Safety: a fresh stack easily fits the initial frame.
    unsafe {
        // Entry function, read and jumped to by stack_init_trampoline().
        frame.word(func as usize);
        // Parent link, rewritten by every switch into the strand.
        frame.word(0);
        // The entry object, placed back on an alignment boundary.
        frame.entry_obj(obj);
        // Address called by switch_and_link() during the initial switch.
        frame.word(stack_init_trampoline as usize);
    }

    frame.finish()
}

#[unsafe(naked)]
pub(crate) extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        ".cfi_startproc",
        // Entered via the CALL in switch_and_link() the first time a strand is
        // resumed. Register state on entry:
        // - RSP: top of the parent stack
        // - RBP: parent frame pointer
        // - RDX: top of the strand stack
        // - RSI: base of the strand stack
        // - RDI: argument from switch_and_link
        //
        // Complete the parent frame record (RBP + the return address pushed by
        // CALL) so the frame-pointer chain stays intact.
        "push rbp",
        // Fill in the parent link near the base of our stack.
        "mov [rsi - 16], rsp",
        // Turn the stack-base argument into a pointer to the parent link for
        // the entry function's second parameter.
        "sub rsi, 16",
        // Switch to the strand stack, skipping the trampoline address.
        "lea rsp, [rdx + 8]",
        // Frame pointer points at the parent link; the CFA expression below
        // reads it back from there.
        "mov rbp, rsi",
        // Teach the unwinder where the parent's Canonical Frame Address lives:
        // deref RBP (the parent link), then skip the 3 words saved on the
        // parent stack.
        ".cfi_escape 0x0f,  /* DW_CFA_def_cfa_expression */\
        5,                  /* expression length */\
        0x76, 0x00,         /* DW_OP_breg6 (rbp + 0) */\
        0x06,               /* DW_OP_deref */\
        0x23, 0x18          /* DW_OP_plus_uconst 24 */",
        ".cfi_offset rbx, -8",
        ".cfi_offset rip, -16",
        ".cfi_offset rbp, -24",
        // Third argument: the entry object placed on the stack by init_stack().
        "mov rdx, rsp",
        // Hand-write the call so a later RET in switch_yield/switch_and_reset
        // doesn't desync the CPU's return predictor (which is also why those
        // are #[inline(always)]).
        "lea rcx, [rip + 2f]",
        "push rcx",
        // The entry function address sits just above the parent link.
        "jmp [rsi + 8]",
        // Never reached: the entry function is divergent.
        "2:",
        ".cfi_endproc",
    }
}

/// Switches to a suspended strand, storing a link back to the current stack
/// so the two stacks form an unwinder-walkable chain.
///
/// Returns the value passed by the strand and its new suspended stack
/// pointer, or `None` if the strand ran to completion.
#[inline]
pub unsafe fn switch_and_link(
    arg0: RawValue,
    sp: StackPointer,
    top_of_stack: StackPointer,
) -> (RawValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: inline assembly
    unsafe {
        asm! {
            // RBX is an LLVM-reserved register, save it by hand. RBP is pushed
            // on the other side of the CALL so a frame record forms.
            "push rbx",

            // DW_CFA_GNU_args_size 0: neutralise any args_size the enclosing
            // function may have set before this pseudo-call.
            ".cfi_escape 0x2e, 0x00",

            // Push our return address and enter the strand: either
            // stack_init_trampoline or the 2: label in switch_yield.
            "call [rdx]",

            // Back from the strand. RSI holds its suspended stack top (0 if it
            // finished), RDI the value it passed out.
            "pop rbx",

            // RDI doubles as the first-argument register of the ABI, so the
            // value flows straight through to the strand entry.
            inlateout("rdi") arg0 => ret_val,
            lateout("rsi") ret_sp,
            // The strand's entry reads its stack base from RSI on the first
            // switch; afterwards the register is just the return slot above.
            in("rsi") top_of_stack.get() as u64,
            // Target stack pointer; must match the register switch_yield uses.
            in("rdx") sp.get() as u64,
            // Everything except the hand-saved RBX/RBP is a clobber.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the running strand, returning control to `switch_and_link` in the
/// parent context. Returns the value the parent passes back on next resume.
#[inline(always)]
pub unsafe fn switch_yield(arg: RawValue, parent_link: *mut StackPointer) -> RawValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save the two LLVM-reserved callee-saved registers.
            "push rbp",
            "push rbx",

            // Resume address for the next switch_and_link.
            "lea rax, [rip + 2f]",
            "push rax",

            // Report our suspended stack pointer through RSI and jump back to
            // the parent context.
            "mov rsi, rsp",
            "mov rsp, [rdx]",
            "pop rbp",
            ".cfi_escape 0x2e, 0x00",
            "ret",

            // Re-entry point used by switch_and_link. Register state matches
            // the stack_init_trampoline entry comment.
            "2:",
            "push rbp",
            "mov [rsi - 16], rsp",
            "lea rsp, [rdx + 8]",
            "pop rbx",
            "pop rbp",

            inlateout("rdi") arg => ret_val,
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    ret_val
}

/// Final switch out of a finished strand. Reports a null stack pointer so the
/// parent knows the strand is done; the stack can be rebound afterwards.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: RawValue, parent_link: *mut StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "mov rsp, [{parent_link}]",
            "pop rbp",
            // The top of the parent stack holds the return address generated
            // by the CALL in switch_and_link().
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // Null stack pointer = strand finished.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
