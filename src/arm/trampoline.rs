//! Exception hook that dumps the call chain of the code that faulted.
//!
//! An abort handler runs in its own processor mode with its own banked SP and
//! LR, so the faulting code's stack cannot be walked from there. Instead the
//! handler records the faulting return address, points its exception return
//! at [`btrace_exception_hook`] and returns: the hook then runs in the mode of
//! the faulting code, on its registers.
//!
//! ```text
//! data_abort_handler:
//!     sub   lr, lr, #8
//!     ldr   r0, =btrace_exception_lr
//!     str   lr, [r0]                   @ faulting instruction
//!     ldr   lr, =btrace_exception_hook
//!     movs  pc, lr                     @ return into the hook
//! ```
//!
//! The hook stores fp, sp and lr of the faulting code and the recorded return
//! address as the first [`StackFrame`], switches to a private stack, walks with
//! the registered default output and finally loads PC from
//! `btrace_hook_lr`, which is 0 (the reset vector) unless set through
//! [`set_continuation_address`].
//!
//! Nothing here is re-entrant: a fault taken while the hook runs overwrites
//! the state of the first one.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::{arch::global_asm, cell::UnsafeCell};

use crate::{
    config::{CodeBounds, HOOK_STACK_SIZE},
    memory::TargetMemory,
    stacktrace::{StackFrame, StackTrace},
};

/// A cell at a fixed, exported address, written from assembly.
#[repr(transparent)]
pub struct LinkageCell<T>(UnsafeCell<T>);

// SAFETY: The cells are only touched by the single execution context that runs
// the exception hook; concurrent faults are not supported.
unsafe impl<T: Send> Sync for LinkageCell<T> {}

impl<T> LinkageCell<T> {
    const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }
}

impl<T: Copy> LinkageCell<T> {
    fn get(&self) -> T {
        // SAFETY: See the `Sync` impl.
        unsafe { core::ptr::read_volatile(self.0.get()) }
    }

    fn set(&self, value: T) {
        // SAFETY: See the `Sync` impl.
        unsafe { core::ptr::write_volatile(self.0.get(), value) }
    }
}

/// Return address of the faulting code, written by the abort handler.
#[unsafe(export_name = "btrace_exception_lr")]
pub static EXCEPTION_LR: LinkageCell<u32> = LinkageCell::new(0);

/// Where the hook continues once the walk is done. 0 is the reset vector.
#[unsafe(export_name = "btrace_hook_lr")]
pub static HOOK_LR: LinkageCell<u32> = LinkageCell::new(0);

/// SP of the faulting code, restored before leaving the hook.
#[unsafe(export_name = "btrace_exception_sp")]
static EXCEPTION_SP: LinkageCell<u32> = LinkageCell::new(0);

/// First frame of the walk, filled in by the hook.
static EXCEPTION_FRAME: LinkageCell<StackFrame> = LinkageCell::new(StackFrame { fp: 0, sp: 0, lr: 0, pc: 0 });

/// Private stack of the walk. Whole `u64`s keep it 8-byte aligned for calls.
static HOOK_STACK: LinkageCell<[u64; HOOK_STACK_SIZE / 8]> = LinkageCell::new([0; HOOK_STACK_SIZE / 8]);

/// Records the address the hook reports as the faulting PC. An alternative
/// to storing `btrace_exception_lr` from the abort handler's assembly.
pub fn set_fault_return_address(address: u32) {
    EXCEPTION_LR.set(address);
}

/// Sets the address the hook jumps to after the walk, e.g. the faulting
/// instruction to retry it or an idle loop to halt.
pub fn set_continuation_address(address: u32) {
    HOOK_LR.set(address);
}

/// The frame the last exception hook walked from.
pub fn exception_frame() -> StackFrame {
    EXCEPTION_FRAME.get()
}

/// The SP of the code that took the last fault.
pub fn exception_sp() -> u32 {
    EXCEPTION_SP.get()
}

/// Body of the exception hook, called on the private hook stack.
#[unsafe(no_mangle)]
extern "C" fn btrace_exception_walk() {
    let mut frame = exception_frame();
    log::error!("Exception at {:08X}, SP {:08X}, dumping stack trace with {frame}", frame.pc, exception_sp());

    // SAFETY: The faulting code's stack and the code it ran are the only
    // memory the walk reads.
    let memory = unsafe { TargetMemory::new() };
    let summary = StackTrace::walk_with_default_output(&mut frame, memory, CodeBounds::from_linker());

    log::error!("Stack trace done: {} frames, {:?}", summary.frames, summary.termination);
}

unsafe extern "C" {
    /// Entry of the exception hook. Never returns to its caller: control
    /// continues at the address in `btrace_hook_lr`.
    ///
    /// # Safety
    ///
    /// Must be entered by an exception return or a jump with the faulting
    /// code's sp, lr and fp live, after `btrace_exception_lr` was written.
    pub fn btrace_exception_hook() -> !;
}

global_asm!(
    r#"
    .section .text.btrace_exception_hook, "ax"
    .global btrace_exception_hook
    .type btrace_exception_hook, %function
    .arm
    .balign 4
btrace_exception_hook:
    ldr   ip, ={exception_sp}
    str   sp, [ip]                      // exception SP
    ldr   ip, ={frame}
    str   fp, [ip, #0]                  // frame.fp
    str   sp, [ip, #4]                  // frame.sp
    str   lr, [ip, #8]                  // frame.lr
    ldr   lr, ={exception_lr}
    ldr   lr, [lr]
    str   lr, [ip, #12]                 // frame.pc = faulting return address
    ldr   sp, ={stack}
    add   sp, sp, #{stack_size}         // private stack, full descending
    bl    {walk}
    ldr   sp, ={exception_sp}
    ldr   sp, [sp]                      // restore the faulting SP
    ldr   ip, ={hook_lr}
    ldr   pc, [ip]                      // continue at the hook LR
    b     .
    .ltorg
    .size btrace_exception_hook, . - btrace_exception_hook
    "#,
    exception_sp = sym EXCEPTION_SP,
    frame = sym EXCEPTION_FRAME,
    exception_lr = sym EXCEPTION_LR,
    hook_lr = sym HOOK_LR,
    stack = sym HOOK_STACK,
    stack_size = const HOOK_STACK_SIZE,
    walk = sym btrace_exception_walk,
);
