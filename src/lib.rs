//! # ARM Stack Trace Library
//!
//! ## Introduction
//!
//! This library implements stack walking for bare-metal 32-bit ARM code
//! running in ARM (A32) state. It does not need unwind tables or a frame
//! pointer chain: given the PC and SP of a frame, it scans backward through
//! the code to the push that opens the function and undoes every stack
//! pointer update on the way. That yields the SP the caller had and, from the
//! push itself, the caller's LR and FP. Repeating this frame by frame
//! produces the call chain.
//!
//! Symbols are not resolved. The PC values in the output are meant to be fed
//! to an offline tool such as `addr2line`:
//!
//! ```text
//! #00: PC=00008a14 SP=20001f80 LR=00008b3c FP=20001f94 callerSP=20001f98
//! #01: PC=00008b38 SP=20001f98 LR=00008c70 FP=20001fac callerSP=20001fb0
//! #02: PC=00008c6c SP=20001fb0 LR=00008d04 FP=20001fc4 callerSP=20001fc8
//! #03: PC=00008d00 SP=20001fc8 LR=00000000 FP=00000000 callerSP=20001fd0
//! ```
//!
//! ## Prerequisites
//!
//! - Code compiled for ARM state. Thumb code is not decoded.
//! - Every function that uses the stack starts with `push {...}` (`stmdb
//!   sp!, {...}`) or `str rX, [sp, #-imm]!`, which is what GCC and LLVM
//!   emit. Stack pointer updates by a register amount (`sub sp, sp, r3`)
//!   between that push and the PC cannot be unwound.
//! - The linker script exports `_etext` at the end of the code. Builds
//!   without it disable the default `etext` feature; the scan is then only
//!   protected against wrapping below address zero.
//!
//! ## Public API
//!
//! ```ignore
//!    /// Walks the call chain starting at `frame`, reporting every frame to `inspector`.
//!    pub fn StackTrace::walk(frame, memory, bounds, inspector, max_frames) -> WalkSummary;
//!
//!    /// Walks the call chain starting at `frame` with the registered default output.
//!    pub fn StackTrace::walk_with_default_output(frame, memory, bounds) -> WalkSummary;
//!
//!    /// Walks the call chain of the calling function.
//!    pub unsafe fn StackTrace::walk_current(inspector, max_frames) -> WalkSummary;
//!
//!    /// Registers the text sink and frame limit of the default output.
//!    pub fn set_default_output(output, max_frames) -> Option<TraceOutput>;
//!
//!    /// Exception hook, entered from an abort handler.
//!    pub unsafe extern "C" fn btrace_exception_hook() -> !;
//! ```
//!
//! ## API usage
//!
//! ```ignore
//!     // At startup
//!     arm_btrace::set_default_output(Some(arm_btrace::log_output), 16);
//!
//!     // Anywhere in the code
//!     unsafe { StackTrace::dump() };
//!
//!     // Inside an abort handler, before returning into the hook
//!     arm_btrace::arm::trampoline::set_fault_return_address(faulting_pc);
//!
//!     // Offline, from a memory dump
//!     let regions = [MemoryRegion::new(0x8000, &code), MemoryRegion::new(stack_base, &stack)];
//!     let mut frame = StackFrame { fp, sp, lr, pc };
//!     StackTrace::walk(&mut frame, &regions[..], CodeBounds::new(0x8000, etext), &mut inspector, 32);
//! ```
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod arm;
pub mod config;
pub mod error;
pub mod memory;
mod output;
mod stacktrace;

pub use config::CodeBounds;
pub use memory::{MemoryReader, MemoryRegion, TargetMemory};
pub use output::{DefaultOutput, LineBuffer, TraceOutput, format_frame, log_output, set_default_output};
pub use stacktrace::{FrameInspector, Inspection, StackFrame, StackTrace, Step, Termination, Unwinder, WalkSummary};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))] {
        pub use arm::trampoline::{btrace_exception_hook, set_continuation_address, set_fault_return_address};
    }
}
