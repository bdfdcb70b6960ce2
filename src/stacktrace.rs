use crate::{
    arm::unwind::{TraceFlags, walk_to_fn_start},
    config::CodeBounds,
    error::{Error, StResult},
    memory::MemoryReader,
    output::DefaultOutput,
};
use core::fmt::{self, Display, Formatter};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))] {
        use crate::memory::TargetMemory;
        use core::arch::asm;
    }
}

/// Represents the CPU register state for a single stack frame.
///
/// The layout is fixed: the exception hook stores `fp`, `sp`, `lr` and `pc`
/// at offsets 0, 4, 8 and 12 without going through Rust.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    /// The frame pointer (r11) of the frame.
    pub fp: u32,

    /// The stack pointer (r13) of the frame.
    pub sp: u32,

    /// The link register (r14) of the frame.
    pub lr: u32,

    /// The program counter of the frame. For callers this is the address of
    /// the calling instruction, not the return address.
    pub pc: u32,
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PC: {:08X}, SP: {:08X}, LR: {:08X}, FP: {:08X}", self.pc, self.sp, self.lr, self.fp)
    }
}

impl StackFrame {
    /// Captures the registers of the calling function.
    #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))]
    #[inline(always)]
    pub fn capture() -> Self {
        let mut frame = Self::default();

        // SAFETY: Reading PC/SP/FP/LR does not touch memory and the registers
        // exist on every ARM core.
        unsafe {
            asm!(
                "adr {pc}, .",   // Get current PC (program counter)
                "mov {sp}, sp",  // Get current SP (stack pointer)
                "mov {fp}, r11", // Get current FP (frame pointer)
                "mov {lr}, lr",  // Get current LR (link register)
                pc = out(reg) frame.pc,
                sp = out(reg) frame.sp,
                fp = out(reg) frame.fp,
                lr = out(reg) frame.lr,
                options(nomem, nostack, preserves_flags),
            );
        }

        frame
    }
}

/// Verdict of a [`FrameInspector`] on a reported frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Continue,
    Stop,
}

/// Receives every frame of a walk.
#[cfg_attr(test, mockall::automock)]
pub trait FrameInspector {
    /// Called once per frame, innermost first. `caller_sp_high` is the highest
    /// stack address the frame's function was seen to use, one word below the
    /// stack pointer its caller had.
    fn inspect(&mut self, index: usize, frame: &StackFrame, caller_sp_high: u32) -> Inspection;
}

impl<F> FrameInspector for F
where
    F: FnMut(usize, &StackFrame, u32) -> Inspection,
{
    fn inspect(&mut self, index: usize, frame: &StackFrame, caller_sp_high: u32) -> Inspection {
        self(index, frame, caller_sp_high)
    }
}

/// Why a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The requested number of frames was produced.
    FrameLimit,
    /// The inspector returned [`Inspection::Stop`].
    UserStop,
    /// A function saved a zero link register; it has no caller.
    EndOfStack,
    /// The prologue of the next frame could not be unwound.
    Failed(Error),
}

/// Result of a single [`Unwinder::process_frame`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The frame was reported and replaced by its caller.
    Continue,
    /// The frame was reported and the walk ends with it.
    Stop(Termination),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    /// Number of frames located and handed to the inspector.
    pub frames: usize,
    pub termination: Termination,
}

/// Unwinds frames of the code in `bounds`, reading code and stack through `memory`.
pub struct Unwinder<M> {
    memory: M,
    bounds: CodeBounds,
}

impl<M: MemoryReader> Unwinder<M> {
    pub const fn new(memory: M, bounds: CodeBounds) -> Self {
        Self { memory, bounds }
    }

    /// Reports `frame` to `inspector` and replaces it with its caller's frame.
    ///
    /// On a stop, whether requested by the inspector or caused by the end of
    /// the stack, the reported frame counts as processed. On an error nothing
    /// was reported and `frame` is unchanged.
    pub fn process_frame<I: FrameInspector + ?Sized>(
        &self,
        index: usize,
        frame: &mut StackFrame,
        inspector: &mut I,
    ) -> StResult<Step> {
        log::debug!("Frame #{index}: {frame}");

        let scan = walk_to_fn_start(&self.memory, self.bounds, frame.pc, frame.sp)?;
        let mut entry_sp = scan.state.sp;

        // `add fp, sp, #imm` leaves fp pointing at the first word the function
        // pushed. When the two disagree the frame pointer wins.
        if scan.state.flags.contains(TraceFlags::FP_FROM_SP)
            && frame.fp != 0
            && frame.fp != entry_sp.wrapping_sub(4)
        {
            log::warn!("FP {:08X} disagrees with entry SP {entry_sp:08X}, trusting FP", frame.fp);
            entry_sp = frame.fp.wrapping_add(4);
        }

        if inspector.inspect(index, frame, entry_sp.wrapping_sub(4)) == Inspection::Stop {
            log::debug!("Frame #{index}: inspector requested stop");
            return Ok(Step::Stop(Termination::UserStop));
        }

        frame.sp = entry_sp;
        if let Some(fp) = scan.state.saved_fp() {
            frame.fp = fp;
        }
        if let Some(lr) = scan.state.saved_lr() {
            frame.lr = lr;
            if lr == 0 {
                log::debug!("Frame #{index}: saved LR is zero, reached the bottom of the stack");
                return Ok(Step::Stop(Termination::EndOfStack));
            }
        }

        // LR holds the return address; step back to the call itself.
        frame.pc = frame.lr.wrapping_sub(4);

        Ok(Step::Continue)
    }

    /// Walks at most `max_frames` frames starting at `frame`. `frame` is left
    /// at the caller of the last frame walked, or at the last reported frame
    /// if the walk stopped.
    pub fn walk<I: FrameInspector + ?Sized>(
        &self,
        frame: &mut StackFrame,
        inspector: &mut I,
        max_frames: usize,
    ) -> WalkSummary {
        let mut frames = 0;

        while frames < max_frames {
            match self.process_frame(frames, frame, inspector) {
                Ok(Step::Continue) => frames += 1,
                Ok(Step::Stop(termination)) => {
                    return WalkSummary { frames: frames + 1, termination };
                }
                Err(error) => {
                    log::warn!("Stack walk stopped after {frames} frames: {error}");
                    return WalkSummary { frames, termination: Termination::Failed(error) };
                }
            }
        }

        WalkSummary { frames, termination: Termination::FrameLimit }
    }
}

/// A structure representing a stack trace.
pub struct StackTrace;

impl StackTrace {
    /// Walks the call chain starting at `frame`, reporting every frame to `inspector`.
    ///
    /// ```text
    /// #00: PC=00008a14 SP=20001f80 LR=00008b3c FP=20001f94 callerSP=20001f98
    /// #01: PC=00008b38 SP=20001f98 LR=00008c70 FP=20001fac callerSP=20001fb0
    /// #02: PC=00008c6c SP=20001fb0 LR=00008d04 FP=20001fc4 callerSP=20001fc8
    /// #03: PC=00008d00 SP=20001fc8 LR=00000000 FP=00000000 callerSP=20001fd0
    /// ```
    pub fn walk<M: MemoryReader, I: FrameInspector + ?Sized>(
        frame: &mut StackFrame,
        memory: M,
        bounds: CodeBounds,
        inspector: &mut I,
        max_frames: usize,
    ) -> WalkSummary {
        Unwinder::new(memory, bounds).walk(frame, inspector, max_frames)
    }

    /// Walks the call chain starting at `frame` with the registered default
    /// output and frame limit. See [`crate::set_default_output`].
    pub fn walk_with_default_output<M: MemoryReader>(
        frame: &mut StackFrame,
        memory: M,
        bounds: CodeBounds,
    ) -> WalkSummary {
        let (mut output, max_frames) = DefaultOutput::registered();
        Self::walk(frame, memory, bounds, &mut output, max_frames)
    }

    /// Walks the call chain of the calling function.
    ///
    /// # Safety
    ///
    /// The caller is responsible for the code region reported by
    /// [`CodeBounds::from_linker`] and every stack reachable from the current
    /// one being mapped and readable.
    #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))]
    #[inline(never)]
    pub unsafe fn walk_current<I: FrameInspector + ?Sized>(inspector: &mut I, max_frames: usize) -> WalkSummary {
        let mut frame = StackFrame::capture();
        // SAFETY: The caller vouches for the code and stack being readable.
        let memory = unsafe { TargetMemory::new() };
        Self::walk(&mut frame, memory, CodeBounds::from_linker(), inspector, max_frames)
    }

    /// Dumps the call chain of the calling function through the registered
    /// default output.
    ///
    /// # Safety
    ///
    /// Same as [`StackTrace::walk_current`].
    #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))]
    #[inline(never)]
    pub unsafe fn dump() -> WalkSummary {
        let mut frame = StackFrame::capture();
        // SAFETY: The caller vouches for the code and stack being readable.
        let memory = unsafe { TargetMemory::new() };
        Self::walk_with_default_output(&mut frame, memory, CodeBounds::from_linker())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;

    const CODE_BASE: u32 = 0x0000_8000;
    const STACK_BASE: u32 = 0x2000_0000;

    #[test]
    fn display_formats_hex_values() {
        let frame = StackFrame { fp: 0x2000_1FFC, sp: 0x2000_1FE0, lr: 0x8124, pc: 0x8010 };
        assert_eq!(format!("{frame}"), "PC: 00008010, SP: 20001FE0, LR: 00008124, FP: 20001FFC");
    }

    #[test]
    fn stack_frame_layout_is_fixed() {
        assert_eq!(core::mem::size_of::<StackFrame>(), 16);
        assert_eq!(core::mem::offset_of!(StackFrame, fp), 0);
        assert_eq!(core::mem::offset_of!(StackFrame, sp), 4);
        assert_eq!(core::mem::offset_of!(StackFrame, lr), 8);
        assert_eq!(core::mem::offset_of!(StackFrame, pc), 12);
    }

    #[test]
    fn closures_are_inspectors() {
        let mut seen = 0;
        let mut inspector = |index: usize, _: &StackFrame, _: u32| {
            seen = index + 1;
            Inspection::Stop
        };
        assert_eq!(inspector.inspect(3, &StackFrame::default(), 0), Inspection::Stop);
        assert_eq!(seen, 4);
    }

    // push {fp, lr}; add fp, sp, #4; sub sp, sp, #8; bl ...
    const FN_CODE: [u32; 4] = [0xE92D_4800, 0xE28D_B004, 0xE24D_D008, 0xEB00_0000];

    #[test]
    fn process_frame_moves_to_caller() {
        // sp at the bl: two locals, then the saved fp and lr.
        let stack = [0, 0, 0x2000_0100, 0x0000_9004];
        let regions = [MemoryRegion::new(CODE_BASE, &FN_CODE), MemoryRegion::new(STACK_BASE, &stack)];
        let unwinder = Unwinder::new(&regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 16));
        let mut frame = StackFrame { fp: STACK_BASE + 12, sp: STACK_BASE, lr: 0xAAAA_AAAA, pc: CODE_BASE + 12 };

        let mut inspector = MockFrameInspector::new();
        inspector
            .expect_inspect()
            .withf(|index, frame, high| *index == 0 && frame.pc == CODE_BASE + 12 && *high == STACK_BASE + 12)
            .times(1)
            .return_const(Inspection::Continue);

        assert_eq!(unwinder.process_frame(0, &mut frame, &mut inspector), Ok(Step::Continue));
        assert_eq!(frame, StackFrame { fp: 0x2000_0100, sp: STACK_BASE + 16, lr: 0x9004, pc: 0x9000 });
    }

    #[test]
    fn process_frame_trusts_fp_over_scan() {
        let stack = [0, 0, 0x2000_0100, 0x0000_9004, 0, 0];
        let regions = [MemoryRegion::new(CODE_BASE, &FN_CODE), MemoryRegion::new(STACK_BASE, &stack)];
        let unwinder = Unwinder::new(&regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 16));
        let mut frame = StackFrame { fp: STACK_BASE + 20, sp: STACK_BASE, lr: 0, pc: CODE_BASE + 12 };

        let mut high = 0;
        let mut inspector = |_: usize, _: &StackFrame, caller_sp_high: u32| {
            high = caller_sp_high;
            Inspection::Continue
        };

        assert_eq!(unwinder.process_frame(0, &mut frame, &mut inspector), Ok(Step::Continue));
        assert_eq!(high, STACK_BASE + 20);
        assert_eq!(frame.sp, STACK_BASE + 24);
    }

    #[test]
    fn process_frame_steps_over_early_return_epilogue() {
        // push {fp, lr}; add fp, sp, #4; sub sp, sp, #8; nop;
        // sub sp, fp, #4; pop {fp, pc}; bl ...
        let code = [0xE92D_4800, 0xE28D_B004, 0xE24D_D008, 0xE1A0_0000, 0xE24B_D004, 0xE8BD_8800, 0xEB00_0000];
        // Undoing `sub sp, fp, #4` overshoots by a word, so the push is read
        // one slot higher than it was made.
        let stack = [0, 0, 0, 0x2000_0100, 0x0000_9004];
        let regions = [MemoryRegion::new(CODE_BASE, &code), MemoryRegion::new(STACK_BASE, &stack)];
        let unwinder = Unwinder::new(&regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 28));
        let mut frame = StackFrame { fp: STACK_BASE + 12, sp: STACK_BASE, lr: 0, pc: CODE_BASE + 24 };

        let mut inspector = MockFrameInspector::new();
        inspector
            .expect_inspect()
            .withf(|index, _, high| *index == 0 && *high == STACK_BASE + 12)
            .times(1)
            .return_const(Inspection::Continue);

        assert_eq!(unwinder.process_frame(0, &mut frame, &mut inspector), Ok(Step::Continue));
        assert_eq!(frame.sp, STACK_BASE + 16);
        assert_eq!(frame.pc, 0x9000);
    }

    #[test]
    fn walk_over_early_return_epilogue_counts_frame() {
        let code = [0xE92D_4800, 0xE28D_B004, 0xE24D_D008, 0xE1A0_0000, 0xE24B_D004, 0xE8BD_8800, 0xEB00_0000];
        let stack = [0, 0, 0, 0, 0];
        let regions = [MemoryRegion::new(CODE_BASE, &code), MemoryRegion::new(STACK_BASE, &stack)];
        let mut frame = StackFrame { fp: STACK_BASE + 12, sp: STACK_BASE, lr: 0, pc: CODE_BASE + 24 };

        let mut inspector = |_: usize, _: &StackFrame, _: u32| Inspection::Continue;
        let summary =
            StackTrace::walk(&mut frame, &regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 28), &mut inspector, 4);
        assert_eq!(summary, WalkSummary { frames: 1, termination: Termination::EndOfStack });
        assert_eq!(frame.sp, STACK_BASE + 16);
    }

    #[test]
    fn process_frame_stop_leaves_frame_untouched() {
        let stack = [0, 0, 0x2000_0100, 0x0000_9004];
        let regions = [MemoryRegion::new(CODE_BASE, &FN_CODE), MemoryRegion::new(STACK_BASE, &stack)];
        let unwinder = Unwinder::new(&regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 16));
        let original = StackFrame { fp: STACK_BASE + 12, sp: STACK_BASE, lr: 0, pc: CODE_BASE + 12 };
        let mut frame = original;

        let mut inspector = |_: usize, _: &StackFrame, _: u32| Inspection::Stop;
        assert_eq!(unwinder.process_frame(0, &mut frame, &mut inspector), Ok(Step::Stop(Termination::UserStop)));
        assert_eq!(frame, original);
    }

    #[test]
    fn process_frame_zero_lr_ends_stack() {
        let stack = [0, 0, 0, 0];
        let regions = [MemoryRegion::new(CODE_BASE, &FN_CODE), MemoryRegion::new(STACK_BASE, &stack)];
        let unwinder = Unwinder::new(&regions[..], CodeBounds::new(CODE_BASE, CODE_BASE + 16));
        let mut frame = StackFrame { fp: 0, sp: STACK_BASE, lr: 0x8888, pc: CODE_BASE + 12 };

        let mut inspector = |_: usize, _: &StackFrame, _: u32| Inspection::Continue;
        assert_eq!(unwinder.process_frame(0, &mut frame, &mut inspector), Ok(Step::Stop(Termination::EndOfStack)));
        assert_eq!(frame.lr, 0);
        assert_eq!(frame.sp, STACK_BASE + 16);
    }

    #[test]
    fn process_frame_error_reports_nothing() {
        let code = [0xE1A0_0000, 0xEB00_0000];
        let memory = MemoryRegion::new(CODE_BASE, &code);
        let unwinder = Unwinder::new(memory, CodeBounds::new(CODE_BASE, CODE_BASE + 8));
        let original = StackFrame { fp: 0, sp: STACK_BASE, lr: 0, pc: CODE_BASE + 4 };
        let mut frame = original;

        let mut inspector = MockFrameInspector::new();
        inspector.expect_inspect().never();

        assert_eq!(
            unwinder.process_frame(0, &mut frame, &mut inspector),
            Err(Error::BoundaryExceeded { address: CODE_BASE - 4, boundary: CODE_BASE + 8 })
        );
        assert_eq!(frame, original);
    }

    #[test]
    fn walk_with_no_frames_requested_reports_nothing() {
        let memory = MemoryRegion::new(CODE_BASE, &FN_CODE);
        let mut frame = StackFrame::default();
        let mut inspector = MockFrameInspector::new();
        inspector.expect_inspect().never();

        let summary = StackTrace::walk(&mut frame, memory, CodeBounds::UNBOUNDED, &mut inspector, 0);
        assert_eq!(summary, WalkSummary { frames: 0, termination: Termination::FrameLimit });
    }
}
