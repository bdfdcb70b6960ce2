//! Inverts the stack effect of A32 prologue instructions.
//!
//! There is no unwind table to consult on a bare-metal ARM image, so the
//! prologue is recovered from the code itself: starting at the program counter
//! of a frame, the scan walks backward one instruction at a time and undoes
//! every modification of the stack pointer until it reaches the push that
//! opens the function.
//!
//! The compiler is assumed to generate code for a "full descending" stack:
//! the stack grows toward lower addresses, SP is pre-decremented on every
//! push and always points at the last used word.
//!
//! ```text
//!         higher addresses
//!     .-------------------.  <- entry SP (caller's SP before the call)
//!     | lr                |
//!     | fp (old)          |  <- fp after `add fp, sp, #12`
//!     | r5                |
//!     | r4                |  <- SP after `push {r4, r5, fp, lr}`
//!     | locals ...        |
//!     '-------------------'  <- SP at the frame's PC
//!         lower addresses
//! ```
//!
//! Known limitations: a stack pointer modified by a register amount
//! (`sub sp, sp, r3`) cannot be inverted from the instruction alone, and pops
//! are ignored because aggressive optimization schedules them in the middle of
//! a function body, not just in its epilogue.
use crate::{
    config::CodeBounds,
    error::{Error, StResult},
    memory::MemoryReader,
};

use super::opcode::{FP, FP_BIT, Instruction, LR, LR_BIT, Opcode, Operand, SP, num_registers};

const WORD_SIZE: u32 = core::mem::size_of::<u32>() as u32;

bitflags::bitflags! {
    /// What a prologue scan learned about the function besides its stack size.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceFlags: u32 {
        /// The function set up a frame pointer with `add fp, sp, #imm`.
        const FP_FROM_SP = 1 << 0;
        /// The caller's LR was pushed and read back from the stack.
        const LR_ON_STACK = 1 << 1;
        /// The caller's FP was pushed and read back from the stack.
        const OLD_FP_ON_STACK = 1 << 2;
    }
}

/// Outcome of simulating one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The instruction moved the stack pointer and the move was undone.
    Resolved,
    /// The instruction does not affect stack tracking.
    NoEffect,
}

/// Working state of a backward prologue scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrologueState {
    /// Simulated stack pointer, i.e. SP before every instruction undone so far.
    pub sp: u32,
    /// Caller's FP, valid with [`TraceFlags::OLD_FP_ON_STACK`].
    pub fp_on_stack: u32,
    /// Caller's LR, valid with [`TraceFlags::LR_ON_STACK`].
    pub lr_on_stack: u32,
    pub flags: TraceFlags,
}

impl PrologueState {
    pub const fn new(sp: u32) -> Self {
        Self { sp, fp_on_stack: 0, lr_on_stack: 0, flags: TraceFlags::empty() }
    }

    pub fn saved_fp(&self) -> Option<u32> {
        self.flags.contains(TraceFlags::OLD_FP_ON_STACK).then_some(self.fp_on_stack)
    }

    pub fn saved_lr(&self) -> Option<u32> {
        self.flags.contains(TraceFlags::LR_ON_STACK).then_some(self.lr_on_stack)
    }

    fn capture<M: MemoryReader + ?Sized>(&mut self, memory: &M, register: u8, slot: u32) -> StResult<()> {
        match register {
            LR => {
                self.lr_on_stack = memory.read_word(slot)?;
                self.flags |= TraceFlags::LR_ON_STACK;
            }
            FP => {
                self.fp_on_stack = memory.read_word(slot)?;
                self.flags |= TraceFlags::OLD_FP_ON_STACK;
            }
            _ => {}
        }
        Ok(())
    }

    /// Undoes the effect `opcode`, located at `address`, had on the stack pointer.
    ///
    /// Saved LR/FP values are read through `memory` at the slots the
    /// instruction stored them to, so the stack being scanned must still hold
    /// the values pushed by the prologue.
    pub fn process_instruction<M: MemoryReader + ?Sized>(
        &mut self,
        memory: &M,
        address: u32,
        opcode: Opcode,
    ) -> StResult<Effect> {
        let instruction = opcode.decode();
        let unresolvable = Error::UnresolvableModification { address, opcode: opcode.0 };

        let effect = match instruction {
            // sub sp, rN, #imm. With rN other than sp this is an early-return
            // epilogue (`sub sp, fp, #4`); the frame pointer check corrects
            // the entry SP it leaves behind.
            Instruction::Sub { rd: SP, operand: Operand::Immediate(value), .. } => {
                self.sp = self.sp.wrapping_add(value);
                Effect::Resolved
            }
            // add sp, rN, #imm. Not expected while walking back a full
            // descending stack, but undone all the same.
            Instruction::Add { rd: SP, operand: Operand::Immediate(value), .. } => {
                self.sp = self.sp.wrapping_sub(value);
                Effect::Resolved
            }
            Instruction::Add { rd: SP, operand: Operand::Register, .. }
            | Instruction::Sub { rd: SP, operand: Operand::Register, .. } => {
                log::debug!("    > {address:08X}: {instruction} cannot be unwound");
                return Err(unresolvable);
            }
            // add fp, sp, #imm
            Instruction::Add { rd: FP, rn: SP, operand: Operand::Immediate(_) } => {
                self.flags |= TraceFlags::FP_FROM_SP;
                Effect::NoEffect
            }
            // str rX, [sp, #-imm]! and str rX, [sp], #-imm
            Instruction::SingleTransfer { load, rd, rn: SP, offset, pre_indexed, increment: false, write_back: true } => {
                let Operand::Immediate(offset) = offset else {
                    return Err(unresolvable);
                };
                if !load {
                    let slot = if pre_indexed { self.sp } else { self.sp.wrapping_add(offset) };
                    self.capture(memory, rd, slot)?;
                }
                self.sp = self.sp.wrapping_add(offset);
                Effect::Resolved
            }
            // stmdb sp!, {...} and stmda sp!, {...}
            Instruction::BlockTransfer { load, rn: SP, registers, pre_indexed, increment: false, write_back: true } => {
                // Registers are stored in ascending order from the lowest address.
                let lowest = if pre_indexed { self.sp } else { self.sp.wrapping_add(WORD_SIZE) };
                let slot_of = |register: u8| {
                    let below = registers & ((1u16 << register) - 1);
                    lowest.wrapping_add(num_registers(below) * WORD_SIZE)
                };
                if !load {
                    if registers & LR_BIT != 0 {
                        self.capture(memory, LR, slot_of(LR))?;
                    }
                    if registers & FP_BIT != 0 {
                        self.capture(memory, FP, slot_of(FP))?;
                    }
                }
                self.sp = self.sp.wrapping_add(num_registers(registers) * WORD_SIZE);
                Effect::Resolved
            }
            // vpush {...}, vstmdb sp!, {...}
            Instruction::CoprocessorTransfer { rn: SP, words, increment: false, write_back: true, .. } => {
                self.sp = self.sp.wrapping_add(words * WORD_SIZE);
                Effect::Resolved
            }
            // Pops and everything else.
            _ => Effect::NoEffect,
        };

        log::debug!("    > {address:08X}: {:08X} {instruction} sp: {:08X} {effect:?}", opcode.0, self.sp);
        Ok(effect)
    }
}

/// The function entry found by [`walk_to_fn_start`] and the state of the
/// stack at that entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrologueScan {
    /// Address of the push that opens the function.
    pub entry_pc: u32,
    /// Stack state undone back to the function entry; `state.sp` is the SP the
    /// caller had before the call.
    pub state: PrologueState,
}

/// Scans backward from `pc` to the push that opens the enclosing function,
/// undoing every stack pointer modification on the way. `sp` is the stack
/// pointer live at `pc`.
///
/// Every function that uses the stack is assumed to start with a register
/// push. The scan never fetches outside `bounds`, so a function without one
/// fails with [`Error::BoundaryExceeded`] instead of running through data.
pub fn walk_to_fn_start<M: MemoryReader + ?Sized>(
    memory: &M,
    bounds: CodeBounds,
    pc: u32,
    sp: u32,
) -> StResult<PrologueScan> {
    let mut state = PrologueState::new(sp);
    let mut address = pc;

    loop {
        if !bounds.contains(address) {
            return Err(Error::BoundaryExceeded { address, boundary: bounds.end });
        }

        let opcode = Opcode(memory.read_word(address)?);
        state.process_instruction(memory, address, opcode)?;

        // The push is part of the prologue, so it is undone before stopping.
        if opcode.is_push() {
            break;
        }

        address = address
            .checked_sub(WORD_SIZE)
            .ok_or(Error::BoundaryExceeded { address: address.wrapping_sub(WORD_SIZE), boundary: bounds.end })?;
    }

    log::debug!(
        "    > entry: {address:08X}, sp: {:08X}, fp: {:08X?}, lr: {:08X?}, flags: {:?}",
        state.sp,
        state.saved_fp(),
        state.saved_lr(),
        state.flags
    );

    Ok(PrologueScan { entry_pc: address, state })
}
