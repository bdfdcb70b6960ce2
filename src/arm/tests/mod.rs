//! End-to-end walks over synthetic ARM programs.
//!
//! Every synthetic function has the same shape, with the optional `vpush`
//! replaced by a `nop` when absent:
//!
//! ```text
//! f:  push  {r4, fp, lr}
//!     add   fp, sp, #8
//!     vpush {d8, d9}
//!     sub   sp, sp, #locals
//!     bl    <callee>            <- call site, PC of the frame
//!     nop
//!     add   sp, sp, #locals
//!     pop   {r4, fp, pc}
//! ```
//!
//! Function 0 is the outermost one and calls function 1, and so on. The stack
//! holds exactly what executing the chain would have pushed.

use crate::{memory::MemoryRegion, stacktrace::StackFrame};
use rand::{Rng, SeedableRng, rngs::SmallRng};

pub const CODE_BASE: u32 = 0x0000_8000;
pub const STACK_TOP: u32 = 0x2000_4000;

const FUNCTION_WORDS: u32 = 8;
const CALL_SITE: u32 = 4;

const PUSH_R4_FP_LR: u32 = 0xE92D_4810;
const ADD_FP_SP_8: u32 = 0xE28D_B008;
const VPUSH_D8_D9: u32 = 0xED2D_8B04;
const SUB_SP_SP: u32 = 0xE24D_D000;
const BL: u32 = 0xEBFF_FFFE;
const NOP: u32 = 0xE1A0_0000;
const ADD_SP_SP: u32 = 0xE28D_D000;
const POP_R4_FP_PC: u32 = 0xE8BD_8810;

/// Filler for stack words no prologue wrote.
const STACK_FILL: u32 = 0xCDCD_CDCD;
/// LR of the innermost frame; it has not been saved anywhere.
pub const LIVE_LR: u32 = 0xDEAD_BEEF;

/// What a walk over the chain is expected to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub frame: StackFrame,
    pub caller_sp_high: u32,
}

pub struct SyntheticChain {
    pub code: Vec<u32>,
    pub stack_base: u32,
    pub stack: Vec<u32>,
    /// Expected reports, innermost frame first.
    pub expected: Vec<Expected>,
}

struct Shape {
    vpush: bool,
    locals: u32,
}

impl SyntheticChain {
    /// Builds a chain of `depth` functions. `root_lr` is the return address
    /// saved by the outermost function; 0 marks it as the bottom of the stack.
    pub fn build(depth: usize, root_lr: u32, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let shapes: Vec<Shape> = (0..depth)
            .map(|_| Shape { vpush: rng.gen_bool(0.5), locals: rng.gen_range(0..=16u32) * 4 })
            .collect();

        let mut code = Vec::new();
        for shape in &shapes {
            code.extend_from_slice(&[
                PUSH_R4_FP_LR,
                ADD_FP_SP_8,
                if shape.vpush { VPUSH_D8_D9 } else { NOP },
                SUB_SP_SP | shape.locals,
                BL,
                NOP,
                ADD_SP_SP | shape.locals,
                POP_R4_FP_PC,
            ]);
        }

        // (address, value) pairs written by the prologues.
        let mut writes = Vec::new();
        let mut expected = Vec::new();
        let (mut entry_sp, mut caller_fp, mut caller_lr) = (STACK_TOP, 0, root_lr);

        for (index, shape) in shapes.iter().enumerate() {
            writes.push((entry_sp - 12, 0x4444_0000 | index as u32)); // r4
            writes.push((entry_sp - 8, caller_fp));
            writes.push((entry_sp - 4, caller_lr));

            let fp = entry_sp - 4;
            let sp = entry_sp - 12 - if shape.vpush { 16 } else { 0 } - shape.locals;
            let call_site = CODE_BASE + (index as u32 * FUNCTION_WORDS + CALL_SITE) * 4;

            // Callers see the LR their callee saved, the innermost frame the
            // live register.
            let lr = if index + 1 == depth { LIVE_LR } else { call_site + 4 };
            expected.push(Expected { frame: StackFrame { fp, sp, lr, pc: call_site }, caller_sp_high: entry_sp - 4 });

            (entry_sp, caller_fp, caller_lr) = (sp, fp, call_site + 4);
        }
        expected.reverse();

        let stack_base = entry_sp;
        let mut stack = std::vec![STACK_FILL; ((STACK_TOP - stack_base) / 4) as usize];
        for (address, value) in writes {
            stack[((address - stack_base) / 4) as usize] = value;
        }

        Self { code, stack_base, stack, expected }
    }

    pub fn regions(&self) -> [MemoryRegion<'_>; 2] {
        [MemoryRegion::new(CODE_BASE, &self.code), MemoryRegion::new(self.stack_base, &self.stack)]
    }

    pub fn code_end(&self) -> u32 {
        CODE_BASE + self.code.len() as u32 * 4
    }

    /// Registers of the innermost function, stopped at its call site.
    pub fn innermost(&self) -> StackFrame {
        self.expected[0].frame
    }

    /// Replaces the push opening function `index` with a `nop`.
    pub fn remove_push(&mut self, index: usize) {
        self.code[index * FUNCTION_WORDS as usize] = NOP;
    }
}

#[test]
fn builder_lays_out_push_slots() {
    let chain = SyntheticChain::build(2, 0, 1);
    let outer = chain.expected[1];
    let inner = chain.expected[0];

    // The inner function saved the outer one's fp and return address just
    // below its entry SP, which is the outer function's SP.
    let read = |address: u32| chain.stack[((address - chain.stack_base) / 4) as usize];
    assert_eq!(read(outer.frame.sp - 4), outer.frame.pc + 4);
    assert_eq!(read(outer.frame.sp - 8), outer.frame.fp);
    assert_eq!(read(STACK_TOP - 4), 0);
    assert_eq!(inner.frame.lr, LIVE_LR);
}
