//! Decodes the subset of the A32 (ARM state) instruction set that can move the
//! stack pointer inside a function prologue.
//!
//! Instruction classes the decoder distinguishes, keyed on bits 27:25:
//!
//! ```text
//!                      .-------------------------------------------------------------------------------------------------------------------------------.
//!                      | 3 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 |
//!                      | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//!                      .-------------------------------------------------------------------------------------------------------------------------------.
//!  Data processing     |     cond      | 0 | 0 | I |    opcode     | S |      Rn       |      Rd       |    rotate     |         imm8                  |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!  Single transfer     |     cond      | 0 | 1 | I | P | U | B | W | L |      Rn       |      Rd       |              offset12                         |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!  Block transfer      |     cond      | 1 | 0 | 0 | P | U | S | W | L |      Rn       |                    register list                              |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!  Coprocessor xfer    |     cond      | 1 | 1 | 0 | P | U | N | W | L |      Rn       |      CRd      |     cp#       |         imm8 (words)          |
//!                      '-------------------------------------------------------------------------------------------------------------------------------'
//! ```
//!
//!  - The unconditional space (cond = 0b1111) is never classified.
//!  - With I = 0 and bits 7 and 4 both set, the data processing space holds
//!    multiplies and extra load/stores, which are not classified either.
//!  - With I = 1 and bit 4 set, the single transfer space holds media
//!    instructions.
//!  - PUW = 000 in the coprocessor space is MCRR/MRRC or undefined.
use core::fmt;

pub const FP: u8 = 11;
pub const IP: u8 = 12;
pub const SP: u8 = 13;
pub const LR: u8 = 14;
pub const PC: u8 = 15;

/// Register list bit for the frame pointer in a block transfer.
pub const FP_BIT: u16 = 1 << FP;
/// Register list bit for the link register in a block transfer.
pub const LR_BIT: u16 = 1 << LR;

const I_BIT: u32 = 0x0200_0000; // immediate operand / register offset
const P_BIT: u32 = 0x0100_0000; // pre / post index
const U_BIT: u32 = 0x0080_0000; // up / down
const W_BIT: u32 = 0x0020_0000; // write back
const L_BIT: u32 = 0x0010_0000; // load / store

const ALU_ADD: u32 = 0b0100;
const ALU_SUB: u32 = 0b0010;

/// Number of registers named by a block transfer register list.
pub const fn num_registers(register_list: u16) -> u32 {
    register_list.count_ones()
}

/// A raw A32 instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u32);

impl Opcode {
    #[inline]
    const fn bit(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    #[inline]
    const fn is_unconditional_space(self) -> bool {
        self.0 >> 28 == 0xF
    }

    const fn is_data_processing(self) -> bool {
        if self.is_unconditional_space() || (self.0 >> 26) & 0b11 != 0b00 {
            return false;
        }
        // Register forms with bits 7 and 4 set are multiplies and extra load/stores.
        self.is_immediate() || (self.0 >> 4) & 0b1001 != 0b1001
    }

    const fn alu_opcode(self) -> u32 {
        (self.0 >> 21) & 0xF
    }

    /// `ADD` in any addressing form.
    pub const fn is_add(self) -> bool {
        self.is_data_processing() && self.alu_opcode() == ALU_ADD
    }

    /// `SUB` in any addressing form.
    pub const fn is_sub(self) -> bool {
        self.is_data_processing() && self.alu_opcode() == ALU_SUB
    }

    /// `LDR`/`STR`/`LDRB`/`STRB`, the single register transfers.
    pub const fn is_single_transfer(self) -> bool {
        !self.is_unconditional_space()
            && (self.0 >> 26) & 0b11 == 0b01
            && !(self.is_immediate() && (self.0 >> 4) & 1 == 1)
    }

    /// `LDM`/`STM`, including `PUSH`/`POP` of a register list.
    pub const fn is_block_transfer(self) -> bool {
        !self.is_unconditional_space() && (self.0 >> 25) & 0b111 == 0b100
    }

    /// `LDC`/`STC`, which covers `VPUSH`/`VPOP`/`VLDM`/`VSTM`.
    pub const fn is_coprocessor_transfer(self) -> bool {
        !self.is_unconditional_space()
            && (self.0 >> 25) & 0b111 == 0b110
            && (self.0 >> 21) & 0b1101 != 0 // PUW == 000 is MCRR/MRRC
    }

    /// The canonical function entry: an unconditional `STMDB sp!, {...}` or
    /// `STR rX, [sp, #-imm]!`.
    pub const fn is_push(self) -> bool {
        self.0 & 0xFFFF_0000 == 0xE92D_0000 || self.0 & 0xFFFF_0000 == 0xE52D_0000
    }

    /// I bit. For data processing this selects an immediate operand; for a
    /// single transfer it selects a register offset.
    pub const fn is_immediate(self) -> bool {
        self.bit(I_BIT)
    }

    pub const fn is_pre_indexed(self) -> bool {
        self.bit(P_BIT)
    }

    pub const fn is_increment(self) -> bool {
        self.bit(U_BIT)
    }

    pub const fn is_write_back(self) -> bool {
        self.bit(W_BIT)
    }

    pub const fn is_load(self) -> bool {
        self.bit(L_BIT)
    }

    /// Base register of a transfer, first operand of data processing.
    pub const fn rn(self) -> u8 {
        ((self.0 >> 16) & 0xF) as u8
    }

    /// Destination of data processing, transferred register of a single transfer.
    pub const fn rd(self) -> u8 {
        ((self.0 >> 12) & 0xF) as u8
    }

    /// Data processing immediate: imm8 rotated right by twice the rotate field.
    pub const fn immediate_operand(self) -> u32 {
        (self.0 & 0xFF).rotate_right(((self.0 >> 8) & 0xF) * 2)
    }

    pub const fn offset12(self) -> u32 {
        self.0 & 0xFFF
    }

    pub const fn register_list(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Transfer length of a coprocessor load/store, in words.
    pub const fn coprocessor_words(self) -> u32 {
        self.0 & 0xFF
    }

    /// Decodes the word into the instruction classes relevant to stack tracking.
    pub const fn decode(self) -> Instruction {
        if self.is_add() || self.is_sub() {
            let operand = if self.is_immediate() {
                Operand::Immediate(self.immediate_operand())
            } else {
                Operand::Register
            };
            let (rd, rn) = (self.rd(), self.rn());
            if self.is_add() { Instruction::Add { rd, rn, operand } } else { Instruction::Sub { rd, rn, operand } }
        } else if self.is_single_transfer() {
            // A post-indexed transfer always writes the base back.
            Instruction::SingleTransfer {
                load: self.is_load(),
                rd: self.rd(),
                rn: self.rn(),
                offset: if self.is_immediate() { Operand::Register } else { Operand::Immediate(self.offset12()) },
                pre_indexed: self.is_pre_indexed(),
                increment: self.is_increment(),
                write_back: self.is_write_back() || !self.is_pre_indexed(),
            }
        } else if self.is_block_transfer() {
            Instruction::BlockTransfer {
                load: self.is_load(),
                rn: self.rn(),
                registers: self.register_list(),
                pre_indexed: self.is_pre_indexed(),
                increment: self.is_increment(),
                write_back: self.is_write_back(),
            }
        } else if self.is_coprocessor_transfer() {
            Instruction::CoprocessorTransfer {
                load: self.is_load(),
                rn: self.rn(),
                words: self.coprocessor_words(),
                pre_indexed: self.is_pre_indexed(),
                increment: self.is_increment(),
                write_back: self.is_write_back(),
            }
        } else {
            Instruction::Other(self.0)
        }
    }
}

/// Second operand of `ADD`/`SUB`, or the offset of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Immediate(u32),
    /// Register or shifted register; its value is unknown to the decoder.
    Register,
}

/// The instruction classes that can move the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Add { rd: u8, rn: u8, operand: Operand },
    Sub { rd: u8, rn: u8, operand: Operand },
    SingleTransfer { load: bool, rd: u8, rn: u8, offset: Operand, pre_indexed: bool, increment: bool, write_back: bool },
    BlockTransfer { load: bool, rn: u8, registers: u16, pre_indexed: bool, increment: bool, write_back: bool },
    CoprocessorTransfer { load: bool, rn: u8, words: u32, pre_indexed: bool, increment: bool, write_back: bool },
    Other(u32),
}

struct Reg(u8);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FP => write!(f, "fp"),
            IP => write!(f, "ip"),
            SP => write!(f, "sp"),
            LR => write!(f, "lr"),
            PC => write!(f, "pc"),
            n => write!(f, "r{n}"),
        }
    }
}

fn addressing_mode(pre_indexed: bool, increment: bool) -> &'static str {
    match (increment, pre_indexed) {
        (true, false) => "ia",
        (true, true) => "ib",
        (false, false) => "da",
        (false, true) => "db",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operand = |f: &mut fmt::Formatter<'_>, operand: &Operand| match operand {
            Operand::Immediate(value) => write!(f, "#0x{value:X}"),
            Operand::Register => write!(f, "<reg>"),
        };

        match self {
            Instruction::Add { rd, rn, operand: op } => {
                write!(f, "add {}, {}, ", Reg(*rd), Reg(*rn))?;
                operand(f, op)
            }
            Instruction::Sub { rd, rn, operand: op } => {
                write!(f, "sub {}, {}, ", Reg(*rd), Reg(*rn))?;
                operand(f, op)
            }
            Instruction::SingleTransfer { load, rd, rn, offset, pre_indexed, increment, write_back } => {
                let sign = if *increment { "" } else { "-" };
                write!(f, "{} {}, [{}", if *load { "ldr" } else { "str" }, Reg(*rd), Reg(*rn))?;
                if !*pre_indexed {
                    write!(f, "]")?;
                }
                match offset {
                    Operand::Immediate(value) => write!(f, ", #{sign}0x{value:X}")?,
                    Operand::Register => write!(f, ", {sign}<reg>")?,
                }
                if *pre_indexed {
                    write!(f, "]{}", if *write_back { "!" } else { "" })?;
                }
                Ok(())
            }
            Instruction::BlockTransfer { load, rn, registers, pre_indexed, increment, write_back } => {
                write!(
                    f,
                    "{}{} {}{}, {{",
                    if *load { "ldm" } else { "stm" },
                    addressing_mode(*pre_indexed, *increment),
                    Reg(*rn),
                    if *write_back { "!" } else { "" }
                )?;
                let mut first = true;
                for reg in (0..16u8).filter(|reg| registers & (1 << reg) != 0) {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", Reg(reg))?;
                    first = false;
                }
                write!(f, "}}")
            }
            Instruction::CoprocessorTransfer { load, rn, words, pre_indexed, increment, write_back } => write!(
                f,
                "{}{} {}{}, #{} words",
                if *load { "ldc" } else { "stc" },
                addressing_mode(*pre_indexed, *increment),
                Reg(*rn),
                if *write_back { "!" } else { "" },
                words
            ),
            Instruction::Other(word) => write!(f, "<{word:08X}>"),
        }
    }
}
