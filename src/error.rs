//! Error codes for the arm_btrace crate
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

/// The error type for stack walking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A word read targeted a null, misaligned, or unmapped address.
    OutOfBoundsRead {
        /// Address of the word that could not be read.
        address: u32,
    },

    /// The stack pointer was modified in a way that cannot be inverted from the
    /// instruction alone, e.g. `sub sp, sp, r3`.
    UnresolvableModification {
        /// Address of the offending instruction.
        address: u32,
        /// The raw instruction word.
        opcode: u32,
    },

    /// The backward scan for a function entry left the executable region.
    BoundaryExceeded {
        /// Address the scan was about to fetch.
        address: u32,
        /// End of the executable region the scan was bounded by.
        boundary: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfBoundsRead { address } => write!(fmt, "Failed to read word at {address:08X}"),
            Error::UnresolvableModification { address, opcode } => {
                write!(fmt, "Unresolvable stack pointer modification {opcode:08X} at {address:08X}")
            }
            Error::BoundaryExceeded { address, boundary } => {
                write!(fmt, "Prologue scan reached {address:08X} outside code ending at {boundary:08X}")
            }
        }
    }
}

/// A specialized result type for the arm_btrace crate.
pub type StResult<T> = Result<T, Error>;
