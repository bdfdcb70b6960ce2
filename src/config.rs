//! Build-time and link-time configuration for the unwinder.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

/// Size in bytes of the private stack the exception hook walks on. Formatting
/// a trace line through `core::fmt` uses a few hundred bytes, so anything much
/// smaller than this stops working.
pub const HOOK_STACK_SIZE: usize = 0x400;

/// Frame limit used by the exception hook until one is registered.
pub const DEFAULT_MAX_FRAMES: usize = 16;

/// Capacity of the buffer each default trace line is formatted into.
pub const LINE_BUFFER_SIZE: usize = 128;

/// Address range that holds executable code. The backward prologue scan never
/// fetches an instruction outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBounds {
    /// First address of the executable region.
    pub start: u32,
    /// One past the last address of the executable region.
    pub end: u32,
}

impl CodeBounds {
    /// Bounds that only guard against wrapping below address zero.
    pub const UNBOUNDED: Self = Self { start: 0, end: u32::MAX };

    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Returns whether a full instruction word at `address` lies inside the region.
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end && self.end - address >= 4
    }

    /// Bounds ending at the `_etext` symbol exported by the linker script.
    #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode"), feature = "etext"))]
    pub fn from_linker() -> Self {
        unsafe extern "C" {
            static _etext: u8;
        }

        Self { start: 0, end: (&raw const _etext) as usize as u32 }
    }

    /// Without an `_etext` symbol the scan is only protected against wrap-around.
    #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode"), not(feature = "etext")))]
    pub fn from_linker() -> Self {
        Self::UNBOUNDED
    }
}

impl Default for CodeBounds {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}
