use crate::error::{Error, StResult};

const WORD_SIZE: u32 = core::mem::size_of::<u32>() as u32;

/// The `MemoryReader` trait is the only way the unwinder touches memory: it
/// fetches instruction words while scanning code and saved registers while
/// scanning the stack.
pub trait MemoryReader {
    /// Reads the 32-bit little-endian word at `address`.
    fn read_word(&self, address: u32) -> StResult<u32>;
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read_word(&self, address: u32) -> StResult<u32> {
        (**self).read_word(address)
    }
}

/// Reads the live address space of the running target.
#[derive(Debug, Clone, Copy)]
pub struct TargetMemory {
    _private: (),
}

impl TargetMemory {
    /// # Safety
    ///
    /// Every word address handed to [`MemoryReader::read_word`] through this
    /// reader is dereferenced directly. The caller guarantees that the code
    /// region and the stacks being walked are mapped and readable, and that
    /// addresses are meaningful in this address space (i.e. the target is a
    /// 32-bit ARM core).
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl MemoryReader for TargetMemory {
    fn read_word(&self, address: u32) -> StResult<u32> {
        if address == 0 || address % WORD_SIZE != 0 {
            return Err(Error::OutOfBoundsRead { address });
        }

        // SAFETY: `TargetMemory::new` requires the caller to vouch for every
        // address reachable by the walk; null and misaligned addresses were
        // rejected above.
        Ok(unsafe { core::ptr::read_volatile(address as usize as *const u32) })
    }
}

/// A read-only window of captured memory, e.g. a code image or a stack dump,
/// starting at `base`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion<'a> {
    pub base: u32,
    pub words: &'a [u32],
}

impl<'a> MemoryRegion<'a> {
    pub const fn new(base: u32, words: &'a [u32]) -> Self {
        Self { base, words }
    }

    /// Returns whether `address` is a word address covered by this region.
    pub fn contains(&self, address: u32) -> bool {
        self.index_of(address).is_some()
    }

    fn index_of(&self, address: u32) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        if offset % WORD_SIZE != 0 {
            return None;
        }
        let index = (offset / WORD_SIZE) as usize;
        (index < self.words.len()).then_some(index)
    }
}

impl MemoryReader for MemoryRegion<'_> {
    fn read_word(&self, address: u32) -> StResult<u32> {
        self.index_of(address).map(|index| self.words[index]).ok_or(Error::OutOfBoundsRead { address })
    }
}

impl MemoryReader for [MemoryRegion<'_>] {
    fn read_word(&self, address: u32) -> StResult<u32> {
        self.iter()
            .find(|region| region.contains(address))
            .map_or(Err(Error::OutOfBoundsRead { address }), |region| region.read_word(address))
    }
}
