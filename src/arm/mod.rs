pub mod opcode;
pub mod unwind;

// The hook is ARM-state assembly, which Thumb-only cores cannot run.
#[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))]
pub mod trampoline;

#[cfg(test)]
pub(crate) mod tests;
