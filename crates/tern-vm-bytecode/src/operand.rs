//! Bytecode operands

use serde::{Deserialize, Serialize};

/// One element of the code word array: an opcode or an operand
pub type CodeWord = u32;

/// Scope operand meaning "no inner scope"
pub const NO_SCOPE: u32 = u32::MAX;

/// Index of a slot in the current register window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Register(pub u32);

impl Register {
    /// Create a new register
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get register index
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl From<u32> for Register {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl From<Register> for CodeWord {
    fn from(register: Register) -> Self {
        register.0
    }
}
