//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while building or validating compiled code
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Unsupported bytecode version
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// A code word that does not name an opcode
    #[error("Invalid opcode {opcode} at codeword {offset}")]
    InvalidOpcode {
        /// The offending word
        opcode: u32,
        /// Its position in the code word array
        offset: usize,
    },

    /// An operand referring outside the code or a pool
    #[error("Invalid operand at codeword {0}")]
    InvalidOperand(usize),

    /// Instruction runs past the end of the code word array
    #[error("Unexpected end of bytecode")]
    UnexpectedEnd,

    /// A jump or handler targets something that is not an instruction start
    #[error("Invalid jump target {target} at codeword {offset}")]
    InvalidJumpTarget {
        /// Target codeword index
        target: u32,
        /// Position of the referencing word
        offset: usize,
    },

    /// Exception handler ranges that overlap without nesting
    #[error("Malformed exception handler table: {0}")]
    MalformedHandlers(String),

    /// A label was referenced but never bound
    #[error("Unbound label {0}")]
    UnboundLabel(u32),

    /// Mutation attempted after the code was prepared for sharing
    #[error("Code is shared and can no longer be modified")]
    Frozen,
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
