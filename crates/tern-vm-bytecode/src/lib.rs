//! # Tern VM Bytecode
//!
//! Compiled code format for the Tern ECMAScript execution core.
//!
//! ## Design Principles
//!
//! - **Register-based**: Instructions name slots in a register window, not a stack
//! - **Word-coded**: An opcode word followed by a fixed (or self-describing) number of operand words
//! - **Immutable and shareable**: [`StaticCode`] is frozen once prepared for sharing and used through `Arc`
//! - **Serializable**: Can be cached to disk for fast startup

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builder;
pub mod code;
pub mod error;
pub mod opcode;
pub mod operand;
pub mod profile;

pub use builder::{CodeBuilder, Label};
pub use code::{
    CodeFlags, CodeKind, ConstantArrayLiteral, ConstantValue, DebugRecord, DebugRecordKind,
    ExceptionHandler, FunctionDeclaration, GlobalAccess, GlobalAccessKind, HandlerKind,
    InnerScope, ObjectLiteralClass, RegExpTemplate, SourceLocation, StaticCode, SwitchTable,
};
pub use error::{BytecodeError, Result};
pub use opcode::{BuiltinError, Opcode, instruction_length};
pub use operand::{CodeWord, NO_SCOPE, Register};
pub use profile::{GET_CACHE_HIT, GET_FAILED_INLINE, ProfileData};

/// Bytecode format version
pub const BYTECODE_VERSION: u32 = 1;

/// Register holding `this` on entry and the return value on exit
pub const THIS_REGISTER: Register = Register(0);

/// Register holding the callee function object
pub const CALLEE_REGISTER: Register = Register(1);

/// First register holding a call argument
pub const FIRST_ARGUMENT_REGISTER: u32 = 2;
