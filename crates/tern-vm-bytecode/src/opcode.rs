//! Opcode set and instruction decoding
//!
//! Every instruction is one opcode word followed by its operands. Most
//! opcodes have a fixed operand count; [`Opcode::NewObjectLiteral`] and
//! [`Opcode::NewFunction`] carry their trailing register count as the third
//! operand so the stream stays self-describing.
//!
//! Jump targets are absolute codeword indices.

use serde::{Deserialize, Serialize};

use crate::operand::CodeWord;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $operands:expr,)*) => {
        /// Instruction opcodes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum Opcode {
            $($(#[$doc])* $name,)*
        }

        impl Opcode {
            /// All opcodes, indexed by their word value
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Number of fixed operand words following the opcode word
            pub const fn operand_count(self) -> usize {
                match self {
                    $(Opcode::$name => $operands,)*
                }
            }

            /// Mnemonic, for disassembly and diagnostics
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    /// `dst`
    LoadUndefined = 1,
    /// `dst`
    LoadNull = 1,
    /// `dst`
    LoadTrue = 1,
    /// `dst`
    LoadFalse = 1,
    /// `dst imm` (immediate is an `i32` bit pattern)
    LoadInt32 = 2,
    /// `dst double_index`
    LoadDouble = 2,
    /// `dst string_index`
    LoadString = 2,
    /// `dst`
    LoadGlobalObject = 1,
    /// `dst src`
    Copy = 2,

    /// `dst src`
    ToNumber = 2,
    /// `dst src format_cache`
    ToString = 3,
    /// `dst src`
    TypeOf = 2,
    /// `dst src`
    Not = 2,

    /// `dst lhs rhs`
    Add = 3,
    /// `dst lhs rhs`
    Sub = 3,
    /// `dst lhs rhs`
    Mul = 3,
    /// `dst lhs rhs`
    Div = 3,
    /// `dst lhs rhs`
    Rem = 3,
    /// `dst lhs rhs`
    BitAnd = 3,
    /// `dst lhs rhs`
    BitOr = 3,
    /// `dst lhs rhs`
    BitXor = 3,
    /// `dst lhs rhs`
    Shl = 3,
    /// `dst lhs rhs`
    Shr = 3,
    /// `dst lhs rhs`
    ShrU = 3,
    /// `dst lhs imm`
    AddImm = 3,
    /// `dst src`
    Neg = 2,
    /// `reg`
    Inc = 1,
    /// `reg`
    Dec = 1,

    /// `lhs rhs`, sets the implicit flag
    Eq = 2,
    /// `lhs rhs`, sets the implicit flag
    Neq = 2,
    /// `lhs rhs`, sets the implicit flag
    StrictEq = 2,
    /// `lhs rhs`, sets the implicit flag
    StrictNeq = 2,
    /// `lhs rhs`, sets the implicit flag
    Lt = 2,
    /// `lhs rhs`, sets the implicit flag
    Lte = 2,
    /// `lhs rhs`, sets the implicit flag
    Gt = 2,
    /// `lhs rhs`, sets the implicit flag
    Gte = 2,
    /// `src`, sets the implicit flag
    IsNullOrUndefined = 1,
    /// `src`, sets the implicit flag to ToBoolean(src)
    Condition = 1,

    /// `target`
    Jump = 1,
    /// `target`
    JumpIfTrue = 1,
    /// `target`
    JumpIfFalse = 1,
    /// `reg` holding a codeword index
    JumpIndirect = 1,
    /// `src switch_table`
    TableSwitch = 2,

    /// `dst object name get_cache`
    GetN = 4,
    /// `object name src put_cache`
    PutN = 4,
    /// `object name src`
    InitProperty = 3,
    /// `dst object name`
    DeleteN = 3,
    /// `dst object key`
    Get = 3,
    /// `object key src`
    Put = 3,
    /// `dst object key`
    Delete = 3,
    /// `dst key object`
    In = 3,

    /// `dst global_access`
    GetGlobal = 2,
    /// `dst global_access`, yields undefined when the name is absent
    GetGlobalQuiet = 2,
    /// `global_access src`
    PutGlobal = 2,
    /// `dst name inner_scope`
    GetScope = 3,
    /// `name src inner_scope`
    PutScope = 3,

    /// `dst`
    NewObject = 1,
    /// `dst class_index count value_regs...`
    NewObjectLiteral = 3,
    /// `dst length`
    NewArray = 2,
    /// `dst template_index`
    NewArrayLiteral = 2,
    /// `dst function_index count scope_regs...`
    NewFunction = 3,
    /// `dst regexp_index`
    NewRegExp = 2,
    /// `dst`
    Arguments = 1,

    /// `frame_start argc`
    Call = 2,
    /// `frame_start argc`
    Construct = 2,
    /// `frame_start argc eval_cache`
    Eval = 3,
    /// `frame_start argc`
    Apply = 2,
    /// `function apply`
    RedirectedCall = 2,

    /// `src`
    ReturnValue = 1,
    /// no operands
    ReturnNoValue = 0,
    /// no operands, ends program and eval code with register 0 as result
    Exit = 0,

    /// `src`
    Throw = 1,
    /// `builtin_error`
    ThrowBuiltin = 1,
    /// `dst`
    Catch = 1,
    /// `exception target next_target`
    Rethrow = 3,
}

impl Opcode {
    /// Decode an opcode word
    #[inline]
    pub fn from_word(word: CodeWord) -> Option<Self> {
        Self::ALL.get(word as usize).copied()
    }

    /// Whether the instruction carries trailing registers counted by its third operand
    #[inline]
    pub const fn is_variable_length(self) -> bool {
        matches!(self, Opcode::NewObjectLiteral | Opcode::NewFunction)
    }

    /// Whether the first operand is a direct jump target
    #[inline]
    pub const fn is_direct_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse)
    }
}

impl From<Opcode> for CodeWord {
    fn from(op: Opcode) -> Self {
        op as CodeWord
    }
}

/// Length in words of the instruction starting at `at`, or `None` when it is
/// not a valid instruction or runs past the end.
pub fn instruction_length(words: &[CodeWord], at: usize) -> Option<usize> {
    let op = Opcode::from_word(*words.get(at)?)?;
    let mut len = 1 + op.operand_count();
    if op.is_variable_length() {
        len += *words.get(at + 3)? as usize;
    }
    (at + len <= words.len()).then_some(len)
}

/// Error kinds raised by [`Opcode::ThrowBuiltin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum BuiltinError {
    /// `TypeError`
    TypeError = 0,
    /// `ReferenceError`
    ReferenceError = 1,
    /// `RangeError`
    RangeError = 2,
    /// `SyntaxError`
    SyntaxError = 3,
    /// `EvalError`
    EvalError = 4,
    /// `URIError`
    URIError = 5,
}

impl BuiltinError {
    /// Decode an operand word
    pub fn from_word(word: CodeWord) -> Option<Self> {
        Some(match word {
            0 => Self::TypeError,
            1 => Self::ReferenceError,
            2 => Self::RangeError,
            3 => Self::SyntaxError,
            4 => Self::EvalError,
            5 => Self::URIError,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_round_trip_through_table() {
        for (index, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index);
            assert_eq!(Opcode::from_word(index as u32), Some(*op));
        }
        assert_eq!(Opcode::from_word(Opcode::ALL.len() as u32), None);
    }

    #[test]
    fn test_variable_length_instruction() {
        let words = [Opcode::NewObjectLiteral as u32, 2, 0, 2, 3, 4, Opcode::Exit as u32];
        assert_eq!(instruction_length(&words, 0), Some(6));
        assert_eq!(instruction_length(&words, 6), Some(1));
        assert_eq!(instruction_length(&words[..5], 0), None);
    }
}
