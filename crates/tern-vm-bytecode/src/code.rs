//! Immutable compiled code
//!
//! A [`StaticCode`] is everything the compiler produces for one program,
//! function or eval body. It holds no per-global state and is shared by every
//! code instance (and every closure) created from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};
use crate::opcode::{Opcode, instruction_length};
use crate::operand::CodeWord;
use crate::profile::ProfileData;

/// What a piece of code was compiled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    /// Top-level script
    Program,
    /// Function body
    Function,
    /// Body of a direct `eval`; transparent when walking for the calling code
    Eval,
}

/// Code-level flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlags {
    /// Strict mode code
    pub is_strict: bool,
    /// Body refers to `arguments`
    pub uses_arguments: bool,
    /// Body contains a direct `eval`
    pub uses_eval: bool,
    /// Body forwards its arguments with `f.apply(this, arguments)`
    pub has_redirected_call: bool,
    /// Program leaves its completion value in register 0
    pub generate_result: bool,
}

/// Exception handler kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// `catch` block
    Catch,
    /// `finally` block
    Finally,
}

/// A protected code range and where to go when it is left abruptly.
///
/// The range covers the instructions that start in `[start, end)`. Handlers
/// nested inside this range are kept in `nested`, sorted by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    /// Handler kind
    pub kind: HandlerKind,
    /// First codeword of the protected range
    pub start: u32,
    /// One past the last codeword of the protected range
    pub end: u32,
    /// Codeword index the handler code starts at
    pub handler_ip: u32,
    /// Handlers for ranges inside this one
    pub nested: Vec<ExceptionHandler>,
}

impl ExceptionHandler {
    /// Whether the instruction that ends just before `ip` is protected.
    ///
    /// `ip` is the position after the instruction, as seen by the dispatch
    /// loop once operands are consumed.
    #[inline]
    pub fn covers(&self, ip: u32) -> bool {
        self.start < ip && ip <= self.end
    }

    /// Whether a jump to `target` stays inside the protected range
    #[inline]
    pub fn contains_target(&self, target: u32) -> bool {
        self.start <= target && target < self.end
    }
}

/// Registers holding the objects of an inner (`with`/`catch`) scope, innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerScope {
    /// Scope object registers
    pub registers: Vec<u32>,
}

/// Source position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
    /// Length of the source extent
    pub length: u32,
}

/// What a debug record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugRecordKind {
    /// Extent of a statement or expression
    Extent,
    /// Base expression of a call or property access, for error messages
    BaseExpression,
}

/// Maps a codeword index to a source location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugRecord {
    /// First codeword the record applies to
    pub codeword_index: u32,
    /// Record kind
    pub kind: DebugRecordKind,
    /// Source position
    pub location: SourceLocation,
}

/// How a global name is accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalAccessKind {
    /// Read
    Get,
    /// Read in a `typeof` context
    GetQuiet,
    /// Write
    Put,
}

/// One global access site; the index doubles as the global cache index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalAccess {
    /// Name, as a string pool index
    pub name: u32,
    /// Access kind
    pub kind: GlobalAccessKind,
}

/// Dense integer switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTable {
    /// Case value of `targets[0]`
    pub minimum: i32,
    /// Codeword targets for consecutive case values
    pub targets: Vec<u32>,
    /// Target when the value is out of range or not an integer
    pub default_target: u32,
}

/// Property names of an object literal, in definition order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLiteralClass {
    /// String pool indices
    pub properties: Vec<u32>,
}

/// A compile-time constant element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// Small integer
    Int32(i32),
    /// Double
    Double(f64),
    /// String pool index
    String(u32),
}

/// Array literal whose elements are all constants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantArrayLiteral {
    /// Elements
    pub elements: Vec<ConstantValue>,
}

/// Regular expression literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegExpTemplate {
    /// Pattern, as a string pool index
    pub source: u32,
    /// Flags, as a string pool index
    pub flags: u32,
}

/// A `function name() {}` declaration hoisted to program start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// Name, as a string pool index
    pub name: u32,
    /// Index into the nested function pool
    pub function: u32,
}

/// Sharing state: a share count and a cache-ownership count (at most one)
#[derive(Debug, Default)]
struct SharingState {
    ref_count: AtomicU32,
    cache_ref_count: AtomicU32,
    prepared: AtomicBool,
}

/// Immutable compiled code.
#[derive(Debug, Serialize, Deserialize)]
pub struct StaticCode {
    /// What this code was compiled from
    pub kind: CodeKind,
    /// Function name (programs and eval code have none)
    pub name: Option<Arc<str>>,
    /// Source URL, for stack traces
    pub url: Option<Arc<str>>,

    /// Opcode and operand words
    pub codewords: Vec<CodeWord>,
    /// Start index of every instruction, ascending
    pub instruction_offsets: Vec<u32>,

    /// Registers a call to this code needs
    pub register_frame_size: u32,
    /// First register not bound to a formal or local
    pub first_temporary_register: u32,
    /// Declared parameter count
    pub formals_count: u32,
    /// Names of formals then locals (string pool indices), in register order from 2
    pub formals_and_locals: Vec<u32>,
    /// Program-level `var` names
    pub variable_declarations: Vec<u32>,
    /// Program-level function declarations
    pub function_declarations: Vec<FunctionDeclaration>,

    /// String pool
    pub strings: Vec<Arc<str>>,
    /// Double pool
    pub doubles: Vec<f64>,
    /// Nested function code
    pub functions: Vec<Arc<StaticCode>>,
    /// Object literal layouts
    pub object_literal_classes: Vec<ObjectLiteralClass>,
    /// Constant array literals
    pub constant_array_literals: Vec<ConstantArrayLiteral>,
    /// Regular expression literals
    pub regexps: Vec<RegExpTemplate>,
    /// Global access sites
    pub global_accesses: Vec<GlobalAccess>,
    /// Switch tables
    pub switch_tables: Vec<SwitchTable>,
    /// Top-level exception handlers, sorted by `start`
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Inner scope descriptors
    pub inner_scopes: Vec<InnerScope>,
    /// Debug records, sorted by `codeword_index`
    pub debug_records: Vec<DebugRecord>,

    /// Named get cache sites
    pub property_get_caches_count: u32,
    /// Named put cache sites
    pub property_put_caches_count: u32,
    /// Format string cache sites
    pub format_string_caches_count: u32,
    /// Eval cache sites
    pub eval_caches_count: u32,

    /// Flags
    pub flags: CodeFlags,
    /// Source text, kept for function `toString` and the program cache
    pub source: Option<Arc<str>>,

    #[serde(skip)]
    sharing: SharingState,
    #[serde(skip)]
    profile: ProfileData,
}

impl StaticCode {
    /// Create empty code of the given kind
    pub fn new(kind: CodeKind) -> Self {
        Self {
            kind,
            name: None,
            url: None,
            codewords: Vec::new(),
            instruction_offsets: Vec::new(),
            register_frame_size: 2,
            first_temporary_register: 2,
            formals_count: 0,
            formals_and_locals: Vec::new(),
            variable_declarations: Vec::new(),
            function_declarations: Vec::new(),
            strings: Vec::new(),
            doubles: Vec::new(),
            functions: Vec::new(),
            object_literal_classes: Vec::new(),
            constant_array_literals: Vec::new(),
            regexps: Vec::new(),
            global_accesses: Vec::new(),
            switch_tables: Vec::new(),
            exception_handlers: Vec::new(),
            inner_scopes: Vec::new(),
            debug_records: Vec::new(),
            property_get_caches_count: 0,
            property_put_caches_count: 0,
            format_string_caches_count: 0,
            eval_caches_count: 0,
            flags: CodeFlags::default(),
            source: None,
            sharing: SharingState::default(),
            profile: ProfileData::default(),
        }
    }

    /// Name used in stack traces
    pub fn display_name(&self) -> &str {
        match (&self.name, self.kind) {
            (Some(name), _) => name,
            (None, CodeKind::Function) => "<anonymous>",
            (None, CodeKind::Program) => "<program>",
            (None, CodeKind::Eval) => "<eval>",
        }
    }

    /// Number of global cache sites
    #[inline]
    pub fn global_caches_count(&self) -> usize {
        self.global_accesses.len()
    }

    /// String at a pool index
    #[inline]
    pub fn string(&self, index: u32) -> Option<&Arc<str>> {
        self.strings.get(index as usize)
    }

    /// Profiling bytes for this code
    #[inline]
    pub fn profile(&self) -> &ProfileData {
        &self.profile
    }

    /// Recompute [`Self::instruction_offsets`], validating the word stream.
    pub fn find_instruction_offsets(&mut self) -> Result<()> {
        if self.is_shared() {
            return Err(BytecodeError::Frozen);
        }
        let mut offsets = Vec::new();
        let mut at = 0usize;
        while at < self.codewords.len() {
            let word = self.codewords[at];
            if Opcode::from_word(word).is_none() {
                return Err(BytecodeError::InvalidOpcode {
                    opcode: word,
                    offset: at,
                });
            }
            let len =
                instruction_length(&self.codewords, at).ok_or(BytecodeError::UnexpectedEnd)?;
            offsets.push(at as u32);
            at += len;
        }
        self.instruction_offsets = offsets;
        Ok(())
    }

    /// Whether `target` is the start of an instruction
    pub fn is_instruction_start(&self, target: u32) -> bool {
        self.instruction_offsets.binary_search(&target).is_ok()
    }

    /// Check operand references, jump targets and the handler tree.
    ///
    /// Expects [`Self::find_instruction_offsets`] to have run.
    pub fn validate(&self) -> Result<()> {
        let jump_target = |target: u32, offset: usize| {
            if self.is_instruction_start(target) {
                Ok(())
            } else {
                Err(BytecodeError::InvalidJumpTarget { target, offset })
            }
        };
        let pool_index = |index: u32, len: usize, offset: usize| {
            if (index as usize) < len {
                Ok(())
            } else {
                Err(BytecodeError::InvalidOperand(offset))
            }
        };

        for &start in &self.instruction_offsets {
            let at = start as usize;
            let op = Opcode::from_word(self.codewords[at]).ok_or(BytecodeError::InvalidOpcode {
                opcode: self.codewords[at],
                offset: at,
            })?;
            let operand = |n: usize| self.codewords[at + 1 + n];
            match op {
                _ if op.is_direct_jump() => jump_target(operand(0), at + 1)?,
                Opcode::LoadDouble => pool_index(operand(1), self.doubles.len(), at + 2)?,
                Opcode::LoadString => pool_index(operand(1), self.strings.len(), at + 2)?,
                Opcode::ToString => pool_index(
                    operand(2),
                    self.format_string_caches_count as usize,
                    at + 3,
                )?,
                Opcode::GetN => {
                    pool_index(operand(2), self.strings.len(), at + 3)?;
                    pool_index(operand(3), self.property_get_caches_count as usize, at + 4)?;
                }
                Opcode::PutN => {
                    pool_index(operand(1), self.strings.len(), at + 2)?;
                    pool_index(operand(3), self.property_put_caches_count as usize, at + 4)?;
                }
                Opcode::InitProperty => pool_index(operand(1), self.strings.len(), at + 2)?,
                Opcode::DeleteN => pool_index(operand(2), self.strings.len(), at + 3)?,
                Opcode::GetGlobal | Opcode::GetGlobalQuiet => {
                    pool_index(operand(1), self.global_accesses.len(), at + 2)?
                }
                Opcode::PutGlobal => pool_index(operand(0), self.global_accesses.len(), at + 1)?,
                Opcode::GetScope => pool_index(operand(1), self.strings.len(), at + 2)?,
                Opcode::PutScope => pool_index(operand(0), self.strings.len(), at + 1)?,
                Opcode::TableSwitch => {
                    pool_index(operand(1), self.switch_tables.len(), at + 2)?;
                    let table = &self.switch_tables[operand(1) as usize];
                    jump_target(table.default_target, at + 2)?;
                    for &target in &table.targets {
                        jump_target(target, at + 2)?;
                    }
                }
                Opcode::NewObjectLiteral => {
                    pool_index(operand(1), self.object_literal_classes.len(), at + 2)?;
                    let class = &self.object_literal_classes[operand(1) as usize];
                    if class.properties.len() != operand(2) as usize {
                        return Err(BytecodeError::InvalidOperand(at + 3));
                    }
                }
                Opcode::NewArrayLiteral => {
                    pool_index(operand(1), self.constant_array_literals.len(), at + 2)?
                }
                Opcode::NewFunction => pool_index(operand(1), self.functions.len(), at + 2)?,
                Opcode::NewRegExp => pool_index(operand(1), self.regexps.len(), at + 2)?,
                Opcode::Eval => pool_index(operand(2), self.eval_caches_count as usize, at + 3)?,
                _ => {}
            }
        }

        fn check_handlers(
            code: &StaticCode,
            handlers: &[ExceptionHandler],
            outer: Option<&ExceptionHandler>,
        ) -> Result<()> {
            let mut previous_end = 0;
            for handler in handlers {
                if handler.start >= handler.end || handler.start < previous_end {
                    return Err(BytecodeError::MalformedHandlers(format!(
                        "range {}..{} overlaps a sibling",
                        handler.start, handler.end
                    )));
                }
                if let Some(outer) = outer
                    && (handler.start < outer.start || handler.end > outer.end)
                {
                    return Err(BytecodeError::MalformedHandlers(format!(
                        "range {}..{} escapes its parent",
                        handler.start, handler.end
                    )));
                }
                if !code.is_instruction_start(handler.handler_ip) {
                    return Err(BytecodeError::InvalidJumpTarget {
                        target: handler.handler_ip,
                        offset: handler.start as usize,
                    });
                }
                previous_end = handler.end;
                check_handlers(code, &handler.nested, Some(handler))?;
            }
            Ok(())
        }
        check_handlers(self, &self.exception_handlers, None)?;

        for code in &self.functions {
            code.validate()?;
        }
        Ok(())
    }

    fn covering_chain(&self, ip: u32) -> Vec<&ExceptionHandler> {
        let mut chain = Vec::new();
        let mut level = self.exception_handlers.as_slice();
        loop {
            let candidate = level.partition_point(|handler| handler.end < ip);
            match level.get(candidate) {
                Some(handler) if handler.covers(ip) => {
                    chain.push(handler);
                    level = &handler.nested;
                }
                _ => return chain,
            }
        }
    }

    /// Innermost handler protecting the instruction that ends at `ip`
    pub fn find_exception_handler(&self, ip: u32) -> Option<&ExceptionHandler> {
        self.covering_chain(ip).pop()
    }

    /// Innermost `finally` handler that a jump from `ip` to `target` leaves.
    ///
    /// Returns `None` when the jump stays inside every `finally` range that
    /// protects `ip`.
    pub fn find_finally_handler(&self, ip: u32, target: u32) -> Option<&ExceptionHandler> {
        for handler in self.covering_chain(ip).into_iter().rev() {
            if handler.contains_target(target) {
                return None;
            }
            if handler.kind == HandlerKind::Finally {
                return Some(handler);
            }
        }
        None
    }

    /// Debug record in effect at `ip`
    pub fn find_debug_record(&self, ip: u32) -> Option<&DebugRecord> {
        let index = self
            .debug_records
            .partition_point(|record| record.codeword_index <= ip);
        index.checked_sub(1).map(|index| &self.debug_records[index])
    }

    /// Freeze the code so it can be shared between code instances
    pub fn prepare_for_sharing(&self) {
        self.sharing.prepared.store(true, Ordering::Release);
    }

    /// Whether [`Self::prepare_for_sharing`] has run
    pub fn is_shared(&self) -> bool {
        self.sharing.prepared.load(Ordering::Acquire)
    }

    /// Register one more code instance using this code
    pub fn increment_ref(&self) {
        self.sharing.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregister a code instance; returns the remaining count
    pub fn decrement_ref(&self) -> u32 {
        let previous = self.sharing.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "share count underflow");
        previous.saturating_sub(1)
    }

    /// Code instances currently using this code
    pub fn ref_count(&self) -> u32 {
        self.sharing.ref_count.load(Ordering::Acquire)
    }

    /// Take cache ownership; fails if a cache already owns this code
    pub fn acquire_cache_ref(&self) -> bool {
        self.sharing
            .cache_ref_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up cache ownership
    pub fn release_cache_ref(&self) {
        let previous = self.sharing.cache_ref_count.swap(0, Ordering::AcqRel);
        debug_assert_eq!(previous, 1, "cache reference released twice");
    }

    /// Whether a cache owns this code
    pub fn is_cached(&self) -> bool {
        self.sharing.cache_ref_count.load(Ordering::Acquire) != 0
    }
}
