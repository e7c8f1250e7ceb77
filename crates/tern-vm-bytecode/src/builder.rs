//! Assembler for [`StaticCode`]
//!
//! Stands in for a compiler front end: it interns pool entries, allocates
//! registers and cache sites, resolves labels, and nests a flat list of
//! exception handlers into the tree the dispatch loop searches.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::code::{
    CodeFlags, CodeKind, ConstantArrayLiteral, ConstantValue, DebugRecord, DebugRecordKind,
    ExceptionHandler, FunctionDeclaration, GlobalAccess, GlobalAccessKind, HandlerKind,
    InnerScope, ObjectLiteralClass, RegExpTemplate, SourceLocation, StaticCode, SwitchTable,
};
use crate::error::{BytecodeError, Result};
use crate::opcode::{BuiltinError, Opcode};
use crate::operand::{CodeWord, NO_SCOPE, Register};

/// A position in the code word array, bound later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug)]
struct PendingHandler {
    kind: HandlerKind,
    start: Label,
    end: Label,
    handler: Label,
}

#[derive(Debug)]
struct PendingSwitch {
    minimum: i32,
    targets: Vec<Label>,
    default_target: Label,
}

/// Builds one [`StaticCode`].
#[derive(Debug)]
pub struct CodeBuilder {
    code: StaticCode,
    strings: FxHashMap<Arc<str>, u32>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    handlers: Vec<PendingHandler>,
    switches: Vec<PendingSwitch>,
    next_temporary: u32,
    pending_location: Option<SourceLocation>,
}

impl CodeBuilder {
    fn new(kind: CodeKind) -> Self {
        Self {
            code: StaticCode::new(kind),
            strings: FxHashMap::default(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            switches: Vec::new(),
            next_temporary: 2,
            pending_location: None,
        }
    }

    /// Builder for a top-level program
    pub fn program() -> Self {
        let mut builder = Self::new(CodeKind::Program);
        builder.code.flags.generate_result = true;
        builder
    }

    /// Builder for direct eval code
    pub fn eval_code() -> Self {
        let mut builder = Self::new(CodeKind::Eval);
        builder.code.flags.generate_result = true;
        builder
    }

    /// Builder for a function with named formals (registers 2..)
    pub fn function(name: &str, formals: &[&str]) -> Self {
        let mut builder = Self::new(CodeKind::Function);
        builder.code.name = Some(Arc::from(name));
        builder.code.formals_count = formals.len() as u32;
        for formal in formals {
            let index = builder.string(formal);
            builder.code.formals_and_locals.push(index);
        }
        builder.next_temporary = 2 + formals.len() as u32;
        builder
    }

    /// Register bound to the `n`th formal
    pub fn formal(&self, n: u32) -> Register {
        debug_assert!(n < self.code.formals_count);
        Register(2 + n)
    }

    /// Declare a named local; must precede any temporary allocation
    pub fn local(&mut self, name: &str) -> Register {
        debug_assert_eq!(
            self.next_temporary,
            2 + self.code.formals_and_locals.len() as u32,
            "locals must be declared before temporaries"
        );
        let index = self.string(name);
        self.code.formals_and_locals.push(index);
        let register = Register(self.next_temporary);
        self.next_temporary += 1;
        register
    }

    /// Allocate a fresh temporary register
    pub fn temp(&mut self) -> Register {
        if self.code.first_temporary_register < 2 + self.code.formals_and_locals.len() as u32 {
            self.code.first_temporary_register = 2 + self.code.formals_and_locals.len() as u32;
        }
        let register = Register(self.next_temporary);
        self.next_temporary += 1;
        register
    }

    /// Allocate `2 + argc` consecutive temporaries for a call; returns the frame start.
    ///
    /// The callee's window starts at the frame start and runs past the end of
    /// the caller's registers, so temporaries allocated after the call frame
    /// do not survive the call.
    pub fn call_frame(&mut self, argc: u32) -> Register {
        let start = self.temp();
        for _ in 0..argc + 1 {
            self.temp();
        }
        start
    }

    /// Mark as strict mode code
    pub fn strict(&mut self) -> &mut Self {
        self.code.flags.is_strict = true;
        self
    }

    /// Set flags directly
    pub fn flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.code.flags = flags;
        self
    }

    /// Attach source text and URL
    pub fn source(&mut self, url: &str, text: &str) -> &mut Self {
        self.code.url = Some(Arc::from(url));
        self.code.source = Some(Arc::from(text));
        self
    }

    /// Intern a string, returning its pool index
    pub fn string(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.strings.get(value) {
            return index;
        }
        let value: Arc<str> = Arc::from(value);
        let index = self.code.strings.len() as u32;
        self.code.strings.push(value.clone());
        self.strings.insert(value, index);
        index
    }

    /// Add a double to the pool
    pub fn double(&mut self, value: f64) -> u32 {
        if let Some(index) = self
            .code
            .doubles
            .iter()
            .position(|d| d.to_bits() == value.to_bits())
        {
            return index as u32;
        }
        self.code.doubles.push(value);
        (self.code.doubles.len() - 1) as u32
    }

    /// Add nested function code to the pool
    pub fn add_function(&mut self, code: StaticCode) -> u32 {
        self.code.functions.push(Arc::new(code));
        (self.code.functions.len() - 1) as u32
    }

    /// Declare a program-level `var`
    pub fn declare_variable(&mut self, name: &str) -> &mut Self {
        let index = self.string(name);
        self.code.variable_declarations.push(index);
        self
    }

    /// Declare a program-level function, bound to `name` at program start
    pub fn declare_function(&mut self, name: &str, code: StaticCode) -> &mut Self {
        let name = self.string(name);
        let function = self.add_function(code);
        self.code
            .function_declarations
            .push(FunctionDeclaration { name, function });
        self
    }

    /// Define an inner scope made of the given object registers, innermost first
    pub fn inner_scope(&mut self, registers: &[Register]) -> u32 {
        self.code.inner_scopes.push(InnerScope {
            registers: registers.iter().map(|r| r.0).collect(),
        });
        (self.code.inner_scopes.len() - 1) as u32
    }

    /// Create an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the current position
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0 as usize] = Some(self.position());
        self
    }

    /// Current codeword index
    pub fn position(&self) -> u32 {
        self.code.codewords.len() as u32
    }

    /// Attach a source location to the next instruction
    pub fn location(&mut self, line: u32, column: u32) -> &mut Self {
        self.pending_location = Some(SourceLocation {
            line,
            column,
            length: 0,
        });
        self
    }

    /// Protect `[start, end)` with a handler at `handler`
    pub fn handler(&mut self, kind: HandlerKind, start: Label, end: Label, handler: Label) -> &mut Self {
        self.handlers.push(PendingHandler {
            kind,
            start,
            end,
            handler,
        });
        self
    }

    /// Emit a raw instruction
    pub fn emit(&mut self, op: Opcode, operands: &[CodeWord]) -> &mut Self {
        if let Some(location) = self.pending_location.take() {
            self.code.debug_records.push(DebugRecord {
                codeword_index: self.position(),
                kind: DebugRecordKind::Extent,
                location,
            });
        }
        debug_assert!(
            operands.len() == op.operand_count()
                || (op.is_variable_length()
                    && operands.len() == op.operand_count() + operands[2] as usize)
        );
        self.code.codewords.push(op.into());
        self.code.codewords.extend_from_slice(operands);
        self
    }

    fn emit_with_label(&mut self, op: Opcode, before: &[CodeWord], label: Label) -> &mut Self {
        let mut operands = before.to_vec();
        operands.push(0);
        self.emit(op, &operands);
        let at = self.code.codewords.len() - 1;
        self.fixups.push((at, label));
        self
    }

    /// `dst = undefined`
    pub fn load_undefined(&mut self, dst: Register) -> &mut Self {
        self.emit(Opcode::LoadUndefined, &[dst.0])
    }

    /// `dst = null`
    pub fn load_null(&mut self, dst: Register) -> &mut Self {
        self.emit(Opcode::LoadNull, &[dst.0])
    }

    /// `dst = value`
    pub fn load_bool(&mut self, dst: Register, value: bool) -> &mut Self {
        let op = if value { Opcode::LoadTrue } else { Opcode::LoadFalse };
        self.emit(op, &[dst.0])
    }

    /// `dst = value`
    pub fn load_int(&mut self, dst: Register, value: i32) -> &mut Self {
        self.emit(Opcode::LoadInt32, &[dst.0, value as u32])
    }

    /// `dst = value`
    pub fn load_double(&mut self, dst: Register, value: f64) -> &mut Self {
        let index = self.double(value);
        self.emit(Opcode::LoadDouble, &[dst.0, index])
    }

    /// `dst = "value"`
    pub fn load_string(&mut self, dst: Register, value: &str) -> &mut Self {
        let index = self.string(value);
        self.emit(Opcode::LoadString, &[dst.0, index])
    }

    /// `dst = <codeword index of label>`, for finally targets
    pub fn load_label(&mut self, dst: Register, label: Label) -> &mut Self {
        self.emit_with_label(Opcode::LoadInt32, &[dst.0], label)
    }

    /// `dst = globalThis`
    pub fn load_global_object(&mut self, dst: Register) -> &mut Self {
        self.emit(Opcode::LoadGlobalObject, &[dst.0])
    }

    /// `dst = src`
    pub fn copy(&mut self, dst: Register, src: Register) -> &mut Self {
        self.emit(Opcode::Copy, &[dst.0, src.0])
    }

    /// Three-register arithmetic or bitwise instruction
    pub fn binary(&mut self, op: Opcode, dst: Register, lhs: Register, rhs: Register) -> &mut Self {
        self.emit(op, &[dst.0, lhs.0, rhs.0])
    }

    /// `dst = lhs + rhs`
    pub fn add(&mut self, dst: Register, lhs: Register, rhs: Register) -> &mut Self {
        self.binary(Opcode::Add, dst, lhs, rhs)
    }

    /// `dst = lhs + imm`
    pub fn add_imm(&mut self, dst: Register, lhs: Register, imm: i32) -> &mut Self {
        self.emit(Opcode::AddImm, &[dst.0, lhs.0, imm as u32])
    }

    /// Two-register instruction (`Neg`, `Not`, `TypeOf`, `ToNumber`)
    pub fn unary(&mut self, op: Opcode, dst: Register, src: Register) -> &mut Self {
        self.emit(op, &[dst.0, src.0])
    }

    /// `dst = String(src)` through a format string cache site
    pub fn to_string(&mut self, dst: Register, src: Register) -> &mut Self {
        let cache = self.code.format_string_caches_count;
        self.code.format_string_caches_count += 1;
        self.emit(Opcode::ToString, &[dst.0, src.0, cache])
    }

    /// `reg++`
    pub fn inc(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Inc, &[reg.0])
    }

    /// `reg--`
    pub fn dec(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Dec, &[reg.0])
    }

    /// Comparison setting the implicit flag
    pub fn compare(&mut self, op: Opcode, lhs: Register, rhs: Register) -> &mut Self {
        self.emit(op, &[lhs.0, rhs.0])
    }

    /// Set the implicit flag to ToBoolean(src)
    pub fn condition(&mut self, src: Register) -> &mut Self {
        self.emit(Opcode::Condition, &[src.0])
    }

    /// Unconditional jump
    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.emit_with_label(Opcode::Jump, &[], target)
    }

    /// Jump when the implicit flag is set
    pub fn jump_if_true(&mut self, target: Label) -> &mut Self {
        self.emit_with_label(Opcode::JumpIfTrue, &[], target)
    }

    /// Jump when the implicit flag is clear
    pub fn jump_if_false(&mut self, target: Label) -> &mut Self {
        self.emit_with_label(Opcode::JumpIfFalse, &[], target)
    }

    /// Jump to the codeword index held in `reg`
    pub fn jump_indirect(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::JumpIndirect, &[reg.0])
    }

    /// Dense integer switch on `src`
    pub fn table_switch(
        &mut self,
        src: Register,
        minimum: i32,
        targets: &[Label],
        default_target: Label,
    ) -> &mut Self {
        self.switches.push(PendingSwitch {
            minimum,
            targets: targets.to_vec(),
            default_target,
        });
        let table = (self.switches.len() - 1) as u32;
        self.emit(Opcode::TableSwitch, &[src.0, table])
    }

    /// `dst = object.name` through a get cache site
    pub fn get_named(&mut self, dst: Register, object: Register, name: &str) -> &mut Self {
        let name = self.string(name);
        let cache = self.code.property_get_caches_count;
        self.code.property_get_caches_count += 1;
        self.emit(Opcode::GetN, &[dst.0, object.0, name, cache])
    }

    /// `object.name = src` through a put cache site
    pub fn put_named(&mut self, object: Register, name: &str, src: Register) -> &mut Self {
        let name = self.string(name);
        let cache = self.code.property_put_caches_count;
        self.code.property_put_caches_count += 1;
        self.emit(Opcode::PutN, &[object.0, name, src.0, cache])
    }

    /// Define an own data property
    pub fn init_property(&mut self, object: Register, name: &str, src: Register) -> &mut Self {
        let name = self.string(name);
        self.emit(Opcode::InitProperty, &[object.0, name, src.0])
    }

    /// `dst = delete object.name`
    pub fn delete_named(&mut self, dst: Register, object: Register, name: &str) -> &mut Self {
        let name = self.string(name);
        self.emit(Opcode::DeleteN, &[dst.0, object.0, name])
    }

    /// `dst = object[key]`
    pub fn get(&mut self, dst: Register, object: Register, key: Register) -> &mut Self {
        self.emit(Opcode::Get, &[dst.0, object.0, key.0])
    }

    /// `object[key] = src`
    pub fn put(&mut self, object: Register, key: Register, src: Register) -> &mut Self {
        self.emit(Opcode::Put, &[object.0, key.0, src.0])
    }

    /// `dst = delete object[key]`
    pub fn delete(&mut self, dst: Register, object: Register, key: Register) -> &mut Self {
        self.emit(Opcode::Delete, &[dst.0, object.0, key.0])
    }

    /// `dst = key in object`
    pub fn has(&mut self, dst: Register, key: Register, object: Register) -> &mut Self {
        self.emit(Opcode::In, &[dst.0, key.0, object.0])
    }

    fn global_access(&mut self, name: &str, kind: GlobalAccessKind) -> u32 {
        let name = self.string(name);
        self.code.global_accesses.push(GlobalAccess { name, kind });
        (self.code.global_accesses.len() - 1) as u32
    }

    /// `dst = name` (global)
    pub fn get_global(&mut self, dst: Register, name: &str) -> &mut Self {
        let access = self.global_access(name, GlobalAccessKind::Get);
        self.emit(Opcode::GetGlobal, &[dst.0, access])
    }

    /// `dst = name` in a typeof context
    pub fn get_global_quiet(&mut self, dst: Register, name: &str) -> &mut Self {
        let access = self.global_access(name, GlobalAccessKind::GetQuiet);
        self.emit(Opcode::GetGlobalQuiet, &[dst.0, access])
    }

    /// `name = src` (global)
    pub fn put_global(&mut self, name: &str, src: Register) -> &mut Self {
        let access = self.global_access(name, GlobalAccessKind::Put);
        self.emit(Opcode::PutGlobal, &[access, src.0])
    }

    /// `dst = name` resolved through inner scope, closure scope, then globals
    pub fn get_scope(&mut self, dst: Register, name: &str, scope: Option<u32>) -> &mut Self {
        let name = self.string(name);
        self.emit(Opcode::GetScope, &[dst.0, name, scope.unwrap_or(NO_SCOPE)])
    }

    /// `name = src` resolved through inner scope, closure scope, then globals
    pub fn put_scope(&mut self, name: &str, src: Register, scope: Option<u32>) -> &mut Self {
        let name = self.string(name);
        self.emit(Opcode::PutScope, &[name, src.0, scope.unwrap_or(NO_SCOPE)])
    }

    /// `dst = {}`
    pub fn new_object(&mut self, dst: Register) -> &mut Self {
        self.emit(Opcode::NewObject, &[dst.0])
    }

    /// `dst = { name: reg, ... }`
    pub fn new_object_literal(&mut self, dst: Register, properties: &[(&str, Register)]) -> &mut Self {
        let names = properties.iter().map(|(name, _)| self.string(name)).collect();
        self.code
            .object_literal_classes
            .push(ObjectLiteralClass { properties: names });
        let class = (self.code.object_literal_classes.len() - 1) as u32;
        let mut operands = vec![dst.0, class, properties.len() as u32];
        operands.extend(properties.iter().map(|(_, reg)| reg.0));
        self.emit(Opcode::NewObjectLiteral, &operands)
    }

    /// `dst = new Array(length)`
    pub fn new_array(&mut self, dst: Register, length: u32) -> &mut Self {
        self.emit(Opcode::NewArray, &[dst.0, length])
    }

    /// `dst = [constants...]`
    pub fn new_array_literal(&mut self, dst: Register, elements: &[ConstantValue]) -> &mut Self {
        self.code.constant_array_literals.push(ConstantArrayLiteral {
            elements: elements.to_vec(),
        });
        let template = (self.code.constant_array_literals.len() - 1) as u32;
        self.emit(Opcode::NewArrayLiteral, &[dst.0, template])
    }

    /// `dst = function` closing over the objects in `scope`, innermost first
    pub fn new_function(&mut self, dst: Register, code: StaticCode, scope: &[Register]) -> &mut Self {
        let function = self.add_function(code);
        let mut operands = vec![dst.0, function, scope.len() as u32];
        operands.extend(scope.iter().map(|reg| reg.0));
        self.emit(Opcode::NewFunction, &operands)
    }

    /// `dst = /source/flags`
    pub fn new_regexp(&mut self, dst: Register, source: &str, flags: &str) -> &mut Self {
        let source = self.string(source);
        let flags = self.string(flags);
        self.code.regexps.push(RegExpTemplate { source, flags });
        let index = (self.code.regexps.len() - 1) as u32;
        self.emit(Opcode::NewRegExp, &[dst.0, index])
    }

    /// `dst = arguments`
    pub fn arguments(&mut self, dst: Register) -> &mut Self {
        self.code.flags.uses_arguments = true;
        self.emit(Opcode::Arguments, &[dst.0])
    }

    /// Call `frame_start[1]` with `this = frame_start[0]` and `argc` arguments after it
    pub fn call(&mut self, frame_start: Register, argc: u32) -> &mut Self {
        self.emit(Opcode::Call, &[frame_start.0, argc])
    }

    /// `new frame_start[1](args...)`
    pub fn construct(&mut self, frame_start: Register, argc: u32) -> &mut Self {
        self.emit(Opcode::Construct, &[frame_start.0, argc])
    }

    /// Direct `eval` call through an eval cache site
    pub fn eval(&mut self, frame_start: Register, argc: u32) -> &mut Self {
        self.code.flags.uses_eval = true;
        let cache = self.code.eval_caches_count;
        self.code.eval_caches_count += 1;
        self.emit(Opcode::Eval, &[frame_start.0, argc, cache])
    }

    /// `frame_start[1].apply(frame_start[0], frame_start[2])`
    pub fn apply(&mut self, frame_start: Register, argc: u32) -> &mut Self {
        self.emit(Opcode::Apply, &[frame_start.0, argc])
    }

    /// `return function.apply(this, arguments)` without materializing `arguments`
    pub fn redirected_call(&mut self, function: Register, apply: Register) -> &mut Self {
        self.code.flags.has_redirected_call = true;
        self.emit(Opcode::RedirectedCall, &[function.0, apply.0])
    }

    /// `return src`
    pub fn return_value(&mut self, src: Register) -> &mut Self {
        self.emit(Opcode::ReturnValue, &[src.0])
    }

    /// `return`
    pub fn return_no_value(&mut self) -> &mut Self {
        self.emit(Opcode::ReturnNoValue, &[])
    }

    /// End of program or eval code
    pub fn exit(&mut self) -> &mut Self {
        self.emit(Opcode::Exit, &[])
    }

    /// `throw src`
    pub fn throw(&mut self, src: Register) -> &mut Self {
        self.emit(Opcode::Throw, &[src.0])
    }

    /// Throw a fresh built-in error object
    pub fn throw_builtin(&mut self, kind: BuiltinError) -> &mut Self {
        self.emit(Opcode::ThrowBuiltin, &[kind as u32])
    }

    /// Move the pending exception (or the no-exception cookie) into `dst`
    pub fn catch(&mut self, dst: Register) -> &mut Self {
        self.emit(Opcode::Catch, &[dst.0])
    }

    /// End of a finally block
    pub fn rethrow(&mut self, exception: Register, target: Register, next_target: Register) -> &mut Self {
        self.emit(Opcode::Rethrow, &[exception.0, target.0, next_target.0])
    }

    fn resolve(&self, label: Label) -> Result<u32> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(BytecodeError::UnboundLabel(label.0))
    }

    fn nest_handlers(mut flat: Vec<ExceptionHandler>) -> Vec<ExceptionHandler> {
        // Outer ranges sort first so every range is inserted after its parent.
        flat.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        let mut roots: Vec<ExceptionHandler> = Vec::new();
        for handler in flat {
            let mut level = &mut roots;
            loop {
                let parent = level
                    .iter()
                    .position(|h| h.start <= handler.start && handler.end <= h.end);
                match parent {
                    Some(index) => level = &mut level[index].nested,
                    None => break,
                }
            }
            level.push(handler);
        }
        roots
    }

    /// Resolve labels, build tables and validate
    pub fn finish(mut self) -> Result<StaticCode> {
        for &(at, label) in &self.fixups {
            let target = self.resolve(label)?;
            self.code.codewords[at] = target;
        }

        let mut flat = Vec::with_capacity(self.handlers.len());
        for pending in &self.handlers {
            flat.push(ExceptionHandler {
                kind: pending.kind,
                start: self.resolve(pending.start)?,
                end: self.resolve(pending.end)?,
                handler_ip: self.resolve(pending.handler)?,
                nested: Vec::new(),
            });
        }
        self.code.exception_handlers = Self::nest_handlers(flat);

        let mut tables = Vec::with_capacity(self.switches.len());
        for pending in &self.switches {
            let targets = pending
                .targets
                .iter()
                .map(|&label| self.resolve(label))
                .collect::<Result<Vec<_>>>()?;
            tables.push(SwitchTable {
                minimum: pending.minimum,
                targets,
                default_target: self.resolve(pending.default_target)?,
            });
        }
        self.code.switch_tables = tables;

        let named = 2 + self.code.formals_and_locals.len() as u32;
        self.code.first_temporary_register = self.code.first_temporary_register.max(named);
        self.code.register_frame_size = self.next_temporary.max(named);
        self.code.find_instruction_offsets()?;
        self.code.validate()?;
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_to_instruction_starts() {
        let mut b = CodeBuilder::program();
        let r = b.temp();
        let top = b.label();
        let done = b.label();
        b.load_int(r, 3).bind(top).dec(r).condition(r).jump_if_false(done).jump(top);
        b.bind(done).exit();
        let code = b.finish().unwrap();
        assert_eq!(code.instruction_offsets, vec![0, 3, 5, 7, 9, 11]);
        assert_eq!(code.codewords[8], 11);
        assert_eq!(code.codewords[10], 3);
    }

    #[test]
    fn test_handlers_are_nested() {
        let mut b = CodeBuilder::function("f", &[]);
        let r = b.temp();
        let (outer_start, inner_start, inner_end, outer_end) = (b.label(), b.label(), b.label(), b.label());
        let (catch, finally) = (b.label(), b.label());
        b.bind(outer_start).load_int(r, 1);
        b.bind(inner_start).throw(r).bind(inner_end);
        b.load_int(r, 2).bind(outer_end);
        b.bind(catch).catch(r).return_value(r);
        b.bind(finally).catch(r).return_value(r);
        b.handler(HandlerKind::Catch, inner_start, inner_end, catch);
        b.handler(HandlerKind::Finally, outer_start, outer_end, finally);
        let code = b.finish().unwrap();
        assert_eq!(code.exception_handlers.len(), 1);
        assert_eq!(code.exception_handlers[0].kind, HandlerKind::Finally);
        assert_eq!(code.exception_handlers[0].nested.len(), 1);
        assert_eq!(code.find_exception_handler(5).map(|h| h.kind), Some(HandlerKind::Catch));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut b = CodeBuilder::program();
        let nowhere = b.label();
        b.jump(nowhere);
        assert!(matches!(b.finish(), Err(BytecodeError::UnboundLabel(_))));
    }

    #[test]
    fn test_frame_layout() {
        let mut b = CodeBuilder::function("f", &["a", "b"]);
        let x = b.local("x");
        let t = b.temp();
        let frame = b.call_frame(1);
        b.return_value(x);
        let code = b.finish().unwrap();
        assert_eq!(b_regs(&[x, t, frame]), vec![4, 5, 6]);
        assert_eq!(code.first_temporary_register, 5);
        assert_eq!(code.register_frame_size, 9);
        assert_eq!(code.formals_and_locals.len(), 3);
    }

    #[test]
    fn test_eval_code_can_contain_eval_sites() {
        let mut b = CodeBuilder::eval_code();
        let frame = b.call_frame(1);
        b.load_undefined(frame).eval(frame, 1).copy(Register(0), frame).exit();
        let code = b.finish().unwrap();
        assert_eq!(code.kind, CodeKind::Eval);
        assert!(code.flags.generate_result);
        assert_eq!(code.eval_caches_count, 1);
    }

    fn b_regs(regs: &[Register]) -> Vec<u32> {
        regs.iter().map(|r| r.0).collect()
    }
}
