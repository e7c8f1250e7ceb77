//! Bytecode dispatch loop
//!
//! An [`Interpreter`] borrows one execution context together with the
//! runtime for the length of a run. Calls between interpreted functions
//! push a frame and stay in the same loop; host functions and conversions
//! that call back into script code run a nested loop behind a boundary
//! frame, so Rust recursion only grows with host re-entry.
//!
//! Handlers are split by concern: arithmetic and comparisons in `ops`,
//! property, global and scope access in `access`, calls and returns in
//! `calls`.

use std::mem;
use std::sync::Arc;

use tern_vm_bytecode::{BuiltinError, CodeKind, Opcode, StaticCode};
use tern_vm_gc::GcRef;

use crate::class::PropertyAttributes;
use crate::code::CodeInstance;
use crate::config::VmConfig;
use crate::context::{Completion, ExecutionContext};
use crate::convert::{primitive_to_string, to_boolean};
use crate::error::{ErrorKind, StackFrame, VmError, VmResult};
use crate::frame::{ExitKind, FrameType};
use crate::gc::HeapCell;
use crate::hooks::{DebugHooks, InstructionLocation};
use crate::object::{ObjectKind, ScopeChain};
use crate::realm::Intrinsics;
use crate::runtime::{CollectMode, Runtime};
use crate::space::ObjectSpace;
use crate::value::{JsString, Value};

/// A decoded instruction
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inst {
    pub(crate) op: Opcode,
    /// Codeword index of the opcode word
    pub(crate) ip: u32,
    /// Fixed operands; unused entries are zero
    pub(crate) a: [u32; 4],
}

/// What the loop does after an instruction
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    /// Control reached a boundary frame; the returned value is in its register 0
    Return,
    Suspend,
}

/// How a run of the loop ended
#[derive(Debug)]
enum Exit {
    Returned,
    Suspended,
}

/// Executes bytecode on one execution context
pub struct Interpreter<'a> {
    pub(crate) ctx: &'a mut ExecutionContext,
    pub(crate) rt: &'a mut Runtime,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(ctx: &'a mut ExecutionContext, rt: &'a mut Runtime) -> Self {
        Self { ctx, rt }
    }
}

impl Interpreter<'_> {
    // ==================== Host access ====================

    /// Object space
    pub fn space(&self) -> &ObjectSpace {
        &self.rt.space
    }

    /// Mutable object space
    pub fn space_mut(&mut self) -> &mut ObjectSpace {
        &mut self.rt.space
    }

    /// Intrinsic objects
    pub fn intrinsics(&self) -> &Intrinsics {
        &self.rt.intrinsics
    }

    /// Runtime configuration
    pub fn config(&self) -> &VmConfig {
        &self.rt.config
    }

    /// The execution context being run
    pub fn context(&self) -> &ExecutionContext {
        self.ctx
    }

    /// Run `f` with `values` kept alive across collections.
    ///
    /// Host functions that hold values in Rust locals while calling back
    /// into script code must root them this way.
    pub fn with_rooted<T>(
        &mut self,
        values: &[Value],
        f: impl FnOnce(&mut Self) -> VmResult<T>,
    ) -> VmResult<T> {
        let base = self.ctx.scratch.len();
        self.ctx.scratch.extend_from_slice(values);
        let result = f(self);
        self.ctx.scratch.truncate(base);
        result
    }

    /// Collect now; returns reclaimed bytes.
    ///
    /// Values held only in Rust locals must be rooted with
    /// [`Self::with_rooted`] first.
    pub fn collect_garbage(&mut self) -> usize {
        self.rt.collect(Some(&*self.ctx), CollectMode::Force).unwrap_or(0)
    }

    /// Named property along the prototype chain, `undefined` when absent
    pub fn get_named(&self, handle: GcRef, name: &str) -> VmResult<Value> {
        Ok(self.rt.space.get_l(handle, name)?.value)
    }

    /// Assign a named property; false when it is read-only
    pub fn put_named(&mut self, handle: GcRef, name: &str, value: Value) -> VmResult<bool> {
        let result = self.rt.space.put_l(handle, &JsString::from(name), value)?;
        Ok(result.result.is_found())
    }

    /// Allocate a plain object
    pub fn new_object(&mut self) -> VmResult<GcRef> {
        let prototype = self.rt.intrinsics.object_prototype;
        self.rt.space.alloc_object(Some(prototype), ObjectKind::Ordinary)
    }

    /// Allocate an array holding `elements`
    pub fn new_array(&mut self, elements: Vec<Value>) -> VmResult<GcRef> {
        let prototype = self.rt.intrinsics.array_prototype;
        let handle = self.rt.space.alloc_object(Some(prototype), ObjectKind::Array)?;
        self.rt.space.set_elements(handle, elements)?;
        Ok(handle)
    }

    /// Allocate a native error object
    pub fn new_error(&mut self, kind: ErrorKind, message: Option<&str>) -> VmResult<GcRef> {
        let prototype = self.rt.intrinsics.error_prototype(kind);
        let handle = self.rt.space.alloc_object(Some(prototype), ObjectKind::Error(kind))?;
        if let Some(message) = message {
            self.rt.space.define_own_property_l(
                handle,
                &JsString::from("message"),
                Value::string(message),
                PropertyAttributes::HIDDEN,
            )?;
        }
        Ok(handle)
    }

    // ==================== Entry points ====================

    /// Run a program code instance on this context
    pub(crate) fn run_program(&mut self, code: GcRef) -> VmResult<Completion> {
        if self.ctx.nesting > 0 || self.ctx.suspended {
            return Err(VmError::internal("context is already running or suspended"));
        }
        let global = self.rt.space.code(code)?.global;
        self.declare_bindings(code)?;
        self.ctx.yieldable = true;
        self.enter_boundary(ExitKind::Entry, Value::Object(global), Value::Undefined, &[])?;
        if let Err(error) = self.enter_program(code) {
            self.leave_boundary()?;
            return Err(error);
        }
        tracing::trace!(target: "tern::vm", program = self.code()?.display_name(), "running program");
        self.hook(|hooks, location| hooks.enter_function(location));
        self.drive()
    }

    /// Continue a context parked at a checkpoint
    pub(crate) fn resume(&mut self) -> VmResult<Completion> {
        if !self.ctx.suspended {
            return Err(VmError::internal("context is not suspended"));
        }
        self.ctx.suspended = false;
        self.ctx.yieldable = true;
        tracing::trace!(target: "tern::vm", depth = self.ctx.frames.depth(), "resuming context");
        self.drive()
    }

    /// Call a function from host code
    pub fn call_function(&mut self, function: &Value, this: Value, args: &[Value]) -> VmResult<Value> {
        self.call_function_as(function, this, args, FrameType::Normal)
    }

    /// Call a function from host code, recording how the callee was reached
    pub fn call_function_as(
        &mut self,
        function: &Value,
        this: Value,
        args: &[Value],
        frame_type: FrameType,
    ) -> VmResult<Value> {
        self.check_host_nesting()?;
        self.enter_boundary(ExitKind::Reentry, this, function.clone(), args)?;
        self.ctx.nesting += 1;
        let outcome = self.invoke_at_boundary(args.len() as u32, frame_type);
        self.ctx.nesting -= 1;
        let value = self.leave_boundary();
        outcome?;
        value
    }

    /// Compile source text as a program and run it against the global object
    pub fn indirect_eval(&mut self, source: &JsString) -> VmResult<Value> {
        let code = self.rt.compile_program(source)?;
        let global = self.rt.intrinsics.global;
        let instance = CodeInstance::new(
            code,
            global,
            ScopeChain::new(),
            self.rt.config.cache_chain_limit,
        );
        let handle = self.rt.space.alloc(HeapCell::Code(instance))?;
        self.declare_bindings(handle)?;
        self.run_nested(handle, Value::Object(global))
    }

    fn check_host_nesting(&mut self) -> VmResult<()> {
        if self.ctx.nesting >= self.rt.config.max_host_nesting {
            return Err(VmError::StackOverflow);
        }
        if self.ctx.nesting == 0 {
            self.ctx.yieldable = false;
        }
        Ok(())
    }

    fn invoke_at_boundary(&mut self, argc: u32, frame_type: FrameType) -> VmResult<()> {
        let flow = match self.op_call(0, argc, false, frame_type) {
            Ok(flow) => flow,
            Err(error) => match self.handle_error(error) {
                Some(error) => return Err(error),
                None => Flow::Continue,
            },
        };
        if matches!(flow, Flow::Return) || self.ctx.current.exit.is_some() {
            return Ok(());
        }
        match self.run_loop()? {
            Exit::Returned => Ok(()),
            Exit::Suspended => Err(VmError::internal("nested dispatch loop suspended")),
        }
    }

    fn run_nested(&mut self, code: GcRef, this: Value) -> VmResult<Value> {
        self.check_host_nesting()?;
        self.enter_boundary(ExitKind::Reentry, this, Value::Undefined, &[])?;
        self.ctx.nesting += 1;
        let outcome = self
            .enter_program(code)
            .and_then(|()| match self.run_loop()? {
                Exit::Returned => Ok(()),
                Exit::Suspended => Err(VmError::internal("nested dispatch loop suspended")),
            });
        self.ctx.nesting -= 1;
        let value = self.leave_boundary();
        outcome?;
        value
    }

    /// Push a program frame over the boundary. Register 0 holds the
    /// completion value, which starts out `undefined`.
    fn enter_program(&mut self, code: GcRef) -> VmResult<()> {
        self.push_frame(code, Some(0), 0, FrameType::Normal, false, None)?;
        if self.code()?.flags.generate_result {
            self.set(0, Value::Undefined)?;
        }
        Ok(())
    }

    /// Run the outermost loop and settle the entry boundary
    fn drive(&mut self) -> VmResult<Completion> {
        self.ctx.nesting += 1;
        let exit = self.run_loop();
        self.ctx.nesting -= 1;
        match exit {
            Ok(Exit::Suspended) => {
                self.ctx.suspended = true;
                tracing::trace!(target: "tern::vm", quota = self.ctx.time_quota, "context yielded");
                Ok(Completion::Suspended)
            }
            Ok(Exit::Returned) => self.leave_boundary().map(Completion::Completed),
            Err(error) => {
                self.leave_boundary()?;
                Err(error)
            }
        }
    }

    /// Declare the `var` and function declarations of program or eval code.
    ///
    /// Code whose scope chain starts with a variable object declares into
    /// it; everything else declares global variables.
    pub(crate) fn declare_bindings(&mut self, code: GcRef) -> VmResult<()> {
        let instance = self.rt.space.code(code)?;
        let static_code = Arc::clone(&instance.static_code);
        let global = instance.global;
        let scope = instance.scope_chain.clone();
        let target = scope.first().copied();

        for &index in &static_code.variable_declarations {
            let name = string_at(&static_code, index)?;
            match target {
                Some(object) => {
                    if self.rt.space.get_own(object, &name)?.is_none() {
                        self.rt.space.define_own_property_l(
                            object,
                            &name,
                            Value::Undefined,
                            PropertyAttributes::DEFAULT,
                        )?;
                    }
                }
                None => {
                    self.rt.space.declare_global_variable(global, &name)?;
                }
            }
        }

        for declaration in &static_code.function_declarations {
            let name = string_at(&static_code, declaration.name)?;
            let function = self.instantiate_function(code, declaration.function, scope.clone())?;
            match target {
                Some(object) => {
                    self.rt.space.define_own_property_l(
                        object,
                        &name,
                        Value::Object(function),
                        PropertyAttributes::DEFAULT,
                    )?;
                }
                None => {
                    let slot = self.rt.space.declare_global_variable(global, &name)?;
                    if let ObjectKind::Global(variables) = self.rt.space.object_mut(global)?.kind_mut() {
                        variables.set(slot, Value::Object(function));
                    }
                }
            }
        }
        Ok(())
    }

    // ==================== Dispatch ====================

    fn run_loop(&mut self) -> VmResult<Exit> {
        loop {
            let result = match self.fetch() {
                Ok(inst) => self.execute(inst),
                Err(error) => Err(error),
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => return Ok(Exit::Returned),
                Ok(Flow::Suspend) => return Ok(Exit::Suspended),
                Err(error) => {
                    if let Some(error) = self.handle_error(error) {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Decode the instruction at `ip` and move `ip` past it
    #[inline]
    fn fetch(&mut self) -> VmResult<Inst> {
        let frame = &mut self.ctx.current;
        let code = frame
            .static_code
            .as_deref()
            .ok_or_else(|| VmError::internal("no code in the current frame"))?;
        let ip = frame.ip;
        let words = &code.codewords;
        let Some(&word) = words.get(ip as usize) else {
            if ip as usize != words.len() {
                return Err(VmError::internal(format!("instruction pointer {ip} out of range")));
            }
            // Falling off the end returns like the implicit final statement.
            let op = match code.kind {
                CodeKind::Function => Opcode::ReturnNoValue,
                CodeKind::Program | CodeKind::Eval => Opcode::Exit,
            };
            return Ok(Inst { op, ip, a: [0; 4] });
        };
        let op = Opcode::from_word(word)
            .ok_or_else(|| VmError::internal(format!("invalid opcode {word} at {ip}")))?;
        let count = op.operand_count();
        let start = ip as usize + 1;
        let operands = words
            .get(start..start + count)
            .ok_or_else(|| VmError::internal(format!("truncated instruction at {ip}")))?;
        let mut a = [0; 4];
        a[..count].copy_from_slice(operands);
        let mut len = 1 + count as u32;
        if op.is_variable_length() {
            len += a[2];
        }
        frame.ip = ip + len;
        Ok(Inst { op, ip, a })
    }

    fn execute(&mut self, inst: Inst) -> VmResult<Flow> {
        let [a, b, _, _] = inst.a;
        match inst.op {
            Opcode::LoadUndefined => self.set(a, Value::Undefined)?,
            Opcode::LoadNull => self.set(a, Value::Null)?,
            Opcode::LoadTrue => self.set(a, Value::Boolean(true))?,
            Opcode::LoadFalse => self.set(a, Value::Boolean(false))?,
            Opcode::LoadInt32 => self.set(a, Value::Int32(b as i32))?,
            Opcode::LoadDouble => {
                let n = self
                    .code()?
                    .doubles
                    .get(b as usize)
                    .copied()
                    .ok_or_else(|| bad_operand(inst))?;
                self.set(a, Value::number(n))?;
            }
            Opcode::LoadString => {
                let s = self.string_operand(b)?;
                self.set(a, Value::String(s))?;
            }
            Opcode::LoadGlobalObject => {
                let global = self.current_global()?;
                self.set(a, Value::Object(global))?;
            }
            Opcode::Copy => {
                let value = self.get(b)?;
                self.set(a, value)?;
            }

            Opcode::ToNumber => self.op_to_number(inst)?,
            Opcode::ToString => self.op_to_string(inst)?,
            Opcode::TypeOf => {
                let value = self.get(b)?;
                let name = self.type_of(&value);
                self.set(a, Value::string(name))?;
            }
            Opcode::Not => {
                let value = self.get(b)?;
                self.set(a, Value::Boolean(!to_boolean(&value)))?;
            }

            Opcode::Add | Opcode::AddImm => self.op_add(inst)?,
            Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => self.op_arithmetic(inst)?,
            Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::ShrU => self.op_bitwise(inst)?,
            Opcode::Neg => self.op_negate(inst)?,
            Opcode::Inc | Opcode::Dec => self.op_increment(inst)?,

            Opcode::Eq
            | Opcode::Neq
            | Opcode::StrictEq
            | Opcode::StrictNeq
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Gt
            | Opcode::Gte => self.op_compare(inst)?,
            Opcode::IsNullOrUndefined => {
                self.ctx.implicit_bool = self.get(a)?.is_null_or_undefined();
            }
            Opcode::Condition => {
                let value = self.get(a)?;
                self.ctx.implicit_bool = to_boolean(&value);
            }

            Opcode::Jump => return self.jump(inst, a),
            Opcode::JumpIfTrue => {
                if self.ctx.implicit_bool {
                    return self.jump(inst, a);
                }
            }
            Opcode::JumpIfFalse => {
                if !self.ctx.implicit_bool {
                    return self.jump(inst, a);
                }
            }
            Opcode::JumpIndirect => {
                let code = self.code()?;
                let target = self
                    .get(a)?
                    .as_int32()
                    .and_then(|target| u32::try_from(target).ok())
                    .filter(|&target| code.is_instruction_start(target))
                    .ok_or_else(|| VmError::internal("indirect jump to a non-instruction"))?;
                return self.jump(inst, target);
            }
            Opcode::TableSwitch => {
                let target = self.switch_target(inst)?;
                return self.jump(inst, target);
            }

            Opcode::GetN => self.op_get_named(inst)?,
            Opcode::PutN => self.op_put_named(inst)?,
            Opcode::InitProperty => self.op_init_property(inst)?,
            Opcode::DeleteN => self.op_delete_named(inst)?,
            Opcode::Get => self.op_get_keyed(inst)?,
            Opcode::Put => self.op_put_keyed(inst)?,
            Opcode::Delete => self.op_delete_keyed(inst)?,
            Opcode::In => self.op_in(inst)?,

            Opcode::GetGlobal | Opcode::GetGlobalQuiet => self.op_get_global(inst)?,
            Opcode::PutGlobal => self.op_put_global(inst)?,
            Opcode::GetScope => self.op_get_scope(inst)?,
            Opcode::PutScope => self.op_put_scope(inst)?,

            Opcode::NewObject
            | Opcode::NewObjectLiteral
            | Opcode::NewArray
            | Opcode::NewArrayLiteral
            | Opcode::NewFunction
            | Opcode::NewRegExp
            | Opcode::Arguments => {
                self.safepoint();
                self.op_allocate(inst)?;
            }

            Opcode::Call => return self.op_call(a, b, false, FrameType::Normal),
            Opcode::Apply => return self.op_call(a, b, false, FrameType::ViaApply),
            Opcode::Construct => {
                self.safepoint();
                return self.op_construct(a, b);
            }
            Opcode::Eval => return self.op_eval(inst),
            Opcode::RedirectedCall => return self.op_redirected_call(inst),

            Opcode::ReturnValue => {
                let value = self.get(a)?;
                return self.do_return(value);
            }
            Opcode::ReturnNoValue => return self.do_return(Value::Undefined),
            Opcode::Exit => {
                let value = self.get(0)?;
                return self.do_return(value);
            }

            Opcode::Throw => {
                let value = self.get(a)?;
                return Err(VmError::exception_with(value, String::new(), Vec::new()));
            }
            Opcode::ThrowBuiltin => {
                let kind = BuiltinError::from_word(a).ok_or_else(|| bad_operand(inst))?;
                return Err(builtin_error(kind));
            }
            Opcode::Catch => {
                let exception = mem::replace(&mut self.ctx.exception, Value::NO_EXCEPTION);
                self.set(a, exception)?;
            }
            Opcode::Rethrow => return self.op_rethrow(inst),
        }
        Ok(Flow::Continue)
    }

    fn jump(&mut self, inst: Inst, target: u32) -> VmResult<Flow> {
        self.ctx.current.ip = target;
        if target <= inst.ip && self.checkpoint()? {
            return Ok(Flow::Suspend);
        }
        Ok(Flow::Continue)
    }

    fn switch_target(&self, inst: Inst) -> VmResult<u32> {
        let [src, table, _, _] = inst.a;
        let value = self.get(src)?;
        let table = self
            .code()?
            .switch_tables
            .get(table as usize)
            .ok_or_else(|| bad_operand(inst))?;
        let target = value
            .as_int32()
            .and_then(|case| case.checked_sub(table.minimum))
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| table.targets.get(index))
            .copied();
        Ok(target.unwrap_or(table.default_target))
    }

    /// Backward jumps and calls land here. Returns true when the outermost
    /// loop should yield now.
    pub(crate) fn checkpoint(&mut self) -> VmResult<bool> {
        if self.ctx.take_interrupt() {
            return Err(VmError::interrupted());
        }
        let out_of_time = self.ctx.tick();
        let requested = self.ctx.take_suspend_request();
        if !(out_of_time || requested || self.ctx.yield_pending) {
            return Ok(false);
        }
        if self.ctx.nesting == 1 && self.ctx.yieldable {
            self.ctx.yield_pending = false;
            return Ok(true);
        }
        self.ctx.yield_pending = true;
        Ok(false)
    }

    /// Collect if the heap asks for it. Only called where every live value
    /// is reachable from a register, the exception slot or a rooted slot.
    pub(crate) fn safepoint(&mut self) {
        if self.rt.space.heap.should_collect() {
            self.rt.collect(Some(&*self.ctx), CollectMode::Threshold);
        }
    }

    // ==================== Exceptions ====================

    /// Turn an error raised by an instruction into a thrown exception.
    /// Returns the error to report when nothing in this loop catches it.
    fn handle_error(&mut self, error: VmError) -> Option<VmError> {
        if error.is_fatal() {
            return Some(self.abort(error));
        }
        match self.raise(error) {
            Ok(None) => None,
            Ok(Some(uncaught)) => Some(uncaught),
            Err(fatal) => Some(self.abort(fatal)),
        }
    }

    fn raise(&mut self, error: VmError) -> VmResult<Option<VmError>> {
        let (value, stack) = match error {
            VmError::Exception(thrown) => {
                let thrown = *thrown;
                (thrown.value, (!thrown.stack.is_empty()).then_some(thrown.stack))
            }
            other => {
                let Some((kind, message)) = other.error_kind() else {
                    return Err(other);
                };
                let message = (!message.is_empty()).then_some(message.as_str());
                let error = self.new_error(kind, message)?;
                (Value::Object(error), None)
            }
        };
        Ok(self.throw_value(value, stack))
    }

    /// Unwind to the innermost handler covering the faulting instruction,
    /// popping frames up to the nearest boundary
    fn throw_value(&mut self, value: Value, stack: Option<Vec<StackFrame>>) -> Option<VmError> {
        let stack = stack.unwrap_or_else(|| self.capture_stack_trace());
        if self.ctx.hooks.is_some() {
            self.hook(|hooks, location| hooks.on_exception(location, &value));
        }
        self.ctx.exception = value;
        loop {
            if let Some(code) = &self.ctx.current.static_code
                && let Some(handler) = code.find_exception_handler(self.ctx.current.ip)
            {
                self.ctx.current.ip = handler.handler_ip;
                self.ctx.last_stack_trace = stack;
                return None;
            }
            if self.ctx.current.exit.is_some() {
                let value = mem::replace(&mut self.ctx.exception, Value::NO_EXCEPTION);
                let message = self.describe(&value);
                tracing::debug!(target: "tern::vm", %message, "uncaught exception");
                self.ctx.last_stack_trace = stack.clone();
                return Some(VmError::exception_with(value, message, stack));
            }
            self.hook(|hooks, location| hooks.leave_function(location));
            if let Err(error) = self.pop_frame() {
                return Some(self.abort(error));
            }
        }
    }

    /// Drop every frame down to the nearest boundary without running handlers
    fn abort(&mut self, error: VmError) -> VmError {
        tracing::warn!(target: "tern::vm", %error, "execution aborted");
        while self.ctx.current.exit.is_none() {
            if self.pop_frame().is_err() {
                break;
            }
        }
        self.ctx.exception = Value::NO_EXCEPTION;
        error
    }

    fn op_rethrow(&mut self, inst: Inst) -> VmResult<Flow> {
        let [exception, target, next, _] = inst.a;
        let pending = self.get(exception)?;
        if !pending.is_no_exception() {
            let stack = self.ctx.last_stack_trace.clone();
            return Err(VmError::exception_with(pending, String::new(), stack));
        }
        let target = self.get(target)?;
        let Some(target) = target.as_int32().and_then(|t| u32::try_from(t).ok()) else {
            self.ctx.implicit_bool = false;
            return Ok(Flow::Continue);
        };
        let handler_ip = self
            .code()?
            .find_finally_handler(self.ctx.current.ip, target)
            .map(|handler| handler.handler_ip);
        match handler_ip {
            Some(handler_ip) => {
                self.set(next, Value::Int32(target as i32))?;
                self.ctx.current.ip = handler_ip;
                self.ctx.implicit_bool = true;
            }
            None => self.ctx.implicit_bool = false,
        }
        Ok(Flow::Continue)
    }

    fn capture_stack_trace(&self) -> Vec<StackFrame> {
        std::iter::once(&self.ctx.current)
            .chain(self.ctx.frames.iter())
            .filter_map(|frame| {
                let code = frame.static_code.as_ref()?;
                let record = code.find_debug_record(frame.ip.saturating_sub(1));
                Some(StackFrame {
                    function_name: code.display_name().to_string(),
                    file: code.url.as_deref().unwrap_or("<anonymous>").to_string(),
                    line: record.map_or(0, |r| r.location.line),
                    column: record.map_or(0, |r| r.location.column),
                })
            })
            .take(self.ctx.stack_trace_depth)
            .collect()
    }

    /// Message for an uncaught exception; never calls script code
    pub(crate) fn describe(&self, value: &Value) -> String {
        let Value::Object(handle) = value else {
            return primitive_to_string(value)
                .map(|s| s.to_string())
                .unwrap_or_default();
        };
        let is_error = self
            .rt
            .space
            .object(*handle)
            .is_ok_and(|object| matches!(object.kind(), ObjectKind::Error(_)));
        if !is_error {
            return "[object Object]".to_string();
        }
        let text = |name: &str| {
            self.rt
                .space
                .get_l(*handle, name)
                .ok()
                .and_then(|result| primitive_to_string(&result.value))
                .map(|s| s.to_string())
                .unwrap_or_default()
        };
        let (name, message) = (text("name"), text("message"));
        match (name.is_empty(), message.is_empty()) {
            (_, true) => name,
            (true, false) => message,
            (false, false) => format!("{name}: {message}"),
        }
    }

    // ==================== Hooks and profiling ====================

    fn location(&self) -> Option<InstructionLocation> {
        let frame = &self.ctx.current;
        frame
            .static_code
            .as_ref()
            .map(|code| InstructionLocation::new(code, frame.ip))
    }

    /// Run `f` against the debugger, if one is attached and a code frame is current
    pub(crate) fn hook(&mut self, f: impl FnOnce(&mut dyn DebugHooks, &InstructionLocation)) {
        if self.ctx.hooks.is_none() {
            return;
        }
        let Some(location) = self.location() else {
            return;
        };
        if let Some(hooks) = self.ctx.hooks.as_deref_mut() {
            f(hooks, &location);
        }
    }

    /// Count a slow path against the current code instance
    pub(crate) fn slow_case(&mut self, inst: Inst) -> VmResult<()> {
        let code = self.code_handle()?;
        let instance = self.rt.space.code_mut(code)?;
        instance.slow_case_calls = instance.slow_case_calls.saturating_add(1);
        if let (Some(profiler), Some(static_code)) = (
            self.ctx.profiler.as_deref_mut(),
            self.ctx.current.static_code.as_deref(),
        ) {
            profiler.slow_case(static_code, inst.ip, 1);
        }
        Ok(())
    }

    /// Record the type of the register operand at `position`
    #[inline]
    pub(crate) fn profile_operand(&mut self, inst: Inst, position: u32, value: &Value) {
        if let (Some(profiler), Some(static_code)) = (
            self.ctx.profiler.as_deref_mut(),
            self.ctx.current.static_code.as_deref(),
        ) {
            profiler.register_type(static_code, inst.ip + 1 + position, value.type_bits());
        }
    }

    /// Record a named get cache hit or miss
    pub(crate) fn profile_get_cache(&mut self, inst: Inst, hit: bool) {
        if let (Some(profiler), Some(static_code)) = (
            self.ctx.profiler.as_deref_mut(),
            self.ctx.current.static_code.as_deref(),
        ) {
            profiler.get_cache(static_code, inst.ip + 4, hit);
        }
    }

    pub(crate) fn note_integer_overflow(&mut self) -> VmResult<()> {
        let code = self.code_handle()?;
        if self.rt.space.code_mut(code)?.record_integer_overflow() {
            tracing::trace!(target: "tern::vm", "int32 overflow in native code, scheduling regeneration");
        }
        Ok(())
    }

    // ==================== Registers and operands ====================

    #[inline]
    pub(crate) fn get(&self, register: u32) -> VmResult<Value> {
        self.ctx
            .registers
            .slots(self.ctx.current.window)
            .get(register as usize)
            .cloned()
            .ok_or_else(|| VmError::internal(format!("register {register} outside the frame")))
    }

    #[inline]
    pub(crate) fn set(&mut self, register: u32, value: Value) -> VmResult<()> {
        let window = self.ctx.current.window;
        let slot = self
            .ctx
            .registers
            .slots_mut(window)
            .get_mut(register as usize)
            .ok_or_else(|| VmError::internal(format!("register {register} outside the frame")))?;
        *slot = value;
        Ok(())
    }

    /// Values of a call frame: `this`, the callee, then the arguments
    pub(crate) fn frame_values(&self, frame_start: u32, argc: u32) -> VmResult<Vec<Value>> {
        let start = frame_start as usize;
        let end = start + 2 + argc as usize;
        self.ctx
            .registers
            .slots(self.ctx.current.window)
            .get(start..end)
            .map(<[Value]>::to_vec)
            .ok_or_else(|| VmError::internal("call frame outside the register window"))
    }

    /// Trailing register operands of a variable-length instruction
    pub(crate) fn trailing_registers(&self, inst: Inst) -> VmResult<Vec<u32>> {
        let start = inst.ip as usize + 4;
        let end = start + inst.a[2] as usize;
        self.code()?
            .codewords
            .get(start..end)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| bad_operand(inst))
    }

    #[inline]
    pub(crate) fn code(&self) -> VmResult<&Arc<StaticCode>> {
        self.ctx
            .current
            .static_code
            .as_ref()
            .ok_or_else(|| VmError::internal("no code in the current frame"))
    }

    #[inline]
    pub(crate) fn code_handle(&self) -> VmResult<GcRef> {
        self.ctx
            .current
            .code
            .ok_or_else(|| VmError::internal("no code instance in the current frame"))
    }

    pub(crate) fn string_operand(&self, index: u32) -> VmResult<JsString> {
        string_at(self.code()?, index)
    }

    pub(crate) fn current_global(&self) -> VmResult<GcRef> {
        Ok(self.rt.space.code(self.code_handle()?)?.global)
    }
}

pub(crate) fn string_at(code: &StaticCode, index: u32) -> VmResult<JsString> {
    code.string(index)
        .cloned()
        .ok_or_else(|| VmError::internal(format!("string index {index} out of range")))
}

pub(crate) fn bad_operand(inst: Inst) -> VmError {
    VmError::internal(format!("bad operand for {} at {}", inst.op.name(), inst.ip))
}

fn builtin_error(kind: BuiltinError) -> VmError {
    match kind {
        BuiltinError::TypeError => VmError::TypeError(String::new()),
        BuiltinError::ReferenceError => VmError::ReferenceError(String::new()),
        BuiltinError::RangeError => VmError::RangeError(String::new()),
        BuiltinError::SyntaxError => VmError::SyntaxError(String::new()),
        BuiltinError::EvalError => VmError::EvalError(String::new()),
        BuiltinError::URIError => VmError::URIError(String::new()),
    }
}

impl std::fmt::Debug for Interpreter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("context", &self.ctx)
            .finish_non_exhaustive()
    }
}
