//! Calls, returns and frame management
//!
//! An interpreted callee's window starts at the caller's frame start and
//! overlaps the caller's tail, so `this`, the callee and the arguments are
//! already in place. Calls whose values do not sit in a caller frame
//! (bound functions, `apply`, host entry) get a fresh window and name the
//! caller register that receives the result.

use std::mem;
use std::sync::Arc;

use tern_vm_bytecode::CodeKind;
use tern_vm_gc::GcRef;

use crate::class::PropertyAttributes;
use crate::code::{CodeInstance, EvalCache};
use crate::error::{VmError, VmResult};
use crate::frame::{ExitKind, FrameType, VirtualStackFrame};
use crate::gc::HeapCell;
use crate::interpreter::{Flow, Inst, Interpreter, string_at};
use crate::native::{NativeEntry, NativeOutcome, TrampolineFrame};
use crate::object::{Builtin, Callable, HostFunctionId, ObjectKind, ScopeChain};
use crate::realm::list_from_array_like;
use crate::value::{JsString, Value};

impl Interpreter<'_> {
    // ==================== Frames ====================

    /// Push a frame for interpreted code.
    ///
    /// With a `frame_start` the window overlaps the current one from that
    /// register; without one it is fresh and the caller fills in `this`,
    /// the callee and the arguments. Leaves the current frame untouched on
    /// failure.
    pub(crate) fn push_frame(
        &mut self,
        code: GcRef,
        frame_start: Option<u32>,
        argc: usize,
        frame_type: FrameType,
        construct: bool,
        return_register: Option<u32>,
    ) -> VmResult<()> {
        if self.ctx.frames.is_full() {
            return Err(VmError::StackOverflow);
        }
        let static_code = Arc::clone(self.rt.space.code(code)?.static_code());
        let needed = argc.checked_add(2).ok_or(VmError::StackOverflow)?;
        let (overlap, copy) = match frame_start {
            Some(start) => {
                let overlap = self
                    .ctx
                    .current
                    .window
                    .len
                    .checked_sub(start as usize)
                    .ok_or_else(|| VmError::internal("call frame outside the register window"))?;
                (overlap, needed.min(overlap))
            }
            None => (0, 0),
        };
        let size = needed
            .max(static_code.register_frame_size as usize)
            .max(overlap);

        let (window, first_in_block) = self.ctx.registers.allocate(size, overlap, copy)?;
        if let Err(error) = self.ctx.frames.push_with(|| mem::take(&mut self.ctx.current)) {
            self.ctx.registers.free(window, overlap, copy, first_in_block);
            return Err(error);
        }
        if overlap > needed && !first_in_block {
            // Caller temporaries above the arguments become callee locals.
            self.ctx.registers.slots_mut(window)[needed..overlap].fill(Value::Undefined);
        }

        let argc = argc as u32;
        self.ctx.current = VirtualStackFrame {
            ip: 0,
            window,
            overlap,
            copy,
            first_in_block,
            code: Some(code),
            extra_arguments: argc.saturating_sub(static_code.formals_count),
            static_code: Some(static_code),
            variable_object: None,
            arguments_object: None,
            argc,
            in_constructor: construct,
            frame_type,
            exit: None,
            return_register,
        };
        Ok(())
    }

    /// Restore the caller's frame and release the callee's window
    pub(crate) fn pop_frame(&mut self) -> VmResult<VirtualStackFrame> {
        let caller = self
            .ctx
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("frame stack underflow"))?;
        let callee = mem::replace(&mut self.ctx.current, caller);
        self.ctx
            .registers
            .free(callee.window, callee.overlap, callee.copy, callee.first_in_block);
        Ok(callee)
    }

    /// Push a boundary frame whose registers hold `this`, `function` and `args`
    pub(crate) fn enter_boundary(
        &mut self,
        exit: ExitKind,
        this: Value,
        function: Value,
        args: &[Value],
    ) -> VmResult<()> {
        let size = args.len() + 2;
        let (window, first_in_block) = self.ctx.registers.allocate(size, 0, 0)?;
        if let Err(error) = self.ctx.frames.push_with(|| mem::take(&mut self.ctx.current)) {
            self.ctx.registers.free(window, 0, 0, first_in_block);
            return Err(error);
        }
        let slots = self.ctx.registers.slots_mut(window);
        slots[0] = this;
        slots[1] = function;
        slots[2..].clone_from_slice(args);
        self.ctx.current = VirtualStackFrame {
            window,
            first_in_block,
            argc: args.len() as u32,
            exit: Some(exit),
            ..VirtualStackFrame::default()
        };
        Ok(())
    }

    /// Pop a boundary frame and return its register 0
    pub(crate) fn leave_boundary(&mut self) -> VmResult<Value> {
        if self.ctx.current.exit.is_none() {
            return Err(VmError::internal("expected a boundary frame"));
        }
        let value = self
            .ctx
            .registers
            .slots(self.ctx.current.window)
            .first()
            .cloned()
            .unwrap_or_default();
        let caller = self
            .ctx
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("frame stack underflow"))?;
        let boundary = mem::replace(&mut self.ctx.current, caller);
        self.ctx
            .registers
            .free(boundary.window, 0, 0, boundary.first_in_block);
        Ok(value)
    }

    /// Work shared by every interpreted call once its frame is current
    fn after_entry(&mut self, code: GcRef) -> VmResult<Flow> {
        let strict = self.code()?.flags.is_strict;
        if !strict && !self.ctx.current.in_constructor && self.get(0)?.is_null_or_undefined() {
            let global = self.rt.space.code(code)?.global;
            self.set(0, Value::Object(global))?;
        }
        self.hook(|hooks, location| hooks.enter_function(location));
        if let Some(entry) = self.prepare_native(code)? {
            return self.run_native(code, entry);
        }
        if self.checkpoint()? {
            return Ok(Flow::Suspend);
        }
        Ok(Flow::Continue)
    }

    // ==================== Native code ====================

    /// Count the call and ask the backend for code once the slow-case
    /// count crosses its threshold
    fn prepare_native(&mut self, code: GcRef) -> VmResult<Option<NativeEntry>> {
        let jit = self.rt.config.jit;
        let instance = self.rt.space.code_mut(code)?;
        instance.call_count = instance.call_count.saturating_add(1);
        if !jit.enabled || instance.static_code.kind != CodeKind::Function {
            return Ok(None);
        }
        let wanted = match instance.native {
            None => instance.should_generate_native_dispatcher(jit.generate_factor),
            Some(_) => {
                instance.has_integer_overflows == 1
                    || instance.should_regenerate_native_dispatcher(jit.regenerate_factor)
            }
        };
        if !wanted {
            return Ok(instance.native);
        }

        let static_code = Arc::clone(&instance.static_code);
        let regenerating = instance.native.is_some();
        let profile = static_code.profile().snapshot();
        let entry = self.rt.native.compile(&static_code, profile.as_deref());
        let instance = self.rt.space.code_mut(code)?;
        if regenerating && instance.has_integer_overflows == 1 {
            instance.has_integer_overflows = 2;
        }
        instance.native = entry;
        instance.slow_case_calls = 0;
        tracing::debug!(
            target: "tern::vm",
            function = static_code.display_name(),
            regenerating,
            generated = entry.is_some(),
            "native dispatcher request"
        );
        Ok(entry)
    }

    /// Run generated code in the frame just pushed
    fn run_native(&mut self, code: GcRef, entry: NativeEntry) -> VmResult<Flow> {
        let static_code = Arc::clone(self.code()?);
        let window = self.ctx.current.window;
        let frame = TrampolineFrame {
            code: &static_code,
            registers: self.ctx.registers.slots_mut(window),
            argc: self.ctx.current.argc,
        };
        match self.rt.native.call(entry, frame) {
            NativeOutcome::Returned(value) => self.do_return(value),
            NativeOutcome::Threw(value) => Err(VmError::exception_with(value, String::new(), Vec::new())),
            NativeOutcome::Deoptimize(state) => {
                if state.ip != 0 && !static_code.is_instruction_start(state.ip) {
                    return Err(VmError::internal("deoptimized to a non-instruction"));
                }
                let restored = state.registers.into_iter().chain(std::iter::repeat(Value::Undefined));
                for (slot, value) in self.ctx.registers.slots_mut(window).iter_mut().zip(restored) {
                    *slot = value;
                }
                self.ctx.current.ip = state.ip;
                self.rt.space.code_mut(code)?.native = None;
                tracing::debug!(
                    target: "tern::vm",
                    function = static_code.display_name(),
                    ip = state.ip,
                    "deoptimized to the interpreter"
                );
                Ok(Flow::Continue)
            }
        }
    }

    // ==================== Calls ====================

    /// `Call`, `Apply` and `Construct` once `this` is in place
    pub(crate) fn op_call(
        &mut self,
        frame_start: u32,
        argc: u32,
        construct: bool,
        frame_type: FrameType,
    ) -> VmResult<Flow> {
        let callee = self.get(frame_start + 1)?;
        let Some((_, callable)) = self.rt.space.callable(&callee) else {
            let what = if construct { "a constructor" } else { "a function" };
            return Err(VmError::type_error(format!(
                "{} is not {what}",
                self.value_label(&callee)
            )));
        };
        self.hook(|hooks, location| hooks.call_start(location));
        match callable {
            Callable::Bytecode { code, .. } => {
                self.push_frame(code, Some(frame_start), argc as usize, frame_type, construct, None)?;
                self.after_entry(code)
            }
            Callable::Host { .. } | Callable::Bound { .. } => {
                let mut values = self.frame_values(frame_start, argc)?;
                let args = values.split_off(2);
                let this = values.swap_remove(0);
                self.call_into(callee, this, args, frame_start, frame_type, construct)
            }
        }
    }

    /// Call with values held outside any frame, writing the result to `dst`
    /// of the current frame
    pub(crate) fn call_into(
        &mut self,
        mut function: Value,
        mut this: Value,
        mut args: Vec<Value>,
        dst: u32,
        mut frame_type: FrameType,
        construct: bool,
    ) -> VmResult<Flow> {
        loop {
            let Some((_, callable)) = self.rt.space.callable(&function) else {
                return Err(VmError::type_error(format!(
                    "{} is not a function",
                    self.value_label(&function)
                )));
            };
            match callable {
                Callable::Bytecode { code, .. } => {
                    self.push_frame(code, None, args.len(), frame_type, construct, Some(dst))?;
                    let window = self.ctx.current.window;
                    let slots = self.ctx.registers.slots_mut(window);
                    slots[0] = this;
                    slots[1] = function;
                    for (slot, arg) in slots[2..].iter_mut().zip(args) {
                        *slot = arg;
                    }
                    return self.after_entry(code);
                }
                Callable::Host {
                    builtin: Some(Builtin::Apply),
                    ..
                } if !construct => {
                    let receiver = args.first().cloned().unwrap_or_default();
                    let list = match args.get(1) {
                        Some(list) => list_from_array_like(self, list)?,
                        None => Vec::new(),
                    };
                    function = mem::replace(&mut this, receiver);
                    args = list;
                    frame_type = FrameType::ViaApply;
                }
                Callable::Host {
                    builtin: Some(Builtin::Call),
                    ..
                } if !construct => {
                    let receiver = if args.is_empty() {
                        Value::Undefined
                    } else {
                        args.remove(0)
                    };
                    function = mem::replace(&mut this, receiver);
                    frame_type = FrameType::ViaCall;
                }
                Callable::Host { id, .. } => {
                    let result = self.call_host(id, &this, &args)?;
                    let result = if construct && !result.is_object() {
                        this
                    } else {
                        result
                    };
                    self.set(dst, result)?;
                    self.hook(|hooks, location| hooks.call_complete(location));
                    return Ok(Flow::Continue);
                }
                Callable::Bound {
                    target,
                    this: bound_this,
                    args: bound_args,
                } => {
                    function = Value::Object(target);
                    if !construct {
                        this = bound_this;
                    }
                    let mut all = bound_args;
                    all.append(&mut args);
                    args = all;
                    frame_type = FrameType::ViaBind;
                }
            }
        }
    }

    fn call_host(&mut self, id: HostFunctionId, this: &Value, args: &[Value]) -> VmResult<Value> {
        let func = self
            .rt
            .hosts
            .get(id.0 as usize)
            .map(|host| Arc::clone(&host.func))
            .ok_or_else(|| VmError::internal("unknown host function"))?;
        func(self, this, args)
    }

    /// `Construct fs argc`: allocate `this` from the callee's `prototype`
    pub(crate) fn op_construct(&mut self, frame_start: u32, argc: u32) -> VmResult<Flow> {
        let callee = self.get(frame_start + 1)?;
        let Some((mut target, mut callable)) = self.rt.space.callable(&callee) else {
            return Err(VmError::type_error(format!(
                "{} is not a constructor",
                self.value_label(&callee)
            )));
        };
        while let Callable::Bound { target: next, .. } = callable {
            target = next;
            callable = self
                .rt
                .space
                .callable(&Value::Object(next))
                .map(|(_, callable)| callable)
                .ok_or_else(|| VmError::type_error("bound target is not a function"))?;
        }
        let prototype = match self.rt.space.get_l(target, "prototype")?.value {
            Value::Object(prototype) => prototype,
            _ => self.rt.intrinsics.object_prototype,
        };
        let this = self.rt.space.alloc_object(Some(prototype), ObjectKind::Ordinary)?;
        self.set(frame_start, Value::Object(this))?;
        self.op_call(frame_start, argc, true, FrameType::Normal)
    }

    /// `RedirectedCall f apply`: `return f.apply(this, arguments)`
    pub(crate) fn op_redirected_call(&mut self, inst: Inst) -> VmResult<Flow> {
        let [function, apply, _, _] = inst.a;
        let function = self.get(function)?;
        let apply = self.get(apply)?;
        let this = self.get(0)?;
        if apply.as_object() == Some(self.rt.intrinsics.apply) && self.rt.space.is_callable(&function) {
            let argc = self.ctx.current.argc;
            let args = self.frame_values(0, argc)?.split_off(2);
            return self.call_into(function, this, args, 0, FrameType::ViaApply, false);
        }
        // `apply` was replaced; call whatever it is now with a real arguments object.
        self.safepoint();
        let arguments = self.arguments_object()?;
        self.call_into(
            apply,
            function,
            vec![this, Value::Object(arguments)],
            0,
            FrameType::Normal,
            false,
        )
    }

    // ==================== Returns ====================

    pub(crate) fn do_return(&mut self, value: Value) -> VmResult<Flow> {
        let value = if self.ctx.current.in_constructor && !value.is_object() {
            self.get(0)?
        } else {
            value
        };
        if self.ctx.hooks.is_some() {
            self.hook(|hooks, location| {
                hooks.on_return(location, &value);
                hooks.leave_function(location);
            });
        }
        self.set(0, value.clone())?;
        let callee = self.pop_frame()?;
        if let Some(register) = callee.return_register {
            self.set(register, value)?;
        }
        if callee.is_eval() {
            self.write_back_variable_object()?;
        }
        if self.ctx.current.exit.is_some() {
            return Ok(Flow::Return);
        }
        self.hook(|hooks, location| hooks.call_complete(location));
        Ok(Flow::Continue)
    }

    // ==================== Eval ====================

    /// `Eval fs argc cache`: direct eval when the callee is the built-in
    pub(crate) fn op_eval(&mut self, inst: Inst) -> VmResult<Flow> {
        let [frame_start, argc, site, _] = inst.a;
        let callee = self.get(frame_start + 1)?;
        if callee.as_object() != Some(self.rt.intrinsics.eval) {
            return self.op_call(frame_start, argc, false, FrameType::Normal);
        }
        let source = if argc > 0 {
            self.get(frame_start + 2)?
        } else {
            Value::Undefined
        };
        let Value::String(source) = source else {
            self.set(frame_start, source)?;
            return Ok(Flow::Continue);
        };
        self.safepoint();

        let parent = self.code_handle()?;
        let strict = self.code()?.flags.is_strict;
        let cached = self
            .rt
            .space
            .code(parent)?
            .eval_caches
            .get(site as usize)
            .and_then(Option::as_ref)
            .filter(|cache| cache.source == source)
            .map(|cache| Arc::clone(&cache.code));
        let code = match cached {
            Some(code) => code,
            None => {
                let code = Arc::new(self.rt.compile(&source, CodeKind::Eval, strict)?);
                if let Some(slot) = self.rt.space.code_mut(parent)?.eval_caches.get_mut(site as usize) {
                    *slot = Some(EvalCache {
                        source: source.clone(),
                        code: Arc::clone(&code),
                    });
                }
                code
            }
        };

        let scope = self.eval_scope()?;
        let global = self.current_global()?;
        let instance = CodeInstance::new(code, global, scope, self.rt.config.cache_chain_limit);
        let handle = self.rt.space.alloc(HeapCell::Code(instance))?;
        self.declare_bindings(handle)?;
        self.hook(|hooks, location| hooks.call_start(location));
        self.push_frame(handle, Some(frame_start), argc as usize, FrameType::Normal, false, None)?;
        self.hook(|hooks, location| hooks.enter_function(location));
        Ok(Flow::Continue)
    }

    // ==================== Functions ====================

    /// Scope chain captured by the running function, or the code
    /// instance's own chain for program and eval code
    pub(crate) fn closure_scope(&self) -> VmResult<ScopeChain> {
        if let Some((_, Callable::Bytecode { scope, .. })) = self.rt.space.callable(&self.get(1)?) {
            return Ok(scope);
        }
        Ok(self.rt.space.code(self.code_handle()?)?.scope_chain.clone())
    }

    /// Create a function object for nested function `index` of `parent`.
    ///
    /// The nested code instance is created on first use and shared by every
    /// closure made from it.
    pub(crate) fn instantiate_function(
        &mut self,
        parent: GcRef,
        index: u32,
        scope: ScopeChain,
    ) -> VmResult<GcRef> {
        let instance = self.rt.space.code(parent)?;
        let code = match instance.functions.get(index as usize).copied().flatten() {
            Some(code) => code,
            None => {
                let static_code = instance
                    .static_code
                    .functions
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::internal(format!("no nested function {index}")))?;
                let nested = CodeInstance::new(
                    static_code,
                    instance.global,
                    ScopeChain::new(),
                    self.rt.config.cache_chain_limit,
                );
                let handle = self.rt.space.alloc(HeapCell::Code(nested))?;
                if let Some(slot) = self.rt.space.code_mut(parent)?.functions.get_mut(index as usize) {
                    *slot = Some(handle);
                }
                handle
            }
        };

        let function_prototype = self.rt.intrinsics.function_prototype;
        let function = self.rt.space.alloc_object(
            Some(function_prototype),
            ObjectKind::Function(Callable::Bytecode { code, scope }),
        )?;
        let object_prototype = self.rt.intrinsics.object_prototype;
        let prototype = self.rt.space.alloc_object(Some(object_prototype), ObjectKind::Ordinary)?;
        self.rt.space.define_own_property_l(
            prototype,
            &JsString::from("constructor"),
            Value::Object(function),
            PropertyAttributes::HIDDEN,
        )?;
        self.rt.space.define_own_property_l(
            function,
            &JsString::from("prototype"),
            Value::Object(prototype),
            PropertyAttributes::from_bits(PropertyAttributes::WRITABLE),
        )?;
        Ok(function)
    }

    /// Scope chain for eval code started from the current frame.
    ///
    /// Function frames get a variable object mirroring their named
    /// registers in front of their closure scope.
    fn eval_scope(&mut self) -> VmResult<ScopeChain> {
        let kind = self.code()?.kind;
        if kind != CodeKind::Function {
            return Ok(self.rt.space.code(self.code_handle()?)?.scope_chain.clone());
        }
        let variables = self.materialize_variable_object()?;
        let mut scope = ScopeChain::new();
        scope.push(variables);
        scope.extend(self.closure_scope()?);
        Ok(scope)
    }

    fn materialize_variable_object(&mut self) -> VmResult<GcRef> {
        let handle = match self.ctx.current.variable_object {
            Some(handle) => handle,
            None => {
                let handle = self.rt.space.alloc_object(None, ObjectKind::Ordinary)?;
                self.ctx.current.variable_object = Some(handle);
                handle
            }
        };
        let code = Arc::clone(self.code()?);
        for (index, &name) in code.formals_and_locals.iter().enumerate() {
            let name = string_at(&code, name)?;
            let value = self.get(2 + index as u32)?;
            self.rt
                .space
                .define_own_property_l(handle, &name, value, PropertyAttributes::DEFAULT)?;
        }
        Ok(handle)
    }

    /// Copy variable object values back into the named registers of the
    /// function that ran eval
    fn write_back_variable_object(&mut self) -> VmResult<()> {
        let Some(handle) = self.ctx.current.variable_object else {
            return Ok(());
        };
        let code = Arc::clone(self.code()?);
        if code.kind != CodeKind::Function {
            return Ok(());
        }
        for (index, &name) in code.formals_and_locals.iter().enumerate() {
            let name = string_at(&code, name)?;
            if let Some(value) = self.rt.space.get_own(handle, &name)? {
                self.set(2 + index as u32, value)?;
            }
        }
        Ok(())
    }

    // ==================== Arguments ====================

    /// The `arguments` object of the nearest non-eval frame, created on first use
    pub(crate) fn arguments_object(&mut self) -> VmResult<GcRef> {
        let position = if self.ctx.current.is_eval() {
            let position = self
                .ctx
                .frames
                .iter()
                .position(|frame| frame.static_code.is_some() && !frame.is_eval())
                .ok_or_else(|| VmError::internal("eval frame without a caller"))?;
            Some(position)
        } else {
            None
        };
        let frame = match position {
            None => &self.ctx.current,
            Some(n) => self
                .ctx
                .frames
                .iter()
                .nth(n)
                .ok_or_else(|| VmError::internal("frame vanished"))?,
        };
        if let Some(existing) = frame.arguments_object {
            return Ok(existing);
        }
        let (window, argc) = (frame.window, frame.argc as usize);
        let values = self
            .ctx
            .registers
            .slots(window)
            .get(2..2 + argc)
            .map(<[Value]>::to_vec)
            .unwrap_or_default();

        let prototype = self.rt.intrinsics.object_prototype;
        let handle = self.rt.space.alloc_object(Some(prototype), ObjectKind::Arguments)?;
        self.rt.space.set_elements(handle, values)?;
        let frame = match position {
            None => Some(&mut self.ctx.current),
            Some(n) => self.ctx.frames.nth_mut(n),
        };
        if let Some(frame) = frame {
            frame.arguments_object = Some(handle);
        }
        Ok(handle)
    }

    /// Short text naming a value in error messages
    pub(crate) fn value_label(&self, value: &Value) -> String {
        match value {
            Value::String(s) => format!("\"{s}\""),
            Value::Object(_) => "object".to_string(),
            other => self.describe(other),
        }
    }
}
