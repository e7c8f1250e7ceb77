//! Runtime: the shared heap, intrinsics, host functions and contexts
//!
//! A [`Runtime`] owns one object space and every [`ExecutionContext`]
//! created on it. Contexts run one at a time: while a context executes it is
//! moved out of the runtime and handed to an [`Interpreter`] together with a
//! mutable borrow of the runtime, so nothing else can touch the heap.

use std::sync::Arc;

use tern_vm_bytecode::{CodeKind, StaticCode};
use tern_vm_gc::{GcRef, GcStats, RootProvider, Tracer};

use crate::class::PropertyAttributes;
use crate::code::CodeInstance;
use crate::config::VmConfig;
use crate::context::{Completion, ExecutionContext};
use crate::error::{VmError, VmResult};
use crate::gc::{HeapCell, PinnedRoots};
use crate::interpreter::Interpreter;
use crate::native::{NativeBackend, NoNativeBackend};
use crate::object::{Callable, ObjectKind, ScopeChain};
use crate::program_cache::ProgramCache;
use crate::realm::{Intrinsics, register_host};
use crate::space::ObjectSpace;
use crate::value::{JsString, Value};

/// Signature of a host function: interpreter, `this`, arguments
pub type HostFn = dyn Fn(&mut Interpreter<'_>, &Value, &[Value]) -> VmResult<Value> + Send + Sync;

/// Entry in the host function table
#[derive(Clone)]
pub struct HostFunction {
    /// Name, for stack traces
    pub name: JsString,
    /// Implementation
    pub func: Arc<HostFn>,
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// Source compiler used by `eval` and [`Runtime::eval_source`]
pub trait EvalCompiler: Send {
    /// Compile `source` as program or eval code; the error is a syntax
    /// error message
    fn compile(&mut self, source: &str, kind: CodeKind, strict: bool) -> Result<StaticCode, String>;
}

/// Handle to a context owned by a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

/// When a collection runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectMode {
    /// Past the load-factor limit
    Threshold,
    /// Past the lower offline limit
    Idle,
    Force,
}

/// A program instantiated against the runtime's global object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Program {
    code: GcRef,
}

impl Program {
    /// The program's code instance
    pub fn code_instance(&self) -> GcRef {
        self.code
    }
}

/// Everything a collection must keep alive
pub(crate) struct RuntimeRoots<'a> {
    intrinsics: &'a Intrinsics,
    pinned: &'a PinnedRoots,
    contexts: &'a [Option<ExecutionContext>],
    active: Option<&'a ExecutionContext>,
}

impl RootProvider for RuntimeRoots<'_> {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        self.intrinsics.trace_roots(tracer);
        self.pinned.trace_roots(tracer);
        for context in self.contexts.iter().flatten() {
            context.trace_roots(tracer);
        }
        if let Some(active) = self.active {
            active.trace_roots(tracer);
        }
    }
}

/// Owner of the heap and all execution contexts
pub struct Runtime {
    pub(crate) space: ObjectSpace,
    pub(crate) intrinsics: Intrinsics,
    pub(crate) config: VmConfig,
    pub(crate) hosts: Vec<HostFunction>,
    pub(crate) pinned: PinnedRoots,
    pub(crate) compiler: Option<Box<dyn EvalCompiler>>,
    pub(crate) native: Box<dyn NativeBackend>,
    pub(crate) program_cache: ProgramCache,
    contexts: Vec<Option<ExecutionContext>>,
}

impl Runtime {
    /// Create a runtime with default configuration
    pub fn new() -> VmResult<Self> {
        Self::with_config(VmConfig::default())
    }

    /// Create a runtime
    pub fn with_config(config: VmConfig) -> VmResult<Self> {
        let mut space = ObjectSpace::new(config.gc.clone(), config.dictionary_threshold);
        let mut hosts = Vec::new();
        let intrinsics = Intrinsics::create(&mut space, &mut hosts)?;
        Ok(Self {
            program_cache: ProgramCache::new(config.program_cache_capacity),
            space,
            intrinsics,
            hosts,
            pinned: PinnedRoots::default(),
            compiler: None,
            native: Box::new(NoNativeBackend),
            contexts: Vec::new(),
            config,
        })
    }

    /// Configuration
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Object space
    pub fn space(&self) -> &ObjectSpace {
        &self.space
    }

    /// Mutable object space
    pub fn space_mut(&mut self) -> &mut ObjectSpace {
        &mut self.space
    }

    /// Intrinsic objects
    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// The global object
    pub fn global_object(&self) -> GcRef {
        self.intrinsics.global
    }

    /// Install the source compiler
    pub fn set_eval_compiler(&mut self, compiler: Box<dyn EvalCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Install the native code backend
    pub fn set_native_backend(&mut self, backend: Box<dyn NativeBackend>) {
        self.native = backend;
    }

    /// Compiled program cache
    pub fn program_cache(&self) -> &ProgramCache {
        &self.program_cache
    }

    /// Heap statistics
    pub fn heap_stats(&self) -> GcStats {
        self.space.heap.stats()
    }

    // ==================== Contexts ====================

    /// Create an idle execution context
    pub fn create_context(&mut self) -> ContextId {
        let context = ExecutionContext::new(&self.config);
        if let Some(index) = self.contexts.iter().position(Option::is_none) {
            self.contexts[index] = Some(context);
            return ContextId(index);
        }
        self.contexts.push(Some(context));
        ContextId(self.contexts.len() - 1)
    }

    /// Context state, unless it is currently executing
    pub fn context(&self, id: ContextId) -> Option<&ExecutionContext> {
        self.contexts.get(id.0)?.as_ref()
    }

    /// Mutable context state, unless it is currently executing
    pub fn context_mut(&mut self, id: ContextId) -> Option<&mut ExecutionContext> {
        self.contexts.get_mut(id.0)?.as_mut()
    }

    /// Drop a context, abandoning any suspended execution
    pub fn destroy_context(&mut self, id: ContextId) -> bool {
        self.contexts
            .get_mut(id.0)
            .and_then(Option::take)
            .is_some()
    }

    fn with_context<T>(
        &mut self,
        id: ContextId,
        f: impl FnOnce(&mut Interpreter<'_>) -> VmResult<T>,
    ) -> VmResult<T> {
        let mut context = self
            .contexts
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| VmError::internal("context is unknown or already running"))?;
        let result = f(&mut Interpreter::new(&mut context, self));
        if let Some(slot) = self.contexts.get_mut(id.0) {
            *slot = Some(context);
        }
        result
    }

    // ==================== Programs ====================

    /// Validate compiled program code and instantiate it
    pub fn load(&mut self, mut code: StaticCode) -> VmResult<Program> {
        if !code.is_shared() {
            code.find_instruction_offsets()?;
        }
        code.validate()?;
        code.prepare_for_sharing();
        self.load_shared(Arc::new(code))
    }

    /// Instantiate already validated program code
    pub fn load_shared(&mut self, code: Arc<StaticCode>) -> VmResult<Program> {
        if code.kind != CodeKind::Program {
            return Err(VmError::internal("only program code can be loaded"));
        }
        let instance = CodeInstance::new(
            code,
            self.intrinsics.global,
            ScopeChain::new(),
            self.config.cache_chain_limit,
        );
        let handle = self.space.alloc(HeapCell::Code(instance))?;
        self.pinned.pin(handle);
        Ok(Program { code: handle })
    }

    /// Let a program be collected once no frame uses it
    pub fn unload(&mut self, program: Program) {
        self.pinned.unpin(program.code);
    }

    /// Run a program to completion or its first yield
    pub fn run(&mut self, id: ContextId, program: &Program) -> VmResult<Completion> {
        let code = program.code;
        self.with_context(id, |interp| interp.run_program(code))
    }

    /// Continue a suspended context
    pub fn resume(&mut self, id: ContextId) -> VmResult<Completion> {
        self.with_context(id, |interp| interp.resume())
    }

    /// Compile (or fetch from the program cache) and run source text
    pub fn eval_source(&mut self, id: ContextId, source: &str) -> VmResult<Completion> {
        let code = self.compile_program(source)?;
        let program = self.load_shared(code)?;
        let result = self.run(id, &program);
        self.unload(program);
        result
    }

    pub(crate) fn compile_program(&mut self, source: &str) -> VmResult<Arc<StaticCode>> {
        if let Some(code) = self.program_cache.get(source) {
            return Ok(code);
        }
        let code = Arc::new(self.compile(source, CodeKind::Program, false)?);
        self.program_cache.insert(Arc::from(source), Arc::clone(&code));
        Ok(code)
    }

    /// Compile and validate, mapping compiler failures to `SyntaxError`
    pub(crate) fn compile(&mut self, source: &str, kind: CodeKind, strict: bool) -> VmResult<StaticCode> {
        let compiler = self
            .compiler
            .as_mut()
            .ok_or_else(|| VmError::eval_error("no compiler is available"))?;
        let mut code = compiler
            .compile(source, kind, strict)
            .map_err(VmError::SyntaxError)?;
        if code.kind != kind {
            return Err(VmError::internal("compiler returned code of the wrong kind"));
        }
        code.find_instruction_offsets()?;
        code.validate()?;
        code.prepare_for_sharing();
        Ok(code)
    }

    /// Call a function from the host; the call never yields
    pub fn call(&mut self, id: ContextId, function: &Value, this: Value, args: &[Value]) -> VmResult<Value> {
        let function = function.clone();
        self.with_context(id, move |interp| interp.call_function(&function, this, args))
    }

    // ==================== Globals and host functions ====================

    /// Declare a global variable and set its value
    pub fn declare_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let global = self.intrinsics.global;
        let slot = self.space.declare_global_variable(global, &JsString::from(name))?;
        if let ObjectKind::Global(variables) = self.space.object_mut(global)?.kind_mut() {
            variables.set(slot, value);
        }
        Ok(())
    }

    /// Read a global variable or global object property
    pub fn get_global(&self, name: &str) -> VmResult<Value> {
        Ok(self.space.get_l(self.intrinsics.global, name)?.value)
    }

    /// Assign a global, creating a global object property when undeclared
    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        self.space
            .put_l(self.intrinsics.global, &JsString::from(name), value)?;
        Ok(())
    }

    /// Create a function object backed by a host closure
    pub fn new_host_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut Interpreter<'_>, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> VmResult<Value> {
        let id = register_host(&mut self.hosts, name, Arc::new(func));
        let handle = self.space.alloc_object(
            Some(self.intrinsics.function_prototype),
            ObjectKind::Function(Callable::Host { id, builtin: None }),
        )?;
        Ok(Value::Object(handle))
    }

    /// Create a host function and bind it on the global object
    pub fn define_host_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut Interpreter<'_>, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> VmResult<Value> {
        let function = self.new_host_function(name, func)?;
        self.space.define_own_property_l(
            self.intrinsics.global,
            &JsString::from(name),
            function.clone(),
            PropertyAttributes::HIDDEN,
        )?;
        Ok(function)
    }

    /// Keep a value alive across collections until a matching
    /// [`Self::unpin`]. Only objects live in the heap; other values need
    /// no pin.
    pub fn pin(&mut self, value: &Value) {
        if let Some(handle) = value.as_object() {
            self.pinned.pin(handle);
        }
    }

    /// Release a value pinned with [`Self::pin`]
    pub fn unpin(&mut self, value: &Value) {
        if let Some(handle) = value.as_object() {
            self.pinned.unpin(handle);
        }
    }

    // ==================== Collection ====================

    /// Collect now; returns reclaimed bytes
    pub fn collect_garbage(&mut self) -> usize {
        self.collect(None, CollectMode::Force).unwrap_or(0)
    }

    /// Collect against the lower idle limit, for hosts with nothing to run.
    /// Returns reclaimed bytes, or `None` when the heap is below the limit.
    pub fn collect_when_idle(&mut self) -> Option<usize> {
        self.collect(None, CollectMode::Idle)
    }

    pub(crate) fn collect(&mut self, active: Option<&ExecutionContext>, mode: CollectMode) -> Option<usize> {
        let Runtime {
            space,
            intrinsics,
            pinned,
            contexts,
            ..
        } = self;
        let roots = RuntimeRoots {
            intrinsics,
            pinned,
            contexts,
            active,
        };
        let reclaimed = match mode {
            CollectMode::Threshold => space.heap.maybe_collect(&roots),
            CollectMode::Idle => space.heap.maybe_collect_offline(&roots),
            CollectMode::Force => Some(space.heap.force_collect(&roots)),
        }?;
        let heap = &space.heap;
        space.classes.prune(|handle| heap.is_live(handle));
        tracing::debug!(
            target: "tern::vm",
            reclaimed,
            live = heap.live_bytes(),
            "garbage collected"
        );
        Some(reclaimed)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("contexts", &self.contexts.len())
            .field("hosts", &self.hosts.len())
            .field("live_bytes", &self.space.heap.live_bytes())
            .finish_non_exhaustive()
    }
}
