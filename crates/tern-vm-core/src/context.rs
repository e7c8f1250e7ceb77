//! Execution context
//!
//! One logical thread of script execution: its register arena, saved
//! frames, the frame being executed, the pending exception, and the
//! cooperative-yield state. Contexts are owned by the [`crate::Runtime`] and
//! run one at a time; a suspended context keeps all of this intact until it
//! is resumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tern_vm_gc::{RootProvider, Trace, Tracer};

use crate::arena::BlockStack;
use crate::cache::CacheStats;
use crate::config::VmConfig;
use crate::error::StackFrame;
use crate::frame::{FrameStack, VirtualStackFrame};
use crate::hooks::{CodeProfiler, DebugHooks, ProfilingSink};
use crate::value::Value;

/// Host callback consulted when the time quota runs out; returning `true`
/// asks the context to yield
pub type OutOfTimeCallback = Box<dyn FnMut() -> bool + Send>;

/// How a run of a context ended
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The program or eval code finished with this value
    Completed(Value),
    /// Execution yielded at a checkpoint; resume to continue
    Suspended,
}

impl Completion {
    /// The completion value, if execution finished
    pub fn value(&self) -> Option<&Value> {
        match self {
            Completion::Completed(value) => Some(value),
            Completion::Suspended => None,
        }
    }
}

/// Per-thread execution state
pub struct ExecutionContext {
    pub(crate) registers: BlockStack<Value>,
    pub(crate) frames: FrameStack,
    pub(crate) current: VirtualStackFrame,
    pub(crate) implicit_bool: bool,
    pub(crate) exception: Value,
    /// Values kept alive by the interpreter while a slow path re-enters
    pub(crate) scratch: Vec<Value>,
    pub(crate) time_quota: u32,
    pub(crate) time_until_check: u32,
    max_time_quota: u32,
    suspend_flag: Arc<AtomicBool>,
    interrupt_flag: Arc<AtomicBool>,
    pub(crate) out_of_time: Option<OutOfTimeCallback>,
    /// Dispatch loops currently running on this context
    pub(crate) nesting: u32,
    pub(crate) yield_pending: bool,
    /// The outermost loop was entered by `run` or `resume` and may yield
    pub(crate) yieldable: bool,
    pub(crate) suspended: bool,
    pub(crate) hooks: Option<Box<dyn DebugHooks>>,
    pub(crate) profiler: Option<Box<dyn ProfilingSink>>,
    pub(crate) stats: CacheStats,
    pub(crate) last_stack_trace: Vec<StackFrame>,
    pub(crate) stack_trace_depth: usize,
}

impl ExecutionContext {
    /// Create an idle context
    pub fn new(config: &VmConfig) -> Self {
        let quota = config.initial_time_quota.max(1);
        Self {
            registers: BlockStack::new(
                config.register_block_slots,
                config.register_growth_ratio,
                config.max_register_slots,
            ),
            frames: FrameStack::new(config.frame_block_frames, config.max_call_depth),
            current: VirtualStackFrame::default(),
            implicit_bool: false,
            exception: Value::NO_EXCEPTION,
            scratch: Vec::new(),
            time_quota: quota,
            time_until_check: quota,
            max_time_quota: config.max_time_quota.max(quota),
            suspend_flag: Arc::new(AtomicBool::new(false)),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            out_of_time: None,
            nesting: 0,
            yield_pending: false,
            yieldable: false,
            suspended: false,
            hooks: None,
            profiler: config
                .jit
                .profiling_enabled()
                .then(|| Box::new(CodeProfiler) as Box<dyn ProfilingSink>),
            stats: CacheStats::default(),
            last_stack_trace: Vec::new(),
            stack_trace_depth: config.stack_trace_depth,
        }
    }

    /// Flag that makes the context yield at its next checkpoint.
    ///
    /// May be set from any thread.
    pub fn suspend_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.suspend_flag)
    }

    /// Ask the context to yield at its next checkpoint
    pub fn request_suspend(&self) {
        self.suspend_flag.store(true, Ordering::Release);
    }

    /// Flag that aborts execution at the next checkpoint.
    ///
    /// May be set from any thread.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt_flag)
    }

    /// Install the out-of-time callback
    pub fn set_out_of_time_callback(&mut self, callback: impl FnMut() -> bool + Send + 'static) {
        self.out_of_time = Some(Box::new(callback));
    }

    /// Attach a debugger
    pub fn set_debug_hooks(&mut self, hooks: Box<dyn DebugHooks>) {
        self.hooks = Some(hooks);
    }

    /// Detach the debugger
    pub fn clear_debug_hooks(&mut self) -> Option<Box<dyn DebugHooks>> {
        self.hooks.take()
    }

    /// Replace the profiling sink
    pub fn set_profiler(&mut self, profiler: Option<Box<dyn ProfilingSink>>) {
        self.profiler = profiler;
    }

    /// Inline cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }

    /// Whether the context is parked at a checkpoint
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether a dispatch loop is running on this context
    pub fn is_running(&self) -> bool {
        self.nesting > 0
    }

    /// Saved frames
    pub fn depth(&self) -> usize {
        self.frames.depth()
    }

    /// Current adaptive time quota
    pub fn time_quota(&self) -> u32 {
        self.time_quota
    }

    /// Register slots in use
    pub fn registers_in_use(&self) -> usize {
        self.registers.used()
    }

    /// Stack trace of the last exception that left a dispatch loop
    pub fn last_stack_trace(&self) -> &[StackFrame] {
        &self.last_stack_trace
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt_flag.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_suspend_request(&self) -> bool {
        self.suspend_flag.swap(false, Ordering::AcqRel)
    }

    /// Consume one checkpoint; true when the quota ran out and the host
    /// asked to yield
    pub(crate) fn tick(&mut self) -> bool {
        self.time_until_check = self.time_until_check.saturating_sub(1);
        if self.time_until_check > 0 {
            return false;
        }
        let out_of_time = self.out_of_time.as_mut().is_some_and(|callback| callback());
        self.time_quota = if out_of_time {
            self.time_quota / 2 + 1
        } else {
            self.time_quota.saturating_mul(2).min(self.max_time_quota)
        };
        self.time_until_check = self.time_quota;
        out_of_time
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("depth", &self.frames.depth())
            .field("registers", &self.registers.used())
            .field("nesting", &self.nesting)
            .field("suspended", &self.suspended)
            .field("time_quota", &self.time_quota)
            .finish_non_exhaustive()
    }
}

impl Trace for ExecutionContext {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.trace_all(self.registers.live());
        self.frames.trace(tracer);
        self.current.trace(tracer);
        self.exception.trace(tracer);
        tracer.trace_all(&self.scratch);
    }
}

impl RootProvider for ExecutionContext {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        self.trace(tracer);
    }
}
