//! Native code interface
//!
//! The dispatch loop never generates machine code itself. It counts slow
//! paths per code instance and, once a code instance crosses its threshold,
//! hands the static code and its profile bytes to a [`NativeBackend`].
//! Later calls go through the backend's entry point using the same register
//! window an interpreted call would get. A backend that cannot continue
//! returns [`NativeOutcome::Deoptimize`] with enough state to resume in the
//! interpreter at a given instruction.

use tern_vm_bytecode::StaticCode;

use crate::value::Value;

/// Backend-issued handle to generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeEntry {
    /// Opaque to the interpreter
    pub handle: u64,
}

/// Register window handed to generated code
#[derive(Debug)]
pub struct TrampolineFrame<'a> {
    /// Code being run
    pub code: &'a StaticCode,
    /// Register 0 is `this`, 1 the callee, then arguments and locals
    pub registers: &'a mut [Value],
    /// Actual argument count
    pub argc: u32,
}

/// Interpreter state to resume from after leaving generated code
#[derive(Debug, Clone)]
pub struct DeoptState {
    /// Instruction to continue at
    pub ip: u32,
    /// Register contents; shorter than the frame means the rest is `undefined`
    pub registers: Vec<Value>,
}

/// How a native call ended
#[derive(Debug, Clone)]
pub enum NativeOutcome {
    /// Normal return
    Returned(Value),
    /// Uncaught exception in generated code
    Threw(Value),
    /// Bail out and resume in the interpreter
    Deoptimize(DeoptState),
}

/// Native code generator and entry trampoline
pub trait NativeBackend: Send {
    /// Generate code; `None` leaves the function interpreted
    fn compile(&mut self, code: &StaticCode, profile: Option<&[u8]>) -> Option<NativeEntry>;

    /// Run generated code in a prepared register window
    fn call(&mut self, entry: NativeEntry, frame: TrampolineFrame<'_>) -> NativeOutcome;
}

/// Backend that never generates code
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNativeBackend;

impl NativeBackend for NoNativeBackend {
    fn compile(&mut self, _code: &StaticCode, _profile: Option<&[u8]>) -> Option<NativeEntry> {
        None
    }

    fn call(&mut self, _entry: NativeEntry, frame: TrampolineFrame<'_>) -> NativeOutcome {
        NativeOutcome::Deoptimize(DeoptState {
            ip: 0,
            registers: frame.registers.to_vec(),
        })
    }
}
