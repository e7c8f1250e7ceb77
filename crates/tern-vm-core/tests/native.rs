//! Native backend handoff and debugger hooks

use std::sync::Arc;

use parking_lot::Mutex;
use tern_vm_bytecode::{CodeBuilder, Register, StaticCode};
use tern_vm_core::{
    DebugHooks, DeoptState, InstructionLocation, JitConfig, NativeBackend, NativeEntry,
    NativeOutcome, Runtime, TrampolineFrame, Value, VmConfig,
};

const RESULT: Register = Register(0);

fn at(base: Register, offset: u32) -> Register {
    Register(base.0 + offset)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Return,
    Deoptimize,
    Throw,
}

#[derive(Debug, Default)]
struct Log {
    compiled: Vec<String>,
    calls: usize,
    saw_profile: bool,
}

struct FakeBackend {
    mode: Mode,
    log: Arc<Mutex<Log>>,
}

impl NativeBackend for FakeBackend {
    fn compile(&mut self, code: &StaticCode, profile: Option<&[u8]>) -> Option<NativeEntry> {
        let mut log = self.log.lock();
        log.compiled.push(code.display_name().to_string());
        log.saw_profile |= profile.is_some();
        Some(NativeEntry { handle: 7 })
    }

    fn call(&mut self, entry: NativeEntry, frame: TrampolineFrame<'_>) -> NativeOutcome {
        assert_eq!(entry.handle, 7);
        self.log.lock().calls += 1;
        match self.mode {
            Mode::Return => NativeOutcome::Returned(Value::string("native")),
            Mode::Throw => NativeOutcome::Threw(Value::string("from native")),
            Mode::Deoptimize => NativeOutcome::Deoptimize(DeoptState {
                ip: 0,
                registers: frame.registers.to_vec(),
            }),
        }
    }
}

/// `function hot(o) { return o.v; }`
fn hot_function() -> StaticCode {
    let mut f = CodeBuilder::function("hot", &["o"]);
    let o = f.formal(0);
    let t = f.temp();
    f.get_named(t, o, "v").return_value(t);
    f.finish().unwrap()
}

/// Calls `hot({v: 7})` three times and returns the last two results
fn program() -> StaticCode {
    let mut b = CodeBuilder::program();
    let (hot, o, seven, second) = (b.temp(), b.temp(), b.temp(), b.temp());
    let frame = b.call_frame(1);
    b.new_function(hot, hot_function(), &[])
        .load_int(seven, 7)
        .new_object_literal(o, &[("v", seven)]);
    for _ in 0..2 {
        b.load_undefined(frame)
            .copy(at(frame, 1), hot)
            .copy(at(frame, 2), o)
            .call(frame, 1)
            .copy(second, frame);
    }
    b.load_undefined(frame)
        .copy(at(frame, 1), hot)
        .copy(at(frame, 2), o)
        .call(frame, 1)
        .new_object_literal(RESULT, &[("second", second), ("third", frame)])
        .exit();
    b.finish().unwrap()
}

fn runtime(mode: Mode) -> (Runtime, Arc<Mutex<Log>>) {
    let jit = JitConfig {
        enabled: true,
        generate_factor: 0,
        ..JitConfig::default()
    };
    let mut rt = Runtime::with_config(VmConfig::default().jit(jit)).unwrap();
    let log = Arc::new(Mutex::new(Log::default()));
    rt.set_native_backend(Box::new(FakeBackend {
        mode,
        log: Arc::clone(&log),
    }));
    (rt, log)
}

fn results(rt: &mut Runtime) -> Result<(Value, Value), String> {
    let ctx = rt.create_context();
    let program = rt.load(program()).unwrap();
    let completion = rt.run(ctx, &program).map_err(|error| error.to_string())?;
    let Some(Value::Object(handle)) = completion.value().cloned() else {
        return Err("no result object".to_string());
    };
    let second = rt.space().get_own(handle, "second").unwrap().unwrap_or_default();
    let third = rt.space().get_own(handle, "third").unwrap().unwrap_or_default();
    Ok((second, third))
}

#[test]
fn test_hot_function_moves_to_native_code() {
    let (mut rt, log) = runtime(Mode::Return);
    let (second, third) = results(&mut rt).unwrap();
    // First call interprets and takes a slow case; later calls are native
    assert_eq!(second, Value::string("native"));
    assert_eq!(third, Value::string("native"));
    let log = log.lock();
    assert_eq!(log.compiled, vec!["hot".to_string()]);
    assert_eq!(log.calls, 2);
    assert!(log.saw_profile);
}

#[test]
fn test_deoptimization_resumes_in_interpreter() {
    let (mut rt, log) = runtime(Mode::Deoptimize);
    let (second, third) = results(&mut rt).unwrap();
    assert_eq!(second, Value::Int32(7));
    assert_eq!(third, Value::Int32(7));
    // Deoptimized code is dropped and the site now hits its cache
    assert_eq!(log.lock().calls, 1);
}

#[test]
fn test_native_throw_is_catchable_exception() {
    let (mut rt, _) = runtime(Mode::Throw);
    let error = results(&mut rt).unwrap_err();
    assert!(error.contains("from native"), "{error}");
}

#[test]
fn test_disabled_jit_never_compiles() {
    let mut rt = Runtime::new().unwrap();
    let log = Arc::new(Mutex::new(Log::default()));
    rt.set_native_backend(Box::new(FakeBackend {
        mode: Mode::Return,
        log: Arc::clone(&log),
    }));
    let (second, third) = results(&mut rt).unwrap();
    assert_eq!((second, third), (Value::Int32(7), Value::Int32(7)));
    assert!(log.lock().compiled.is_empty());
}

// ==================== Debugger hooks ====================

struct Recorder(Arc<Mutex<Vec<String>>>);

impl DebugHooks for Recorder {
    fn enter_function(&mut self, location: &InstructionLocation) {
        self.0.lock().push(format!("enter {}", location.function));
    }

    fn leave_function(&mut self, location: &InstructionLocation) {
        self.0.lock().push(format!("leave {}", location.function));
    }

    fn on_return(&mut self, location: &InstructionLocation, value: &Value) {
        self.0.lock().push(format!("return {} {value:?}", location.function));
    }

    fn on_exception(&mut self, location: &InstructionLocation, value: &Value) {
        self.0.lock().push(format!("throw {} {value:?}", location.function));
    }
}

#[test]
fn test_hooks_see_calls_and_returns() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let ctx = rt.create_context();
    rt.context_mut(ctx)
        .unwrap()
        .set_debug_hooks(Box::new(Recorder(Arc::clone(&events))));

    let mut b = CodeBuilder::program();
    let (hot, o, seven) = (b.temp(), b.temp(), b.temp());
    let frame = b.call_frame(1);
    b.new_function(hot, hot_function(), &[])
        .load_int(seven, 7)
        .new_object_literal(o, &[("v", seven)])
        .load_undefined(frame)
        .copy(at(frame, 1), hot)
        .copy(at(frame, 2), o)
        .call(frame, 1)
        .copy(RESULT, frame)
        .exit();
    let program = rt.load(b.finish().unwrap()).unwrap();
    rt.run(ctx, &program).unwrap();

    let events = events.lock();
    let position = |event: &str| events.iter().position(|e| e == event);
    let enter = position("enter hot").expect("enter hook");
    let ret = position("return hot 7").expect("return hook");
    let leave = position("leave hot").expect("leave hook");
    assert!(enter < ret && ret < leave, "{events:?}");
}

#[test]
fn test_hooks_see_exceptions() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let ctx = rt.create_context();
    rt.context_mut(ctx)
        .unwrap()
        .set_debug_hooks(Box::new(Recorder(Arc::clone(&events))));

    let mut b = CodeBuilder::program();
    let v = b.temp();
    b.load_int(v, 3).throw(v);
    let program = rt.load(b.finish().unwrap()).unwrap();
    assert!(rt.run(ctx, &program).is_err());
    assert!(events.lock().iter().any(|e| e.ends_with(" 3") && e.starts_with("throw")));
}
