//! Direct and indirect eval against a table-driven compiler

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tern_vm_bytecode::{CodeBuilder, CodeKind, Register, StaticCode};
use tern_vm_core::{EvalCompiler, Runtime, Value};

const RESULT: Register = Register(0);

fn at(base: Register, offset: u32) -> Register {
    Register(base.0 + offset)
}

/// Compiles a fixed set of source strings and counts how often it is asked
struct ScriptTable {
    compiled: Arc<AtomicUsize>,
}

impl EvalCompiler for ScriptTable {
    fn compile(&mut self, source: &str, kind: CodeKind, _strict: bool) -> Result<StaticCode, String> {
        self.compiled.fetch_add(1, Ordering::SeqCst);
        let mut b = match kind {
            CodeKind::Eval => CodeBuilder::eval_code(),
            _ => CodeBuilder::program(),
        };
        match source {
            "40 + 2" => {
                let t = b.temp();
                b.load_int(t, 40).add_imm(t, t, 2).copy(RESULT, t).exit();
            }
            "x = x + 41" => {
                let t = b.temp();
                b.get_scope(t, "x", None)
                    .add_imm(t, t, 41)
                    .put_scope("x", t, None)
                    .copy(RESULT, t)
                    .exit();
            }
            "var y = 5" => {
                let t = b.temp();
                b.declare_variable("y");
                b.load_int(t, 5).put_scope("y", t, None).exit();
            }
            _ => return Err(format!("Unexpected token in {source:?}")),
        }
        b.finish().map_err(|error| error.to_string())
    }
}

fn runtime() -> (Runtime, Arc<AtomicUsize>) {
    let compiled = Arc::new(AtomicUsize::new(0));
    let mut rt = Runtime::new().unwrap();
    rt.set_eval_compiler(Box::new(ScriptTable {
        compiled: Arc::clone(&compiled),
    }));
    (rt, compiled)
}

fn run(rt: &mut Runtime, code: StaticCode) -> Value {
    let ctx = rt.create_context();
    let program = rt.load(code).unwrap();
    rt.run(ctx, &program).unwrap().value().cloned().unwrap_or_default()
}

/// Emit `frame = eval(source)`
fn direct_eval(b: &mut CodeBuilder, frame: Register, source: &str) {
    b.load_undefined(frame)
        .get_global(at(frame, 1), "eval")
        .load_string(at(frame, 2), source)
        .eval(frame, 1);
}

#[test]
fn test_direct_eval_completion_value() {
    let (mut rt, _) = runtime();
    let mut b = CodeBuilder::program();
    let frame = b.call_frame(1);
    direct_eval(&mut b, frame, "40 + 2");
    b.copy(RESULT, frame).exit();
    assert_eq!(run(&mut rt, b.finish().unwrap()), Value::Int32(42));
}

#[test]
fn test_eval_site_caches_compiled_code() {
    let (mut rt, compiled) = runtime();
    let mut b = CodeBuilder::program();
    // Loop state must sit below the call frame to survive each eval
    let (i, limit, sum) = (b.temp(), b.temp(), b.temp());
    let frame = b.call_frame(1);
    let top = b.label();
    b.load_int(i, 0).load_int(limit, 3).load_int(sum, 0);
    b.bind(top);
    direct_eval(&mut b, frame, "40 + 2");
    b.add(sum, sum, frame)
        .inc(i)
        .compare(tern_vm_bytecode::Opcode::Lt, i, limit)
        .jump_if_true(top);
    b.copy(RESULT, sum).exit();

    assert_eq!(run(&mut rt, b.finish().unwrap()), Value::Int32(126));
    assert_eq!(compiled.load(Ordering::SeqCst), 1);
}

#[test]
fn test_eval_reads_and_writes_function_locals() {
    // function f() { var x = 1; eval("x = x + 41"); return x; }
    let mut f = CodeBuilder::function("f", &[]);
    let x = f.local("x");
    let frame = f.call_frame(1);
    f.load_int(x, 1);
    direct_eval(&mut f, frame, "x = x + 41");
    f.return_value(x);
    let function = f.finish().unwrap();

    let (mut rt, _) = runtime();
    let mut b = CodeBuilder::program();
    let frame = b.call_frame(0);
    b.load_undefined(frame)
        .new_function(at(frame, 1), function, &[])
        .call(frame, 0)
        .copy(RESULT, frame)
        .exit();
    assert_eq!(run(&mut rt, b.finish().unwrap()), Value::Int32(42));
}

#[test]
fn test_program_level_eval_declares_globals() {
    let (mut rt, _) = runtime();
    let mut b = CodeBuilder::program();
    let frame = b.call_frame(1);
    direct_eval(&mut b, frame, "var y = 5");
    b.get_global(RESULT, "y").exit();
    assert_eq!(run(&mut rt, b.finish().unwrap()), Value::Int32(5));
    assert_eq!(rt.get_global("y").unwrap(), Value::Int32(5));
}

#[test]
fn test_eval_of_non_string_returns_argument() {
    let (mut rt, compiled) = runtime();
    let mut b = CodeBuilder::program();
    let frame = b.call_frame(1);
    b.load_undefined(frame)
        .get_global(at(frame, 1), "eval")
        .load_int(at(frame, 2), 17)
        .eval(frame, 1)
        .copy(RESULT, frame)
        .exit();
    assert_eq!(run(&mut rt, b.finish().unwrap()), Value::Int32(17));
    assert_eq!(compiled.load(Ordering::SeqCst), 0);
}

#[test]
fn test_syntax_error_is_catchable_value() {
    let (mut rt, _) = runtime();
    let mut b = CodeBuilder::program();
    let frame = b.call_frame(1);
    direct_eval(&mut b, frame, "(");
    b.exit();
    let error = {
        let ctx = rt.create_context();
        let program = rt.load(b.finish().unwrap()).unwrap();
        rt.run(ctx, &program).unwrap_err()
    };
    assert!(error.to_string().contains("SyntaxError"), "{error}");
}

#[test]
fn test_eval_source_uses_program_cache() {
    let (mut rt, compiled) = runtime();
    let ctx = rt.create_context();
    let first = rt.eval_source(ctx, "40 + 2").unwrap();
    let second = rt.eval_source(ctx, "40 + 2").unwrap();
    assert_eq!(first.value(), Some(&Value::Int32(42)));
    assert_eq!(second, first);
    assert_eq!(compiled.load(Ordering::SeqCst), 1);
    assert_eq!(rt.program_cache().len(), 1);
}

#[test]
fn test_indirect_eval_through_host_call() {
    let (mut rt, _) = runtime();
    let ctx = rt.create_context();
    let eval = Value::Object(rt.intrinsics().eval);
    let value = rt.call(ctx, &eval, Value::Undefined, &[Value::string("40 + 2")]).unwrap();
    assert_eq!(value, Value::Int32(42));
}

#[test]
fn test_eval_without_compiler_is_eval_error() {
    let mut rt = Runtime::new().unwrap();
    let ctx = rt.create_context();
    let error = rt.eval_source(ctx, "1").unwrap_err();
    assert!(error.to_string().contains("EvalError"), "{error}");
}
