//! Inline cache and dispatch benchmarks
//!
//! Measures named property access across cache states, global access, and
//! interpreted call overhead.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use tern_vm_bytecode::{CodeBuilder, Opcode, Register, StaticCode};
use tern_vm_core::{Program, Runtime, Value};

const RESULT: Register = Register(0);
const ITERATIONS: i32 = 1000;

fn at(base: Register, offset: u32) -> Register {
    Register(base.0 + offset)
}

/// Loop counter registers; allocate them before any call frame
fn counters(b: &mut CodeBuilder) -> (Register, Register) {
    (b.temp(), b.temp())
}

/// Wrap `body` in a counted loop
fn looped(b: &mut CodeBuilder, body: impl Fn(&mut CodeBuilder)) {
    let counters = counters(b);
    looped_with(b, counters, body);
}

fn looped_with(b: &mut CodeBuilder, (i, limit): (Register, Register), body: impl Fn(&mut CodeBuilder)) {
    let top = b.label();
    b.load_int(i, 0).load_int(limit, ITERATIONS);
    b.bind(top);
    body(b);
    b.inc(i).compare(Opcode::Lt, i, limit).jump_if_true(top);
}

fn prepare(code: StaticCode) -> (Runtime, tern_vm_core::ContextId, Program) {
    let mut rt = Runtime::new().unwrap();
    rt.declare_global("g", Value::Int32(1)).unwrap();
    let ctx = rt.create_context();
    let program = rt.load(code).unwrap();
    (rt, ctx, program)
}

fn bench_program(c: &mut Criterion, name: &str, code: StaticCode) {
    let (mut rt, ctx, program) = prepare(code);
    c.bench_function(name, |bench| {
        bench.iter(|| black_box(rt.run(ctx, &program).unwrap()));
    });
}

/// Same shape at every access
fn monomorphic_get() -> StaticCode {
    let mut b = CodeBuilder::program();
    let (one, o, t) = (b.temp(), b.temp(), b.temp());
    b.load_int(one, 1).new_object_literal(o, &[("x", one), ("y", one)]);
    looped(&mut b, |b| {
        b.get_named(t, o, "y");
    });
    b.copy(RESULT, t).exit();
    b.finish().unwrap()
}

/// Four shapes through one site, filling the cache chain
fn polymorphic_get() -> StaticCode {
    let mut b = CodeBuilder::program();
    let one = b.temp();
    let objects = [b.temp(), b.temp(), b.temp(), b.temp()];
    let (t, sum) = (b.temp(), b.temp());
    b.load_int(one, 1).load_int(sum, 0);
    b.new_object_literal(objects[0], &[("k", one)])
        .new_object_literal(objects[1], &[("a", one), ("k", one)])
        .new_object_literal(objects[2], &[("a", one), ("b", one), ("k", one)])
        .new_object_literal(objects[3], &[("a", one), ("b", one), ("c", one), ("k", one)]);
    looped(&mut b, |b| {
        for object in objects {
            b.get_named(t, object, "k").add(sum, sum, t);
        }
    });
    b.copy(RESULT, sum).exit();
    b.finish().unwrap()
}

/// Property found on the prototype chain
fn prototype_get() -> StaticCode {
    let mut b = CodeBuilder::program();
    let (arr, t) = (b.temp(), b.temp());
    b.new_array(arr, 0);
    looped(&mut b, |b| {
        b.get_named(t, arr, "push");
    });
    b.exit();
    b.finish().unwrap()
}

/// Declared global variable read and write
fn global_access() -> StaticCode {
    let mut b = CodeBuilder::program();
    let t = b.temp();
    looped(&mut b, |b| {
        b.get_global(t, "g").put_global("g", t);
    });
    b.exit();
    b.finish().unwrap()
}

/// Interpreted call and return
fn calls() -> StaticCode {
    let mut f = CodeBuilder::function("id", &["x"]);
    let x = f.formal(0);
    f.return_value(x);
    let id = f.finish().unwrap();

    let mut b = CodeBuilder::program();
    let function = b.temp();
    let loop_counters = counters(&mut b);
    let frame = b.call_frame(1);
    b.new_function(function, id, &[]);
    looped_with(&mut b, loop_counters, |b| {
        b.load_undefined(frame)
            .copy(at(frame, 1), function)
            .load_int(at(frame, 2), 3)
            .call(frame, 1);
    });
    b.exit();
    b.finish().unwrap()
}

fn bench_property_access(c: &mut Criterion) {
    bench_program(c, "get_named_monomorphic", monomorphic_get());
    bench_program(c, "get_named_polymorphic", polymorphic_get());
    bench_program(c, "get_named_prototype", prototype_get());
}

fn bench_globals_and_calls(c: &mut Criterion) {
    bench_program(c, "global_read_write", global_access());
    bench_program(c, "interpreted_call", calls());
}

criterion_group!(benches, bench_property_access, bench_globals_and_calls);
criterion_main!(benches);
