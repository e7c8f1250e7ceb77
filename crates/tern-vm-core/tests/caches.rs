//! Inline cache behavior seen from bytecode
//!
//! Hit and miss counters come from the context's `CacheStats`; results are
//! checked against what an uncached lookup would produce.

use proptest::prelude::*;
use tern_vm_bytecode::{CodeBuilder, Opcode, Register, StaticCode};
use tern_vm_core::{CacheStats, JsString, ObjectKind, Runtime, Value, VmConfig};
use tern_vm_gc::GcRef;

const RESULT: Register = Register(0);

fn at(base: Register, offset: u32) -> Register {
    Register(base.0 + offset)
}

fn run_with_stats(rt: &mut Runtime, code: StaticCode) -> (Value, CacheStats) {
    let ctx = rt.create_context();
    let program = rt.load(code).unwrap();
    let completion = rt.run(ctx, &program).unwrap();
    let stats = rt.context(ctx).unwrap().cache_stats();
    (completion.value().cloned().unwrap_or_default(), stats)
}

/// Emit `for (i = 0; i < n; i++) body` around `body`
fn repeat(b: &mut CodeBuilder, n: i32, body: impl FnOnce(&mut CodeBuilder)) {
    let (i, limit) = (b.temp(), b.temp());
    let top = b.label();
    b.load_int(i, 0).load_int(limit, n);
    b.bind(top);
    body(b);
    b.inc(i).compare(Opcode::Lt, i, limit).jump_if_true(top);
}

/// `function getW(o) { return o.w; }`
fn get_w_function() -> StaticCode {
    let mut f = CodeBuilder::function("getW", &["o"]);
    let o = f.formal(0);
    let t = f.temp();
    f.get_named(t, o, "w").return_value(t);
    f.finish().unwrap()
}

#[test]
fn test_monomorphic_get_hits_after_first_miss() {
    let mut b = CodeBuilder::program();
    let (one, o, t) = (b.temp(), b.temp(), b.temp());
    b.load_int(one, 1).new_object_literal(o, &[("x", one), ("y", one)]);
    repeat(&mut b, 50, |b| {
        b.get_named(t, o, "y");
    });
    b.copy(RESULT, t).exit();

    let mut rt = Runtime::new().unwrap();
    let (value, stats) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(1));
    assert_eq!(stats.get_misses, 1);
    assert_eq!(stats.get_hits, 49);
}

#[test]
fn test_class_change_mid_loop_costs_one_miss() {
    // o = {x: 1}; for (i = 0; i < 1000; i++) { t = o.x; if (i === 500) o.y = 2; }
    let mut b = CodeBuilder::program();
    let (one, two, o, t) = (b.temp(), b.temp(), b.temp(), b.temp());
    let (i, limit, half) = (b.temp(), b.temp(), b.temp());
    let (top, skip) = (b.label(), b.label());
    b.load_int(one, 1)
        .load_int(two, 2)
        .new_object_literal(o, &[("x", one)])
        .load_int(i, 0)
        .load_int(limit, 1000)
        .load_int(half, 500);
    b.bind(top)
        .get_named(t, o, "x")
        .compare(Opcode::StrictEq, i, half)
        .jump_if_false(skip)
        .put_named(o, "y", two);
    b.bind(skip).inc(i).compare(Opcode::Lt, i, limit).jump_if_true(top);
    b.copy(RESULT, t).exit();

    let mut rt = Runtime::new().unwrap();
    let (value, stats) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(1));
    // One miss to fill the site, one more against the new class
    assert_eq!(stats.get_misses, 2);
    assert_eq!(stats.get_hits, 998);
}

#[test]
fn test_put_transition_is_cached() {
    let mut b = CodeBuilder::program();
    let (o, v) = (b.temp(), b.temp());
    repeat(&mut b, 10, |b| {
        b.new_object(o).load_int(v, 3).put_named(o, "z", v);
    });
    b.get_named(RESULT, o, "z").exit();

    let mut rt = Runtime::new().unwrap();
    let (value, stats) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(3));
    assert_eq!(stats.put_misses, 1);
    assert_eq!(stats.put_hits, 9);
}

#[test]
fn test_polymorphic_site_keeps_both_shapes() {
    let mut b = CodeBuilder::program();
    let (one, two, a, c, t, sum) = (b.temp(), b.temp(), b.temp(), b.temp(), b.temp(), b.temp());
    b.load_int(one, 1)
        .load_int(two, 2)
        .new_object_literal(a, &[("k", one)])
        .new_object_literal(c, &[("pad", one), ("k", two)])
        .load_int(sum, 0);
    let (site, next, done) = (b.label(), b.label(), b.label());
    let (flip, i, limit) = (b.temp(), b.temp(), b.temp());
    b.load_int(i, 0).load_int(limit, 20);
    // Alternate receivers through one get site
    b.bind(site);
    b.copy(flip, a).binary(Opcode::BitAnd, t, i, one).condition(t).jump_if_false(next);
    b.copy(flip, c);
    b.bind(next)
        .get_named(t, flip, "k")
        .add(sum, sum, t)
        .inc(i)
        .compare(Opcode::Lt, i, limit)
        .jump_if_true(site);
    b.bind(done).copy(RESULT, sum).exit();

    let mut rt = Runtime::new().unwrap();
    let (value, stats) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(30));
    assert_eq!(stats.get_misses, 2);
    assert_eq!(stats.get_hits, 18);
}

#[test]
fn test_prototype_change_invalidates_negative_entry() {
    // function C() {}
    let mut f = CodeBuilder::function("C", &[]);
    f.return_no_value();
    let ctor = f.finish().unwrap();

    let mut b = CodeBuilder::program();
    let (c, proto, getter, five, o) = (b.temp(), b.temp(), b.temp(), b.temp(), b.temp());
    let frame = b.call_frame(1);
    b.new_function(c, ctor, &[])
        .get_named(proto, c, "prototype")
        .new_function(getter, get_w_function(), &[]);
    b.load_undefined(frame).copy(at(frame, 1), c).construct(frame, 0).copy(o, frame);

    let call_getter = |b: &mut CodeBuilder| {
        b.load_undefined(frame)
            .copy(at(frame, 1), getter)
            .copy(at(frame, 2), o)
            .call(frame, 1);
    };
    call_getter(&mut b);
    b.put_global("first", frame);
    call_getter(&mut b);
    b.put_global("second", frame);
    b.load_int(five, 5).put_named(proto, "w", five);
    call_getter(&mut b);
    b.copy(RESULT, frame).exit();

    let mut rt = Runtime::new().unwrap();
    let (value, _) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(5));
    assert_eq!(rt.get_global("first").unwrap(), Value::Undefined);
    assert_eq!(rt.get_global("second").unwrap(), Value::Undefined);
}

#[test]
fn test_shadowing_own_property_wins_over_cached_prototype_hit() {
    let mut f = CodeBuilder::function("C", &[]);
    f.return_no_value();
    let ctor = f.finish().unwrap();

    let mut b = CodeBuilder::program();
    let (c, proto, getter, v) = (b.temp(), b.temp(), b.temp(), b.temp());
    let o = b.temp();
    let frame = b.call_frame(1);
    b.new_function(c, ctor, &[])
        .get_named(proto, c, "prototype")
        .load_string(v, "proto")
        .put_named(proto, "w", v)
        .new_function(getter, get_w_function(), &[]);
    b.load_undefined(frame).copy(at(frame, 1), c).construct(frame, 0).copy(o, frame);

    for _ in 0..2 {
        b.load_undefined(frame)
            .copy(at(frame, 1), getter)
            .copy(at(frame, 2), o)
            .call(frame, 1);
    }
    b.load_string(v, "own").put_named(o, "w", v);
    b.load_undefined(frame)
        .copy(at(frame, 1), getter)
        .copy(at(frame, 2), o)
        .call(frame, 1)
        .copy(RESULT, frame)
        .exit();

    let mut rt = Runtime::new().unwrap();
    let (value, _) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::string("own"));
}

#[test]
fn test_global_variable_cache() {
    let mut rt = Runtime::new().unwrap();
    rt.declare_global("counter", Value::Int32(0)).unwrap();

    let mut b = CodeBuilder::program();
    let t = b.temp();
    repeat(&mut b, 25, |b| {
        b.get_global(t, "counter").inc(t).put_global("counter", t);
    });
    b.get_global(RESULT, "counter").exit();

    let (value, stats) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(25));
    assert_eq!(rt.get_global("counter").unwrap(), Value::Int32(25));
    assert!(stats.global_hits >= 48, "{stats:?}");
    assert!(stats.global_misses <= 3, "{stats:?}");
}

#[test]
fn test_array_length_is_not_cached_as_property() {
    let mut b = CodeBuilder::program();
    let (arr, t, v) = (b.temp(), b.temp(), b.temp());
    let frame = b.call_frame(1);
    b.new_array(arr, 0);
    repeat(&mut b, 3, |b| {
        b.get_named(t, arr, "length");
        b.copy(frame, arr)
            .get_named(at(frame, 1), arr, "push")
            .load_int(v, 9)
            .copy(at(frame, 2), v)
            .call(frame, 1);
    });
    b.get_named(RESULT, arr, "length").exit();

    let mut rt = Runtime::new().unwrap();
    let (value, _) = run_with_stats(&mut rt, b.finish().unwrap());
    assert_eq!(value, Value::Int32(3));
}

// ==================== Cached versus uncached lookups ====================

const NAMES: [&str; 4] = ["a", "b", "c", "d"];
/// Three receivers, then the inner and outer prototypes
const OBJECTS: usize = 5;

#[derive(Debug, Clone)]
enum Step {
    Get { object: usize, name: usize },
    Put { object: usize, name: usize, value: i32 },
    Delete { object: usize, name: usize },
    /// Add `count` filler properties, pushing the object toward dictionary mode
    Grow { object: usize, count: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..OBJECTS, 0..NAMES.len()).prop_map(|(object, name)| Step::Get { object, name }),
        3 => (0..OBJECTS, 0..NAMES.len(), -3i32..3)
            .prop_map(|(object, name, value)| Step::Put { object, name, value }),
        1 => (0..OBJECTS, 0..NAMES.len()).prop_map(|(object, name)| Step::Delete { object, name }),
        1 => (0..OBJECTS, 1usize..6).prop_map(|(object, count)| Step::Grow { object, count }),
    ]
}

fn filler(k: usize) -> String {
    format!("f{k}")
}

/// Receivers 0 and 1 inherit from `inner`, receiver 2 from `outer`, and
/// `inner` from `outer`. Each is published as global `o<N>`.
fn setup(rt: &mut Runtime) -> Vec<GcRef> {
    let root = rt.intrinsics().object_prototype;
    let space = rt.space_mut();
    let outer = space.alloc_object(Some(root), ObjectKind::Ordinary).unwrap();
    let inner = space.alloc_object(Some(outer), ObjectKind::Ordinary).unwrap();
    let objects = vec![
        space.alloc_object(Some(inner), ObjectKind::Ordinary).unwrap(),
        space.alloc_object(Some(inner), ObjectKind::Ordinary).unwrap(),
        space.alloc_object(Some(outer), ObjectKind::Ordinary).unwrap(),
        inner,
        outer,
    ];
    for (k, &object) in objects.iter().enumerate() {
        rt.declare_global(&format!("o{k}"), Value::Object(object)).unwrap();
    }
    objects
}

fn runtime(dictionary_threshold: usize, chain_limit: usize) -> Runtime {
    let config = VmConfig {
        dictionary_threshold,
        ..VmConfig::default()
    };
    Runtime::with_config(config.cache_chain_limit(chain_limit)).unwrap()
}

/// Run `steps` `rounds` times through GetN/PutN/DeleteN sites, collecting
/// every read into an array
fn cached_program(steps: &[Step], rounds: i32) -> StaticCode {
    let mut b = CodeBuilder::program();
    let objects: Vec<Register> = (0..OBJECTS).map(|_| b.temp()).collect();
    let (results, index, t) = (b.temp(), b.temp(), b.temp());
    for (k, &object) in objects.iter().enumerate() {
        b.get_global(object, &format!("o{k}"));
    }
    b.new_array(results, 0).load_int(index, 0);
    repeat(&mut b, rounds, |b| {
        for step in steps {
            match *step {
                Step::Get { object, name } => {
                    b.get_named(t, objects[object], NAMES[name])
                        .put(results, index, t)
                        .inc(index);
                }
                Step::Put { object, name, value } => {
                    b.load_int(t, value).put_named(objects[object], NAMES[name], t);
                }
                Step::Delete { object, name } => {
                    b.delete_named(t, objects[object], NAMES[name]);
                }
                Step::Grow { object, count } => {
                    for k in 0..count {
                        b.load_int(t, k as i32).put_named(objects[object], &filler(k), t);
                    }
                }
            }
        }
    });
    b.copy(RESULT, results).exit();
    b.finish().unwrap()
}

/// The same reads and writes straight through the object space
fn uncached_reads(rt: &mut Runtime, objects: &[GcRef], steps: &[Step], rounds: i32) -> Vec<Value> {
    let mut reads = Vec::new();
    for _ in 0..rounds {
        for step in steps {
            match *step {
                Step::Get { object, name } => {
                    reads.push(rt.space().get_l(objects[object], NAMES[name]).unwrap().value);
                }
                Step::Put { object, name, value } => {
                    let name = JsString::from(NAMES[name]);
                    rt.space_mut().put_l(objects[object], &name, Value::Int32(value)).unwrap();
                }
                Step::Delete { object, name } => {
                    rt.space_mut().delete_l(objects[object], NAMES[name]).unwrap();
                }
                Step::Grow { object, count } => {
                    for k in 0..count {
                        let name = JsString::from(filler(k));
                        rt.space_mut().put_l(objects[object], &name, Value::Int32(k as i32)).unwrap();
                    }
                }
            }
        }
    }
    reads
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cached_named_access_matches_uncached_lookup(
        steps in prop::collection::vec(step(), 1..40),
        rounds in 1i32..4,
        dictionary_threshold in 2usize..10,
        chain_limit in 1usize..5,
    ) {
        let mut cached = runtime(dictionary_threshold, chain_limit);
        let cached_objects = setup(&mut cached);
        let (array, _) = run_with_stats(&mut cached, cached_program(&steps, rounds));
        let array = array.as_object().unwrap();
        let cached_reads = cached.space().object(array).unwrap().elements().to_vec();

        let mut reference = runtime(dictionary_threshold, chain_limit);
        let reference_objects = setup(&mut reference);
        let expected = uncached_reads(&mut reference, &reference_objects, &steps, rounds);
        prop_assert_eq!(cached_reads, expected);

        let names = NAMES.iter().map(|name| name.to_string()).chain((0..6).map(filler));
        for name in names {
            for (&ours, &theirs) in cached_objects.iter().zip(&reference_objects) {
                prop_assert_eq!(
                    cached.space().get_own(ours, &name).unwrap(),
                    reference.space().get_own(theirs, &name).unwrap(),
                    "own property {}", name
                );
                prop_assert_eq!(
                    cached.space().object(ours).unwrap().is_dictionary(),
                    reference.space().object(theirs).unwrap().is_dictionary()
                );
            }
        }
    }
}
