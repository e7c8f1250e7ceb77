//! Int32 fast paths checked against plain `f64` arithmetic

use proptest::prelude::*;
use tern_vm_bytecode::{CodeBuilder, Opcode, Register};
use tern_vm_core::{Runtime, Value};

const RESULT: Register = Register(0);

fn evaluate(op: Opcode, x: Value, y: Value) -> Value {
    let mut b = CodeBuilder::program();
    let (l, r) = (b.temp(), b.temp());
    let load = |b: &mut CodeBuilder, reg: Register, value: &Value| match value {
        Value::Int32(i) => {
            b.load_int(reg, *i);
        }
        Value::Double(d) => {
            b.load_double(reg, *d);
        }
        other => panic!("unexpected operand {other:?}"),
    };
    load(&mut b, l, &x);
    load(&mut b, r, &y);
    b.binary(op, RESULT, l, r).exit();

    let mut rt = Runtime::new().unwrap();
    let ctx = rt.create_context();
    let program = rt.load(b.finish().unwrap()).unwrap();
    rt.run(ctx, &program).unwrap().value().cloned().unwrap_or_default()
}

fn reference(op: Opcode, x: f64, y: f64) -> Value {
    let (ix, iy) = (x as i32, y as i32);
    let shift = (y as i64 as u32) & 31;
    match op {
        Opcode::Add => Value::number(x + y),
        Opcode::Sub => Value::number(x - y),
        Opcode::Mul => Value::number(x * y),
        Opcode::Div => Value::number(x / y),
        Opcode::Rem => Value::number(x % y),
        Opcode::BitAnd => Value::Int32(ix & iy),
        Opcode::BitOr => Value::Int32(ix | iy),
        Opcode::BitXor => Value::Int32(ix ^ iy),
        Opcode::Shl => Value::Int32(ix.wrapping_shl(shift)),
        Opcode::Shr => Value::Int32(ix >> shift),
        Opcode::ShrU => Value::number(((ix as u32) >> shift) as f64),
        other => panic!("no reference for {other:?}"),
    }
}

fn operator() -> impl Strategy<Value = Opcode> {
    prop::sample::select(vec![
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Rem,
        Opcode::BitAnd,
        Opcode::BitOr,
        Opcode::BitXor,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::ShrU,
    ])
}

fn int_operand() -> impl Strategy<Value = i32> {
    prop_oneof![
        any::<i32>(),
        -50_000i32..50_000,
        Just(0),
        Just(-1),
        Just(i32::MIN),
        Just(i32::MAX),
        Just(46_341),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_int32_operands_match_double_arithmetic(op in operator(), x in int_operand(), y in int_operand()) {
        let actual = evaluate(op, Value::Int32(x), Value::Int32(y));
        let expected = reference(op, x as f64, y as f64);
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn test_mixed_operands_match_double_arithmetic(
        op in prop::sample::select(vec![Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div]),
        x in int_operand(),
        y in -1.0e6f64..1.0e6,
    ) {
        let actual = evaluate(op, Value::Int32(x), Value::Double(y));
        let expected = reference(op, x as f64, y);
        prop_assert_eq!(actual, expected);
    }
}

#[test]
fn test_division_edge_cases() {
    let cases = [
        (i32::MIN, -1, 2147483648.0),
        (1, 0, f64::INFINITY),
        (-1, 0, f64::NEG_INFINITY),
        (7, 2, 3.5),
    ];
    for (x, y, expected) in cases {
        let actual = evaluate(Opcode::Div, Value::Int32(x), Value::Int32(y));
        assert_eq!(actual, Value::number(expected), "{x} / {y}");
    }
    let zero_over_negative = evaluate(Opcode::Div, Value::Int32(0), Value::Int32(-3));
    assert_eq!(zero_over_negative, Value::Double(-0.0));
    let nan = evaluate(Opcode::Rem, Value::Int32(5), Value::Int32(0));
    assert!(nan.as_number().unwrap().is_nan());
}
