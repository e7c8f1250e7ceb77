//! Compiled code survives a serde round trip and is validated on load

use tern_vm_bytecode::{
    BytecodeError, CodeBuilder, ConstantValue, HandlerKind, Opcode, StaticCode,
};

fn sample_program() -> StaticCode {
    let mut inner = CodeBuilder::function("inner", &["x"]);
    let x = inner.formal(0);
    let t = inner.temp();
    inner.add_imm(t, x, 1).return_value(t);

    let mut b = CodeBuilder::program();
    let obj = b.temp();
    let value = b.temp();
    let exc = b.temp();
    let (start, end, handler) = (b.label(), b.label(), b.label());
    b.bind(start)
        .new_array_literal(value, &[ConstantValue::Int32(1), ConstantValue::Double(0.5)])
        .new_object_literal(obj, &[("a", value)])
        .get_named(value, obj, "a")
        .bind(end)
        .new_function(value, inner.finish().unwrap(), &[])
        .exit();
    b.bind(handler).catch(exc).exit();
    b.handler(HandlerKind::Catch, start, end, handler);
    b.finish().unwrap()
}

#[test]
fn test_json_round_trip_preserves_code() {
    let code = sample_program();
    let json = serde_json::to_string(&code).unwrap();
    let mut loaded: StaticCode = serde_json::from_str(&json).unwrap();
    loaded.find_instruction_offsets().unwrap();
    loaded.validate().unwrap();

    assert_eq!(loaded.codewords, code.codewords);
    assert_eq!(loaded.instruction_offsets, code.instruction_offsets);
    assert_eq!(loaded.exception_handlers, code.exception_handlers);
    assert_eq!(loaded.functions.len(), 1);
    assert_eq!(loaded.functions[0].display_name(), "inner");
    assert!(!loaded.is_shared());
    assert!(!loaded.profile().is_allocated());
}

#[test]
fn test_corrupt_stream_is_rejected() {
    let mut code = sample_program();
    code.codewords.push(9999);
    assert!(matches!(
        code.find_instruction_offsets(),
        Err(BytecodeError::InvalidOpcode { opcode: 9999, .. })
    ));

    let mut code = sample_program();
    code.codewords.pop();
    code.codewords.push(Opcode::Call as u32);
    assert!(matches!(
        code.find_instruction_offsets(),
        Err(BytecodeError::UnexpectedEnd)
    ));
}

#[test]
fn test_jump_into_operand_is_rejected() {
    let mut b = CodeBuilder::program();
    let r = b.temp();
    b.load_int(r, 0).exit();
    let mut code = b.finish().unwrap();
    code.codewords = vec![Opcode::Jump as u32, 1, Opcode::Exit as u32];
    code.find_instruction_offsets().unwrap();
    assert!(matches!(
        code.validate(),
        Err(BytecodeError::InvalidJumpTarget { target: 1, .. })
    ));
}
