//! Arithmetic, conversions and comparisons
//!
//! Int32 operands stay on a fast path that keeps results in `Int32` while
//! they fit. An int32 overflow is reported to the code instance so native
//! code built on int32 assumptions gets regenerated. Operands that need
//! ToPrimitive count as slow cases.

use std::cmp::Ordering;

use tern_vm_bytecode::Opcode;

use crate::code::FormatStringCache;
use crate::convert::{
    compare_strings, primitive_to_number, primitive_to_string, primitive_type_of, string_to_number,
    to_int32,
};
use crate::error::{VmError, VmResult};
use crate::frame::FrameType;
use crate::interpreter::{Inst, Interpreter, bad_operand};
use crate::value::{JsString, Value};

/// Preferred type for ToPrimitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// No preference; `valueOf` first
    Default,
    /// `valueOf` first
    Number,
    /// `toString` first
    String,
}

#[inline]
fn number_of(value: &Value) -> Option<f64> {
    value.as_number()
}

/// Int32 result of `x op y` when it is exact and not `-0`
fn int32_arithmetic(op: Opcode, x: i32, y: i32) -> Option<i32> {
    match op {
        Opcode::Sub => x.checked_sub(y),
        Opcode::Mul => {
            // Both factors below sqrt(2^31) keeps the product in range.
            const LIMIT: u32 = 46341;
            if x.unsigned_abs() >= LIMIT || y.unsigned_abs() >= LIMIT {
                return None;
            }
            let product = x * y;
            (product != 0 || (x >= 0 && y >= 0)).then_some(product)
        }
        Opcode::Div => {
            if y == 0 || (x == i32::MIN && y == -1) || (x == 0 && y < 0) || x % y != 0 {
                return None;
            }
            Some(x / y)
        }
        Opcode::Rem => (x >= 0 && y != 0).then(|| x % y),
        _ => None,
    }
}

fn float_arithmetic(op: Opcode, x: f64, y: f64) -> f64 {
    match op {
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        Opcode::Div => x / y,
        _ => x % y,
    }
}

fn outside_int32(n: f64) -> bool {
    n.fract() == 0.0 && (n > i32::MAX as f64 || n < i32::MIN as f64)
}

/// Strict equality
pub fn strict_equals(x: &Value, y: &Value) -> bool {
    if let (Some(a), Some(b)) = (number_of(x), number_of(y)) {
        return a == b;
    }
    match (x, y) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => a == b,
        (Value::Boxed(a), Value::Boxed(b)) => a == b,
        _ => false,
    }
}

fn concat(a: &str, b: &str) -> JsString {
    let mut s = String::with_capacity(a.len() + b.len());
    s.push_str(a);
    s.push_str(b);
    JsString::from(s)
}

impl Interpreter<'_> {
    // ==================== Conversions ====================

    /// ToPrimitive; may call `valueOf` and `toString`
    pub fn to_primitive(&mut self, value: &Value, hint: Hint) -> VmResult<Value> {
        let Value::Object(handle) = value else {
            return Ok(value.clone());
        };
        let order = match hint {
            Hint::String => ["toString", "valueOf"],
            Hint::Default | Hint::Number => ["valueOf", "toString"],
        };
        for name in order {
            let method = self.get_named(*handle, name)?;
            if !self.rt.space.is_callable(&method) {
                continue;
            }
            let result = self.call_function_as(&method, value.clone(), &[], FrameType::ViaToPrimitive)?;
            if !result.is_object() {
                return Ok(result);
            }
        }
        Err(VmError::type_error("Cannot convert object to primitive value"))
    }

    /// ToNumber
    pub fn to_number(&mut self, value: &Value) -> VmResult<f64> {
        if let Some(n) = primitive_to_number(value) {
            return Ok(n);
        }
        let primitive = self.to_primitive(value, Hint::Number)?;
        primitive_to_number(&primitive).ok_or_else(|| VmError::internal("ToPrimitive returned an object"))
    }

    /// ToString
    pub fn to_string(&mut self, value: &Value) -> VmResult<JsString> {
        if let Some(s) = primitive_to_string(value) {
            return Ok(s);
        }
        let primitive = self.to_primitive(value, Hint::String)?;
        primitive_to_string(&primitive).ok_or_else(|| VmError::internal("ToPrimitive returned an object"))
    }

    /// `typeof`
    pub fn type_of(&self, value: &Value) -> &'static str {
        match value {
            Value::Object(_) if self.rt.space.is_callable(value) => "function",
            other => primitive_type_of(other),
        }
    }

    /// `ToNumber dst src`
    pub(crate) fn op_to_number(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, src, _, _] = inst.a;
        let value = self.get(src)?;
        if value.is_number() {
            return self.set(dst, value);
        }
        if value.is_object() {
            self.slow_case(inst)?;
        }
        let n = self.to_number(&value)?;
        self.set(dst, Value::number(n))
    }

    /// `ToString dst src cache`: numbers go through the site's format cache
    pub(crate) fn op_to_string(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, src, site, _] = inst.a;
        let value = self.get(src)?;
        let result = match &value {
            Value::String(_) => value.clone(),
            Value::Int32(_) | Value::Double(_) => {
                let code = self.code_handle()?;
                let instance = self.rt.space.code_mut(code)?;
                let cache = instance
                    .format_caches
                    .get_mut(site as usize)
                    .ok_or_else(|| bad_operand(inst))?;
                match cache {
                    Some(entry) if entry.from.same_value(&value) => Value::String(entry.to.clone()),
                    _ => {
                        let text = primitive_to_string(&value).unwrap_or_default();
                        *cache = Some(FormatStringCache {
                            from: value.clone(),
                            to: text.clone(),
                        });
                        Value::String(text)
                    }
                }
            }
            Value::Object(_) => {
                self.slow_case(inst)?;
                Value::String(self.to_string(&value)?)
            }
            _ => Value::String(self.to_string(&value)?),
        };
        self.set(dst, result)
    }

    // ==================== Arithmetic ====================

    /// `Add dst lhs rhs` and `AddImm dst lhs imm`
    pub(crate) fn op_add(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, l, r, _] = inst.a;
        let lhs = self.get(l)?;
        let rhs = if inst.op == Opcode::AddImm {
            Value::Int32(r as i32)
        } else {
            self.get(r)?
        };
        self.profile_operand(inst, 1, &lhs);
        if inst.op == Opcode::Add {
            self.profile_operand(inst, 2, &rhs);
        }

        let result = match (&lhs, &rhs) {
            (Value::Int32(x), Value::Int32(y)) => match x.checked_add(*y) {
                Some(sum) => Value::Int32(sum),
                None => {
                    self.note_integer_overflow()?;
                    Value::Double(*x as f64 + *y as f64)
                }
            },
            (Value::String(x), Value::String(y)) => Value::String(concat(x, y)),
            _ => match (number_of(&lhs), number_of(&rhs)) {
                (Some(x), Some(y)) => Value::number(x + y),
                _ => {
                    self.slow_case(inst)?;
                    self.add_slow(&lhs, &rhs)?
                }
            },
        };
        self.set(dst, result)
    }

    fn add_slow(&mut self, lhs: &Value, rhs: &Value) -> VmResult<Value> {
        // Both operands still sit in registers, so converting one cannot
        // free the other.
        let lhs = self.to_primitive(lhs, Hint::Default)?;
        let rhs = self.to_primitive(rhs, Hint::Default)?;
        if lhs.is_string() || rhs.is_string() {
            let (x, y) = (self.to_string(&lhs)?, self.to_string(&rhs)?);
            return Ok(Value::String(concat(&x, &y)));
        }
        Ok(Value::number(self.to_number(&lhs)? + self.to_number(&rhs)?))
    }

    /// `Sub`, `Mul`, `Div` and `Rem`
    pub(crate) fn op_arithmetic(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, l, r, _] = inst.a;
        let (lhs, rhs) = (self.get(l)?, self.get(r)?);
        self.profile_operand(inst, 1, &lhs);
        self.profile_operand(inst, 2, &rhs);

        let both_int32 = match (&lhs, &rhs) {
            (Value::Int32(x), Value::Int32(y)) => {
                if let Some(result) = int32_arithmetic(inst.op, *x, *y) {
                    return self.set(dst, Value::Int32(result));
                }
                true
            }
            _ => false,
        };
        let (x, y) = match (number_of(&lhs), number_of(&rhs)) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                self.slow_case(inst)?;
                let x = self.to_number(&lhs)?;
                (x, self.to_number(&rhs)?)
            }
        };
        let result = float_arithmetic(inst.op, x, y);
        if both_int32 && matches!(inst.op, Opcode::Sub | Opcode::Mul) && outside_int32(result) {
            self.note_integer_overflow()?;
        }
        self.set(dst, Value::number(result))
    }

    /// Bitwise and shift operators
    pub(crate) fn op_bitwise(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, l, r, _] = inst.a;
        let (lhs, rhs) = (self.get(l)?, self.get(r)?);
        let (x, y) = match (lhs.as_int32(), rhs.as_int32()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                if !(lhs.is_number() && rhs.is_number()) {
                    self.slow_case(inst)?;
                }
                let x = to_int32(self.to_number(&lhs)?);
                (x, to_int32(self.to_number(&rhs)?))
            }
        };
        let shift = (y as u32) & 31;
        let result = match inst.op {
            Opcode::BitAnd => Value::Int32(x & y),
            Opcode::BitOr => Value::Int32(x | y),
            Opcode::BitXor => Value::Int32(x ^ y),
            Opcode::Shl => Value::Int32(x.wrapping_shl(shift)),
            Opcode::Shr => Value::Int32(x >> shift),
            Opcode::ShrU => Value::number(f64::from((x as u32) >> shift)),
            _ => return Err(bad_operand(inst)),
        };
        self.set(dst, result)
    }

    /// `Neg dst src`
    pub(crate) fn op_negate(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, src, _, _] = inst.a;
        let value = self.get(src)?;
        let result = match value {
            Value::Int32(0) => Value::Double(-0.0),
            Value::Int32(i32::MIN) => Value::Double(2147483648.0),
            Value::Int32(i) => Value::Int32(-i),
            Value::Double(d) => Value::number(-d),
            other => {
                self.slow_case(inst)?;
                Value::number(-self.to_number(&other)?)
            }
        };
        self.set(dst, result)
    }

    /// `Inc reg` and `Dec reg`
    pub(crate) fn op_increment(&mut self, inst: Inst) -> VmResult<()> {
        let [reg, _, _, _] = inst.a;
        let delta = if inst.op == Opcode::Inc { 1 } else { -1 };
        let value = self.get(reg)?;
        let result = match value {
            Value::Int32(i) => match i.checked_add(delta) {
                Some(next) => Value::Int32(next),
                None => {
                    self.note_integer_overflow()?;
                    Value::Double(i as f64 + delta as f64)
                }
            },
            Value::Double(d) => Value::number(d + delta as f64),
            other => {
                self.slow_case(inst)?;
                Value::number(self.to_number(&other)? + delta as f64)
            }
        };
        self.set(reg, result)
    }

    // ==================== Comparisons ====================

    /// Equality and relational operators; the result goes to the implicit flag
    pub(crate) fn op_compare(&mut self, inst: Inst) -> VmResult<()> {
        let [l, r, _, _] = inst.a;
        let (lhs, rhs) = (self.get(l)?, self.get(r)?);
        self.profile_operand(inst, 0, &lhs);
        self.profile_operand(inst, 1, &rhs);

        if let (Value::Int32(x), Value::Int32(y)) = (&lhs, &rhs) {
            let ordering = x.cmp(y);
            self.ctx.implicit_bool = match inst.op {
                Opcode::Eq | Opcode::StrictEq => ordering == Ordering::Equal,
                Opcode::Neq | Opcode::StrictNeq => ordering != Ordering::Equal,
                Opcode::Lt => ordering == Ordering::Less,
                Opcode::Lte => ordering != Ordering::Greater,
                Opcode::Gt => ordering == Ordering::Greater,
                Opcode::Gte => ordering != Ordering::Less,
                _ => return Err(bad_operand(inst)),
            };
            return Ok(());
        }

        let needs_conversion = !matches!(inst.op, Opcode::StrictEq | Opcode::StrictNeq)
            && (lhs.is_object() || rhs.is_object());
        if needs_conversion {
            self.slow_case(inst)?;
        }
        self.ctx.implicit_bool = match inst.op {
            Opcode::StrictEq => strict_equals(&lhs, &rhs),
            Opcode::StrictNeq => !strict_equals(&lhs, &rhs),
            Opcode::Eq => self.loose_equals(&lhs, &rhs)?,
            Opcode::Neq => !self.loose_equals(&lhs, &rhs)?,
            Opcode::Lt => self.less_than(&lhs, &rhs, true)? == Some(true),
            Opcode::Gt => self.less_than(&rhs, &lhs, false)? == Some(true),
            Opcode::Lte => self.less_than(&rhs, &lhs, false)? == Some(false),
            Opcode::Gte => self.less_than(&lhs, &rhs, true)? == Some(false),
            _ => return Err(bad_operand(inst)),
        };
        Ok(())
    }

    /// Abstract equality
    pub fn loose_equals(&mut self, x: &Value, y: &Value) -> VmResult<bool> {
        let (mut x, mut y) = (x.clone(), y.clone());
        loop {
            if let (Some(a), Some(b)) = (number_of(&x), number_of(&y)) {
                return Ok(a == b);
            }
            let next = match (&x, &y) {
                (Value::String(a), Value::String(b)) => return Ok(a == b),
                (Value::Object(a), Value::Object(b)) => return Ok(a == b),
                (Value::Boolean(a), Value::Boolean(b)) => return Ok(a == b),
                (a, b) if a.is_null_or_undefined() || b.is_null_or_undefined() => {
                    return Ok(a.is_null_or_undefined() && b.is_null_or_undefined());
                }
                (Value::Boolean(a), _) => (Value::Int32(i32::from(*a)), y.clone()),
                (_, Value::Boolean(b)) => (x.clone(), Value::Int32(i32::from(*b))),
                (Value::String(s), b) if b.is_number() => (Value::number(string_to_number(s)), y.clone()),
                (a, Value::String(s)) if a.is_number() => (x.clone(), Value::number(string_to_number(s))),
                (Value::Object(_), b) if b.is_number() || b.is_string() => {
                    (self.to_primitive(&x, Hint::Default)?, y.clone())
                }
                (a, Value::Object(_)) if a.is_number() || a.is_string() => {
                    (x.clone(), self.to_primitive(&y, Hint::Default)?)
                }
                _ => return Ok(false),
            };
            x = next.0;
            y = next.1;
        }
    }

    /// Abstract relational comparison `x < y`; `None` when either side is NaN
    pub fn less_than(&mut self, x: &Value, y: &Value, left_first: bool) -> VmResult<Option<bool>> {
        let (px, py) = if left_first {
            let px = self.to_primitive(x, Hint::Number)?;
            (px, self.to_primitive(y, Hint::Number)?)
        } else {
            let py = self.to_primitive(y, Hint::Number)?;
            (self.to_primitive(x, Hint::Number)?, py)
        };
        if let (Value::String(a), Value::String(b)) = (&px, &py) {
            return Ok(Some(compare_strings(a, b) == Ordering::Less));
        }
        let (a, b) = (self.to_number(&px)?, self.to_number(&py)?);
        if a.is_nan() || b.is_nan() {
            return Ok(None);
        }
        Ok(Some(a < b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_multiply_stays_exact() {
        assert_eq!(int32_arithmetic(Opcode::Mul, 46340, 46340), Some(2147395600));
        assert_eq!(int32_arithmetic(Opcode::Mul, 46341, 2), None);
        assert_eq!(int32_arithmetic(Opcode::Mul, i32::MIN, 1), None);
        // -0 has no int32 form.
        assert_eq!(int32_arithmetic(Opcode::Mul, 0, -5), None);
        assert_eq!(int32_arithmetic(Opcode::Mul, -3, 4), Some(-12));
    }

    #[test]
    fn test_int32_divide_only_when_exact() {
        assert_eq!(int32_arithmetic(Opcode::Div, 6, 3), Some(2));
        assert_eq!(int32_arithmetic(Opcode::Div, 7, 2), None);
        assert_eq!(int32_arithmetic(Opcode::Div, 1, 0), None);
        assert_eq!(int32_arithmetic(Opcode::Div, 0, -1), None);
        assert_eq!(int32_arithmetic(Opcode::Div, i32::MIN, -1), None);
    }

    #[test]
    fn test_int32_remainder_keeps_dividend_sign() {
        assert_eq!(int32_arithmetic(Opcode::Rem, 7, -3), Some(1));
        assert_eq!(int32_arithmetic(Opcode::Rem, -7, 3), None);
        assert_eq!(float_arithmetic(Opcode::Rem, -7.0, 3.0), -1.0);
        assert!(float_arithmetic(Opcode::Rem, -4.0, 2.0).is_sign_negative());
        assert_eq!(int32_arithmetic(Opcode::Sub, i32::MIN, 1), None);
    }

    #[test]
    fn test_strict_equals_numbers_across_representations() {
        assert!(strict_equals(&Value::Int32(0), &Value::Double(-0.0)));
        assert!(!strict_equals(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
        assert!(!strict_equals(&Value::Int32(1), &Value::from("1")));
        assert!(strict_equals(&Value::Null, &Value::Null));
        assert!(!strict_equals(&Value::Null, &Value::Undefined));
    }

    #[test]
    fn test_overflow_detection() {
        assert!(outside_int32(2147483648.0));
        assert!(!outside_int32(2147483647.0));
        assert!(!outside_int32(0.5e10 + 0.5));
    }
}
