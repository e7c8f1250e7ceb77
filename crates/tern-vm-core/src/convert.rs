//! Primitive conversions
//!
//! The conversions that never call back into script. ToPrimitive on
//! objects, and everything built on it, lives in the interpreter.

use std::cmp::Ordering;

use crate::value::{JsString, Value};

/// ToBoolean
#[inline]
pub fn to_boolean(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Int32(i) => *i != 0,
        Value::Double(d) => !(*d == 0.0 || d.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Object(_) => true,
        Value::Boxed(_) => false,
    }
}

/// ToNumber for primitives; `None` for objects
pub fn primitive_to_number(value: &Value) -> Option<f64> {
    Some(match value {
        Value::Undefined | Value::Boxed(_) => f64::NAN,
        Value::Null => 0.0,
        Value::Boolean(b) => f64::from(u8::from(*b)),
        Value::Int32(i) => *i as f64,
        Value::Double(d) => *d,
        Value::String(s) => string_to_number(s),
        Value::Object(_) => return None,
    })
}

/// ToString for primitives; `None` for objects
pub fn primitive_to_string(value: &Value) -> Option<JsString> {
    Some(match value {
        Value::Undefined => JsString::from("undefined"),
        Value::Null => JsString::from("null"),
        Value::Boolean(true) => JsString::from("true"),
        Value::Boolean(false) => JsString::from("false"),
        Value::Int32(i) => JsString::from(itoa::Buffer::new().format(*i)),
        Value::Double(d) => JsString::from(number_to_string(*d)),
        Value::String(s) => s.clone(),
        Value::Boxed(_) => JsString::from(""),
        Value::Object(_) => return None,
    })
}

fn is_js_whitespace(c: char) -> bool {
    c.is_whitespace() || c == '\u{feff}'
}

/// StringToNumber
pub fn string_to_number(s: &str) -> f64 {
    let s = s.trim_matches(is_js_whitespace);
    if s.is_empty() {
        return 0.0;
    }
    let radix = match s.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let digits = &s[2..];
        if digits.is_empty() {
            return f64::NAN;
        }
        let mut result = 0.0f64;
        for c in digits.chars() {
            match c.to_digit(radix) {
                Some(d) => result = result * radix as f64 + d as f64,
                None => return f64::NAN,
            }
        }
        return result;
    }
    let (sign, unsigned) = match s.as_bytes()[0] {
        b'-' => (-1.0, &s[1..]),
        b'+' => (1.0, &s[1..]),
        _ => (1.0, s),
    };
    if unsigned == "Infinity" {
        return sign * f64::INFINITY;
    }
    if !is_decimal_literal(unsigned) {
        return f64::NAN;
    }
    unsigned.parse::<f64>().map_or(f64::NAN, |n| sign * n)
}

/// `digits [. digits] [e [+-] digits]` with at least one mantissa digit
fn is_decimal_literal(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut mantissa_digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return false;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exponent_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exponent_start {
            return false;
        }
    }
    i == bytes.len()
}

/// Number::toString(10)
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n < 0.0 {
        return format!("-{}", number_to_string(-n));
    }
    if n.fract() == 0.0 && n < 1e21 && n <= i64::MAX as f64 {
        return itoa::Buffer::new().format(n as i64).to_string();
    }

    // Shortest round-trip digits, re-laid out per Number::toString.
    let mut buffer = ryu::Buffer::new();
    let shortest = buffer.format_finite(n);
    let (mantissa, exponent) = match shortest.find(['e', 'E']) {
        Some(at) => (&shortest[..at], shortest[at + 1..].parse::<i32>().unwrap_or(0)),
        None => (shortest, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let mut digits: String = format!("{int_part}{frac_part}");
    let mut point = int_part.len() as i32 + exponent;
    let leading = digits.len() - digits.trim_start_matches('0').len();
    digits.drain(..leading);
    point -= leading as i32;
    let trimmed = digits.trim_end_matches('0').len();
    digits.truncate(trimmed);

    let k = digits.len() as i32;
    let n = point;
    if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        format!("{}.{}", &digits[..n as usize], &digits[n as usize..])
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let e = n - 1;
        let sign = if e < 0 { '-' } else { '+' };
        if k == 1 {
            format!("{digits}e{sign}{}", e.abs())
        } else {
            format!("{}.{}e{sign}{}", &digits[..1], &digits[1..], e.abs())
        }
    }
}

/// ToInt32 of a number
#[inline]
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let n = n.trunc();
    if n >= i32::MIN as f64 && n <= i32::MAX as f64 {
        return n as i32;
    }
    let modulo = n.rem_euclid(4294967296.0);
    if modulo >= 2147483648.0 {
        (modulo - 4294967296.0) as i32
    } else {
        modulo as i32
    }
}

/// ToUint32 of a number
#[inline]
pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// Code-unit order of two strings
pub fn compare_strings(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// `typeof` for a non-object value
pub fn primitive_type_of(value: &Value) -> &'static str {
    match value {
        Value::Undefined | Value::Boxed(_) => "undefined",
        Value::Null | Value::Object(_) => "object",
        Value::Boolean(_) => "boolean",
        Value::Int32(_) | Value::Double(_) => "number",
        Value::String(_) => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_to_string() {
        let cases = [
            (0.5, "0.5"),
            (123.456, "123.456"),
            (1e21, "1e+21"),
            (1.5e-7, "1.5e-7"),
            (1e-6, "0.000001"),
            (123456789012.0, "123456789012"),
            (2147483648.0, "2147483648"),
            (-2.5, "-2.5"),
            (-0.0, "0"),
            (f64::NAN, "NaN"),
            (f64::NEG_INFINITY, "-Infinity"),
            (1.2345e25, "1.2345e+25"),
            (0.1 + 0.2, "0.30000000000000004"),
        ];
        for (n, expected) in cases {
            assert_eq!(number_to_string(n), expected, "formatting {n}");
        }
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number("  42  "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1F"), 31.0);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert_eq!(string_to_number(".5"), 0.5);
        assert_eq!(string_to_number("1e3"), 1000.0);
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("0x").is_nan());
        assert!(string_to_number("1e").is_nan());
    }

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(4294967297.0), 1);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_uint32(-1.0), 4294967295);
    }

    #[test]
    fn test_to_boolean_and_type_of() {
        assert!(!to_boolean(&Value::Double(f64::NAN)));
        assert!(!to_boolean(&Value::Double(-0.0)));
        assert!(to_boolean(&Value::from("0")));
        assert!(!to_boolean(&Value::from("")));
        assert_eq!(primitive_type_of(&Value::Null), "object");
        assert_eq!(primitive_type_of(&Value::Double(1.5)), "number");
    }

    #[test]
    fn test_compare_strings_by_code_unit() {
        assert_eq!(compare_strings("a", "b"), Ordering::Less);
        assert_eq!(compare_strings("ab", "a"), Ordering::Greater);
        // U+FF61 sorts above a surrogate pair in UTF-16 order.
        assert_eq!(compare_strings("\u{ff61}", "\u{1f600}"), Ordering::Greater);
    }
}
