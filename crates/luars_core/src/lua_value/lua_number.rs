// Numeric semantics shared by the dispatch loop, the API and the table
// engine: float/integer conversion, raw arithmetic, exact mixed comparison
// and string <-> number conversion.

use crate::lua_value::LuaValue;

/// Rounding mode for float -> integer conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F2I {
    /// Only accept integral values
    Eq,
    Floor,
    Ceil,
}

const TWO_POW_63: f64 = 9223372036854775808.0;

/// Converts a float to an integer; fails for values outside the i64 range,
/// NaN, and (in `Eq` mode) non-integral values.
#[inline]
pub fn float_to_integer(n: f64, mode: F2I) -> Option<i64> {
    let f = match mode {
        F2I::Eq => {
            let f = n.floor();
            if f != n {
                return None;
            }
            f
        }
        F2I::Floor => n.floor(),
        F2I::Ceil => n.ceil(),
    };
    if f >= -TWO_POW_63 && f < TWO_POW_63 {
        Some(f as i64)
    } else {
        None
    }
}

/// Arithmetic and bitwise operators, numbered like `LUA_OPADD`..`LUA_OPBNOT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Mod = 3,
    Pow = 4,
    Div = 5,
    IDiv = 6,
    BAnd = 7,
    BOr = 8,
    BXor = 9,
    Shl = 10,
    Shr = 11,
    Unm = 12,
    BNot = 13,
}

impl ArithOp {
    pub fn from_u8(v: u8) -> Option<ArithOp> {
        use ArithOp::*;
        const ALL: [ArithOp; 14] = [
            Add, Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr, BXor, Shl, Shr, Unm, BNot,
        ];
        ALL.get(v as usize).copied()
    }

    #[inline]
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    #[inline]
    pub fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }
}

/// Integer arithmetic failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    DivideByZero,
    ModuloByZero,
}

impl ArithError {
    pub fn message(self) -> &'static str {
        match self {
            ArithError::DivideByZero => "attempt to perform 'n//0'",
            ArithError::ModuloByZero => "attempt to perform 'n%0'",
        }
    }
}

/// Floor division of integers
#[inline]
pub fn int_idiv(m: i64, n: i64) -> Result<i64, ArithError> {
    if n == 0 {
        return Err(ArithError::DivideByZero);
    }
    if n == -1 {
        // avoid overflow with MININT // -1
        return Ok(m.wrapping_neg());
    }
    let q = m / n;
    if (m ^ n) < 0 && m % n != 0 {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// Integer modulo with the sign of the divisor
#[inline]
pub fn int_mod(m: i64, n: i64) -> Result<i64, ArithError> {
    if n == 0 {
        return Err(ArithError::ModuloByZero);
    }
    if n == -1 {
        return Ok(0);
    }
    let r = m % n;
    if r != 0 && (r ^ n) < 0 {
        Ok(r + n)
    } else {
        Ok(r)
    }
}

/// Float modulo with the sign of the divisor
#[inline]
pub fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if if m > 0.0 { b < 0.0 } else { m < 0.0 && b != m } {
        m + b
    } else {
        m
    }
}

#[inline]
pub fn float_idiv(a: f64, b: f64) -> f64 {
    (a / b).floor()
}

/// Logical shift left; negative counts shift right, counts >= 64 give 0
#[inline]
pub fn shift_left(x: i64, y: i64) -> i64 {
    if y < 0 {
        if y <= -64 { 0 } else { ((x as u64) >> (-y)) as i64 }
    } else if y >= 64 {
        0
    } else {
        ((x as u64) << y) as i64
    }
}

#[inline]
pub fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<i64, ArithError> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Mod => int_mod(a, b)?,
        ArithOp::IDiv => int_idiv(a, b)?,
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => shift_left(a, b),
        ArithOp::Shr => shift_left(a, b.wrapping_neg()),
        ArithOp::Unm => a.wrapping_neg(),
        ArithOp::BNot => !a,
        // callers route Div and Pow through floats
        ArithOp::Pow | ArithOp::Div => float_arith(op, a as f64, b as f64) as i64,
    })
}

#[inline]
pub fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => {
            if b == 2.0 {
                a * a
            } else {
                a.powf(b)
            }
        }
        ArithOp::IDiv => float_idiv(a, b),
        ArithOp::Unm => -a,
        ArithOp::Mod => float_mod(a, b),
        _ => 0.0,
    }
}

/// Raw arithmetic on numbers (`luaO_rawarith`). Returns `Ok(None)` when the
/// operands are not suitable, leaving the caller to try metamethods.
pub fn raw_arith(op: ArithOp, a: &LuaValue, b: &LuaValue) -> Result<Option<LuaValue>, ArithError> {
    if op.is_bitwise() {
        match (a.as_integer(), b.as_integer()) {
            (Some(i1), Some(i2)) => Ok(Some(LuaValue::Integer(int_arith(op, i1, i2)?))),
            _ => Ok(None),
        }
    } else if matches!(op, ArithOp::Div | ArithOp::Pow) {
        match (a.as_float(), b.as_float()) {
            (Some(n1), Some(n2)) => Ok(Some(LuaValue::Float(float_arith(op, n1, n2)))),
            _ => Ok(None),
        }
    } else {
        match (a, b) {
            (LuaValue::Integer(i1), LuaValue::Integer(i2)) => {
                Ok(Some(LuaValue::Integer(int_arith(op, *i1, *i2)?)))
            }
            _ => match (a.as_float(), b.as_float()) {
                (Some(n1), Some(n2)) => Ok(Some(LuaValue::Float(float_arith(op, n1, n2)))),
                _ => Ok(None),
            },
        }
    }
}

// ============ Mixed comparisons ============

/// -2^53 <= i <= 2^53: the integer converts to float exactly
#[inline(always)]
fn int_fits_float(i: i64) -> bool {
    const MAX: u64 = 1 << 53;
    (i as u64).wrapping_add(MAX) <= 2 * MAX
}

#[inline]
fn lt_int_float(i: i64, f: f64) -> bool {
    if int_fits_float(i) {
        (i as f64) < f
    } else {
        match float_to_integer(f, F2I::Ceil) {
            Some(fi) => i < fi,
            None => f > 0.0,
        }
    }
}

#[inline]
fn le_int_float(i: i64, f: f64) -> bool {
    if int_fits_float(i) {
        (i as f64) <= f
    } else {
        match float_to_integer(f, F2I::Floor) {
            Some(fi) => i <= fi,
            None => f > 0.0,
        }
    }
}

#[inline]
fn lt_float_int(f: f64, i: i64) -> bool {
    if int_fits_float(i) {
        f < (i as f64)
    } else {
        match float_to_integer(f, F2I::Floor) {
            Some(fi) => fi < i,
            None => f < 0.0,
        }
    }
}

#[inline]
fn le_float_int(f: f64, i: i64) -> bool {
    if int_fits_float(i) {
        f <= (i as f64)
    } else {
        match float_to_integer(f, F2I::Ceil) {
            Some(fi) => fi <= i,
            None => f < 0.0,
        }
    }
}

/// `a < b` for two numbers; `None` if either is not a number
#[inline]
pub fn lt_num(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x < y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => lt_int_float(*x, *y),
        (LuaValue::Float(x), LuaValue::Float(y)) => x < y,
        (LuaValue::Float(x), LuaValue::Integer(y)) => lt_float_int(*x, *y),
        _ => return None,
    })
}

/// `a <= b` for two numbers; `None` if either is not a number
#[inline]
pub fn le_num(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x <= y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => le_int_float(*x, *y),
        (LuaValue::Float(x), LuaValue::Float(y)) => x <= y,
        (LuaValue::Float(x), LuaValue::Integer(y)) => le_float_int(*x, *y),
        _ => return None,
    })
}

// ============ String -> number ============

#[inline(always)]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| !is_space(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| !is_space(b)).map_or(start, |e| e + 1);
    &bytes[start..end]
}

fn hex_value(b: u8) -> Option<u32> {
    (b as char).to_digit(16)
}

fn str_to_int(s: &[u8]) -> Option<i64> {
    let (neg, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut a: u64 = 0;
    if digits.len() > 2 && digits[0] == b'0' && (digits[1] | 0x20) == b'x' {
        // hexadecimal: wraps around
        for &b in &digits[2..] {
            a = a.wrapping_mul(16).wrapping_add(hex_value(b)? as u64);
        }
    } else {
        if digits.is_empty() {
            return None;
        }
        let maxby10 = (i64::MAX / 10) as u64;
        let maxlastd = (i64::MAX % 10) as u64;
        for &b in digits {
            if !b.is_ascii_digit() {
                return None;
            }
            let d = (b - b'0') as u64;
            if a >= maxby10 && (a > maxby10 || d > maxlastd + neg as u64) {
                // overflow: not accepted as integer
                return None;
            }
            a = a * 10 + d;
        }
    }
    let v = a as i64;
    Some(if neg { v.wrapping_neg() } else { v })
}

fn hex_str_to_float(s: &[u8]) -> Option<f64> {
    let (neg, rest) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.len() < 2 || rest[0] != b'0' || (rest[1] | 0x20) != b'x' {
        return None;
    }
    let mut i = 2;
    let mut r = 0.0f64;
    let mut e: i64 = 0;
    let mut sigdig = 0;
    let mut nosigdig = 0;
    let mut has_dot = false;
    let mut any_digit = false;
    while i < rest.len() {
        let b = rest[i];
        if b == b'.' {
            if has_dot {
                break;
            }
            has_dot = true;
        } else if let Some(d) = hex_value(b) {
            any_digit = true;
            if sigdig == 0 && d == 0 {
                nosigdig += 1;
            } else {
                sigdig += 1;
                if sigdig <= 30 {
                    r = r * 16.0 + d as f64;
                } else {
                    // too many digits; ignore but still count for exponent
                    e += 1;
                }
            }
            if has_dot {
                e -= 1;
            }
        } else {
            break;
        }
        i += 1;
    }
    if !any_digit || nosigdig + sigdig == 0 {
        return None;
    }
    e *= 4;
    if i < rest.len() && (rest[i] | 0x20) == b'p' {
        i += 1;
        let (eneg, start) = match rest.get(i) {
            Some(b'-') => (true, i + 1),
            Some(b'+') => (false, i + 1),
            _ => (false, i),
        };
        let exp_digits = &rest[start..];
        if exp_digits.is_empty() || !exp_digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let mut exp1: i64 = 0;
        for &d in exp_digits {
            exp1 = exp1.saturating_mul(10).saturating_add((d - b'0') as i64);
        }
        e = e.saturating_add(if eneg { -exp1 } else { exp1 });
        i = rest.len();
    }
    if i != rest.len() {
        return None;
    }
    let v = r * 2f64.powi(e.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
    Some(if neg { -v } else { v })
}

fn str_to_float(s: &[u8]) -> Option<f64> {
    // reject 'inf' and 'nan'
    if s.iter().any(|&b| b == b'n' || b == b'N') {
        return None;
    }
    if s.iter().any(|&b| b == b'x' || b == b'X') {
        return hex_str_to_float(s);
    }
    let text = std::str::from_utf8(s).ok()?;
    text.parse::<f64>().ok()
}

/// Converts a string to a number following Lua's lexical rules: decimal or
/// hexadecimal integers (hex wraps around), decimal or hexadecimal floats,
/// surrounding whitespace allowed. Decimal integers that overflow become
/// floats.
pub fn str_to_number(bytes: &[u8]) -> Option<LuaValue> {
    let s = trim(bytes);
    if s.is_empty() {
        return None;
    }
    if let Some(i) = str_to_int(s) {
        return Some(LuaValue::Integer(i));
    }
    str_to_float(s).map(LuaValue::Float)
}

// ============ Number -> string ============

fn strip_fraction_zeros(s: &mut String) {
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
}

/// C's `%.14g`
pub fn fmt_g14(f: f64) -> String {
    const PRECISION: i32 = 14;
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan".into() } else { "nan".into() };
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf".into() } else { "inf".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0".into() } else { "0".into() };
    }
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= PRECISION {
        let mut m = mantissa.to_string();
        strip_fraction_zeros(&mut m);
        format!("{}e{}{:02}", m, if exp < 0 { '-' } else { '+' }, exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp) as usize;
        let mut s = format!("{:.*}", decimals, f);
        strip_fraction_zeros(&mut s);
        s
    }
}

/// Lua's float formatting: `%.14g`, plus ".0" when the result looks like an
/// integer.
pub fn fmt_float(f: f64) -> String {
    let mut s = fmt_g14(f);
    if s.bytes().all(|b| b == b'-' || b.is_ascii_digit()) {
        s.push_str(".0");
    }
    s
}

/// Appends the textual form of a number to `out`; false for non-numbers.
pub fn number_to_bytes(v: &LuaValue, out: &mut Vec<u8>) -> bool {
    match v {
        LuaValue::Integer(i) => {
            let mut buf = itoa::Buffer::new();
            out.extend_from_slice(buf.format(*i).as_bytes());
            true
        }
        LuaValue::Float(f) => {
            out.extend_from_slice(fmt_float(*f).as_bytes());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_division_semantics() {
        assert_eq!(int_idiv(7, 2), Ok(3));
        assert_eq!(int_idiv(-7, 2), Ok(-4));
        assert_eq!(int_idiv(i64::MIN, -1), Ok(i64::MIN));
        assert_eq!(int_idiv(1, 0), Err(ArithError::DivideByZero));
        assert_eq!(int_mod(-7, 3), Ok(2));
        assert_eq!(int_mod(7, -3), Ok(-2));
        assert_eq!(int_mod(i64::MIN, -1), Ok(0));
        assert_eq!(int_mod(1, 0), Err(ArithError::ModuloByZero));
    }

    #[test]
    fn test_float_mod_sign() {
        assert_eq!(float_mod(-7.0, 3.0), 2.0);
        assert_eq!(float_mod(7.0, -3.0), -2.0);
        assert!(float_mod(1.0, 0.0).is_nan());
        assert_eq!(float_mod(5.5, f64::INFINITY), 5.5);
        assert_eq!(float_mod(-5.5, f64::INFINITY), f64::INFINITY);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(shift_left(1, 63), i64::MIN);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(-1, -1), i64::MAX);
        assert_eq!(shift_left(-1, -64), 0);
    }

    #[test]
    fn test_raw_arith_types() {
        let i = |v| LuaValue::Integer(v);
        let f = |v| LuaValue::Float(v);
        assert_eq!(raw_arith(ArithOp::Add, &i(i64::MAX), &i(1)), Ok(Some(i(i64::MIN))));
        assert!(matches!(raw_arith(ArithOp::Div, &i(6), &i(3)), Ok(Some(LuaValue::Float(x))) if x == 2.0));
        assert!(matches!(raw_arith(ArithOp::Add, &i(1), &f(0.5)), Ok(Some(LuaValue::Float(x))) if x == 1.5));
        assert_eq!(raw_arith(ArithOp::BAnd, &f(3.0), &i(1)), Ok(Some(i(1))));
        assert_eq!(raw_arith(ArithOp::BAnd, &f(3.5), &i(1)), Ok(None));
        assert_eq!(raw_arith(ArithOp::Add, &LuaValue::Nil, &i(1)), Ok(None));
        assert_eq!(raw_arith(ArithOp::IDiv, &i(1), &i(0)), Err(ArithError::DivideByZero));
        assert!(matches!(raw_arith(ArithOp::IDiv, &f(1.0), &i(0)), Ok(Some(LuaValue::Float(x))) if x == f64::INFINITY));
    }

    #[test]
    fn test_mixed_comparison_is_exact() {
        let big = LuaValue::Integer(i64::MAX);
        let two63 = LuaValue::Float(9223372036854775808.0);
        assert_eq!(lt_num(&big, &two63), Some(true));
        assert_eq!(le_num(&two63, &big), Some(false));
        assert_eq!(lt_num(&LuaValue::Integer(1), &LuaValue::Float(f64::NAN)), Some(false));
        assert_eq!(lt_num(&LuaValue::Integer(1), &LuaValue::Nil), None);
    }

    #[test]
    fn test_str_to_number() {
        assert_eq!(str_to_number(b"  42  "), Some(LuaValue::Integer(42)));
        assert_eq!(str_to_number(b"0x10"), Some(LuaValue::Integer(16)));
        assert_eq!(str_to_number(b"0xffffffffffffffff"), Some(LuaValue::Integer(-1)));
        assert_eq!(str_to_number(b"1e2"), Some(LuaValue::Float(100.0)));
        assert_eq!(str_to_number(b".5"), Some(LuaValue::Float(0.5)));
        assert_eq!(str_to_number(b"0x1p4"), Some(LuaValue::Float(16.0)));
        assert_eq!(str_to_number(b"0x.8"), Some(LuaValue::Float(0.5)));
        assert_eq!(
            str_to_number(b"9223372036854775808"),
            Some(LuaValue::Float(9223372036854775808.0))
        );
        assert_eq!(str_to_number(b"-9223372036854775808"), Some(LuaValue::Integer(i64::MIN)));
        assert_eq!(str_to_number(b"inf"), None);
        assert_eq!(str_to_number(b"nan"), None);
        assert_eq!(str_to_number(b"1e"), None);
        assert_eq!(str_to_number(b""), None);
        assert_eq!(str_to_number(b"12a"), None);
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(fmt_float(1.0), "1.0");
        assert_eq!(fmt_float(-0.0), "-0.0");
        assert_eq!(fmt_float(0.1), "0.1");
        assert_eq!(fmt_float(1e15), "1e+15");
        assert_eq!(fmt_float(1e100), "1e+100");
        assert_eq!(fmt_float(123456.789), "123456.789");
        assert_eq!(fmt_float(1.0 / 3.0), "0.33333333333333");
        assert_eq!(fmt_float(1e-5), "1e-05");
        assert_eq!(fmt_float(f64::INFINITY), "inf");
        assert_eq!(fmt_float(2f64.powi(53)), "9.007199254741e+15");
    }
}
