//! The numeric tower: arbitrary-precision integers and float promotion.
//!
//! Integers live inline as `i64` until an operation overflows, at which
//! point they widen to a shared [`BigInt`]. All arithmetic follows the
//! floor-division sign convention: `(a // b) * b + (a % b) == a` holds for
//! every nonzero `b`, with the remainder taking the divisor's sign.
//!
//! Binary operations between a number and a non-number report
//! `NotImplemented` rather than raising, so the object layer can attempt
//! the reflected operation.

use crate::value::Value;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::sync::Arc;

/// An integer: inline `i64` fast path, shared big integer beyond.
#[derive(Debug, Clone)]
pub enum Int {
    Small(i64),
    Big(Arc<BigInt>),
}

impl Int {
    #[inline]
    pub fn from_i64(v: i64) -> Int {
        Int::Small(v)
    }

    /// Wrap a big integer, shrinking back to the inline form when it fits.
    pub fn from_big(v: BigInt) -> Int {
        match v.to_i64() {
            Some(small) => Int::Small(small),
            None => Int::Big(Arc::new(v)),
        }
    }

    #[inline]
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Int::Small(v) => Some(*v),
            Int::Big(b) => b.to_i64(),
        }
    }

    pub fn to_big(&self) -> BigInt {
        match self {
            Int::Small(v) => BigInt::from(*v),
            Int::Big(b) => (**b).clone(),
        }
    }

    /// Lossy conversion to `f64` (used for promotion and hashing).
    pub fn to_f64(&self) -> f64 {
        match self {
            Int::Small(v) => *v as f64,
            Int::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        match self {
            Int::Small(v) => *v == 0,
            Int::Big(b) => b.is_zero(),
        }
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        match self {
            Int::Small(v) => *v < 0,
            Int::Big(b) => b.is_negative(),
        }
    }

    /// Exact equality against a float.
    pub fn eq_f64(&self, f: f64) -> bool {
        if !f.is_finite() || f.fract() != 0.0 {
            return false;
        }
        match BigInt::from_f64(f) {
            Some(as_int) => match self {
                Int::Small(v) => BigInt::from(*v) == as_int,
                Int::Big(b) => **b == as_int,
            },
            None => false,
        }
    }

    pub fn cmp_f64(&self, f: f64) -> Option<Ordering> {
        if f.is_nan() {
            return None;
        }
        if f == f64::INFINITY {
            return Some(Ordering::Less);
        }
        if f == f64::NEG_INFINITY {
            return Some(Ordering::Greater);
        }
        // Compare through the big domain to avoid precision loss.
        let floor = BigInt::from_f64(f.floor())?;
        let this = self.to_big();
        match this.cmp(&floor) {
            Ordering::Equal if f.fract() != 0.0 => Some(Ordering::Less),
            other => Some(other),
        }
    }
}

impl PartialEq for Int {
    fn eq(&self, other: &Int) -> bool {
        match (self, other) {
            (Int::Small(a), Int::Small(b)) => a == b,
            // A Big value never fits in i64, so mixed forms are unequal.
            (Int::Small(_), Int::Big(_)) | (Int::Big(_), Int::Small(_)) => false,
            (Int::Big(a), Int::Big(b)) => a == b,
        }
    }
}

impl Eq for Int {}

impl PartialOrd for Int {
    fn partial_cmp(&self, other: &Int) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Int {
    fn cmp(&self, other: &Int) -> Ordering {
        match (self, other) {
            (Int::Small(a), Int::Small(b)) => a.cmp(b),
            (Int::Small(a), Int::Big(b)) => BigInt::from(*a).cmp(b),
            (Int::Big(a), Int::Small(b)) => (**a).cmp(&BigInt::from(*b)),
            (Int::Big(a), Int::Big(b)) => a.cmp(b),
        }
    }
}

impl std::fmt::Display for Int {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Int::Small(v) => write!(f, "{v}"),
            Int::Big(b) => write!(f, "{b}"),
        }
    }
}

/// Binary numeric operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

/// Failures the numeric tower can produce on well-typed operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumError {
    /// Division or modulo by zero.
    ZeroDivision(&'static str),
    /// Result does not fit the target domain.
    Overflow(&'static str),
    /// Well-typed but invalid operand (e.g. negative shift count).
    Invalid(&'static str),
}

/// Result of a binary numeric operation: a value, or `NotImplemented`
/// when either operand is outside the numeric tower.
pub fn binary_op(op: NumOp, a: &Value, b: &Value) -> Result<Value, NumError> {
    use crate::value::Numeric;

    let (x, y) = match (a.numeric(), b.numeric()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Ok(Value::NotImplemented),
    };

    // True division always produces a float; everything else stays in the
    // integer domain unless a float operand forces promotion.
    match (&x, &y) {
        (Numeric::Int(l), Numeric::Int(r)) if op != NumOp::TrueDiv => {
            int_binary_op(op, l.as_ref(), r.as_ref())
        }
        _ => {
            let l = numeric_f64(&x);
            let r = numeric_f64(&y);
            float_binary_op(op, l, r)
        }
    }
}

fn numeric_f64(n: &crate::value::Numeric<'_>) -> f64 {
    use crate::value::Numeric;
    match n {
        Numeric::Int(i) => i.as_ref().to_f64(),
        Numeric::Float(f) => *f,
    }
}

fn int_binary_op(op: NumOp, a: &Int, b: &Int) -> Result<Value, NumError> {
    if let (Int::Small(x), Int::Small(y)) = (a, b) {
        if let Some(v) = small_binary_op(op, *x, *y)? {
            return Ok(v);
        }
        // Overflowed the inline domain; fall through to big arithmetic.
    }
    big_binary_op(op, &a.to_big(), &b.to_big())
}

/// `i64` fast path. `Ok(None)` means the result overflowed and the caller
/// should retry in the big domain.
fn small_binary_op(op: NumOp, x: i64, y: i64) -> Result<Option<Value>, NumError> {
    let out = match op {
        NumOp::Add => x.checked_add(y),
        NumOp::Sub => x.checked_sub(y),
        NumOp::Mul => x.checked_mul(y),
        NumOp::FloorDiv => {
            if y == 0 {
                return Err(NumError::ZeroDivision("integer division or modulo by zero"));
            }
            checked_floor_div(x, y)
        }
        NumOp::Mod => {
            if y == 0 {
                return Err(NumError::ZeroDivision("integer division or modulo by zero"));
            }
            Some(floor_mod(x, y))
        }
        NumOp::BitAnd => Some(x & y),
        NumOp::BitOr => Some(x | y),
        NumOp::BitXor => Some(x ^ y),
        NumOp::Shl | NumOp::Shr | NumOp::Pow | NumOp::TrueDiv => None,
    };
    Ok(out.map(Value::int))
}

fn big_binary_op(op: NumOp, x: &BigInt, y: &BigInt) -> Result<Value, NumError> {
    let result = match op {
        NumOp::Add => x + y,
        NumOp::Sub => x - y,
        NumOp::Mul => x * y,
        NumOp::FloorDiv => {
            if y.is_zero() {
                return Err(NumError::ZeroDivision("integer division or modulo by zero"));
            }
            x.div_floor(y)
        }
        NumOp::Mod => {
            if y.is_zero() {
                return Err(NumError::ZeroDivision("integer division or modulo by zero"));
            }
            x.mod_floor(y)
        }
        NumOp::Pow => {
            if y.is_negative() {
                // Negative exponent leaves the integer domain.
                let base = x.to_f64().unwrap_or(f64::INFINITY);
                let exp = y.to_f64().unwrap_or(f64::NEG_INFINITY);
                return Ok(Value::Float(base.powf(exp)));
            }
            let exp = y
                .to_usize()
                .ok_or(NumError::Overflow("exponent too large"))?;
            num_traits::pow(x.clone(), exp)
        }
        NumOp::Shl => {
            let shift = shift_amount(y)?;
            x << shift
        }
        NumOp::Shr => {
            let shift = shift_amount(y)?;
            x >> shift
        }
        NumOp::BitAnd => x & y,
        NumOp::BitOr => x | y,
        NumOp::BitXor => x ^ y,
        NumOp::TrueDiv => unreachable!("true division is handled in the float domain"),
    };
    Ok(Value::Int(Int::from_big(result)))
}

fn shift_amount(y: &BigInt) -> Result<usize, NumError> {
    if y.is_negative() {
        return Err(NumError::Invalid("negative shift count"));
    }
    let shift = y.to_usize().ok_or(NumError::Overflow("shift count too large"))?;
    if shift > 1 << 20 {
        return Err(NumError::Overflow("shift count too large"));
    }
    Ok(shift)
}

fn float_binary_op(op: NumOp, x: f64, y: f64) -> Result<Value, NumError> {
    let result = match op {
        NumOp::Add => x + y,
        NumOp::Sub => x - y,
        NumOp::Mul => x * y,
        NumOp::TrueDiv => {
            if y == 0.0 {
                return Err(NumError::ZeroDivision("division by zero"));
            }
            x / y
        }
        NumOp::FloorDiv => {
            if y == 0.0 {
                return Err(NumError::ZeroDivision("float floor division by zero"));
            }
            (x / y).floor()
        }
        NumOp::Mod => {
            if y == 0.0 {
                return Err(NumError::ZeroDivision("float modulo"));
            }
            // Floor-modulo: the result takes the divisor's sign.
            x - y * (x / y).floor()
        }
        NumOp::Pow => x.powf(y),
        NumOp::Shl | NumOp::Shr | NumOp::BitAnd | NumOp::BitOr | NumOp::BitXor => {
            return Ok(Value::NotImplemented);
        }
    };
    Ok(Value::Float(result))
}

/// Floor division on `i64`, `None` on `i64::MIN / -1` overflow.
fn checked_floor_div(x: i64, y: i64) -> Option<i64> {
    let q = x.checked_div(y)?;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Floor modulo on `i64`: the remainder takes the divisor's sign.
fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

/// Unary negation.
pub fn negate(v: &Value) -> Option<Value> {
    match v {
        Value::Bool(b) => Some(Value::int(-(*b as i64))),
        Value::Int(Int::Small(x)) => Some(match x.checked_neg() {
            Some(n) => Value::int(n),
            None => Value::Int(Int::from_big(-BigInt::from(*x))),
        }),
        Value::Int(Int::Big(b)) => Some(Value::Int(Int::from_big(-(**b).clone()))),
        Value::Float(f) => Some(Value::Float(-f)),
        _ => None,
    }
}

/// Unary bitwise inversion: `~x == -x - 1`.
pub fn invert(v: &Value) -> Option<Value> {
    match v {
        Value::Bool(b) => Some(Value::int(!(*b as i64))),
        Value::Int(Int::Small(x)) => Some(Value::int(!x)),
        Value::Int(Int::Big(b)) => Some(Value::Int(Int::from_big(!(**b).clone()))),
        _ => None,
    }
}

/// Numeric ordering between two primitive values, `None` when either is
/// outside the numeric tower or the comparison is unordered (NaN).
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    use crate::value::Numeric;
    match (a.numeric()?, b.numeric()?) {
        (Numeric::Int(x), Numeric::Int(y)) => Some(x.as_ref().cmp(y.as_ref())),
        (Numeric::Float(x), Numeric::Float(y)) => x.partial_cmp(&y),
        (Numeric::Int(x), Numeric::Float(y)) => x.as_ref().cmp_f64(y),
        (Numeric::Float(x), Numeric::Int(y)) => y.as_ref().cmp_f64(x).map(Ordering::reverse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_op(op: NumOp, a: i64, b: i64) -> Value {
        binary_op(op, &Value::int(a), &Value::int(b)).unwrap()
    }

    #[test]
    fn test_floor_division_sign_convention() {
        assert_eq!(int_op(NumOp::FloorDiv, -7, 2).as_i64(), Some(-4));
        assert_eq!(int_op(NumOp::FloorDiv, 7, -2).as_i64(), Some(-4));
        assert_eq!(int_op(NumOp::Mod, -7, 2).as_i64(), Some(1));
        assert_eq!(int_op(NumOp::Mod, 7, -2).as_i64(), Some(-1));
    }

    #[test]
    fn test_divmod_identity() {
        for a in [-17i64, -5, 0, 3, 23] {
            for b in [-7i64, -2, 2, 5] {
                let q = int_op(NumOp::FloorDiv, a, b).as_i64().unwrap();
                let r = int_op(NumOp::Mod, a, b).as_i64().unwrap();
                assert_eq!(q * b + r, a, "identity failed for {a} / {b}");
            }
        }
    }

    #[test]
    fn test_overflow_promotes_to_big() {
        let v = int_op(NumOp::Mul, i64::MAX, 2);
        match v {
            Value::Int(Int::Big(b)) => assert_eq!(*b, BigInt::from(i64::MAX) * 2),
            other => panic!("expected big int, got {other:?}"),
        }
    }

    #[test]
    fn test_big_shrinks_back_to_small() {
        let big = Int::from_big(BigInt::from(42));
        assert!(matches!(big, Int::Small(42)));
    }

    #[test]
    fn test_true_division_is_float() {
        assert_eq!(int_op(NumOp::TrueDiv, 7, 2).as_float(), Some(3.5));
        assert_eq!(int_op(NumOp::TrueDiv, 4, 2).as_float(), Some(2.0));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            binary_op(NumOp::TrueDiv, &Value::int(1), &Value::int(0)),
            Err(NumError::ZeroDivision(_))
        ));
        assert!(matches!(
            binary_op(NumOp::FloorDiv, &Value::int(1), &Value::int(0)),
            Err(NumError::ZeroDivision(_))
        ));
    }

    #[test]
    fn test_pow() {
        assert_eq!(int_op(NumOp::Pow, 2, 10).as_i64(), Some(1024));
        // Negative exponent leaves the integer domain.
        assert_eq!(int_op(NumOp::Pow, 2, -1).as_float(), Some(0.5));
        // 2 ** 100 does not fit an i64.
        let v = int_op(NumOp::Pow, 2, 100);
        assert!(matches!(v, Value::Int(Int::Big(_))));
    }

    #[test]
    fn test_cross_type_is_not_implemented() {
        let r = binary_op(NumOp::Add, &Value::int(1), &Value::str("x")).unwrap();
        assert!(r.is_not_implemented());
    }

    #[test]
    fn test_mixed_promotes_to_float() {
        let r = binary_op(NumOp::Add, &Value::int(1), &Value::Float(0.5)).unwrap();
        assert_eq!(r.as_float(), Some(1.5));
    }

    #[test]
    fn test_bool_participates_as_int() {
        let r = binary_op(NumOp::Add, &Value::Bool(true), &Value::int(2)).unwrap();
        assert_eq!(r.as_i64(), Some(3));
    }

    #[test]
    fn test_negative_shift_is_invalid() {
        assert!(matches!(
            binary_op(NumOp::Shl, &Value::int(1), &Value::int(-1)),
            Err(NumError::Invalid(_))
        ));
    }

    #[test]
    fn test_compare_int_float() {
        assert_eq!(
            compare(&Value::int(2), &Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(&Value::Float(3.0), &Value::int(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(compare(&Value::Float(f64::NAN), &Value::int(3)), None);
    }

    #[test]
    fn test_invert() {
        assert_eq!(invert(&Value::int(0)).unwrap().as_i64(), Some(-1));
        assert_eq!(invert(&Value::int(5)).unwrap().as_i64(), Some(-6));
    }
}
