//! Tagged value representation.
//!
//! A [`Value`] is the content of every register, stack slot, container
//! element and attribute. It is a small, cheaply clonable tagged sum:
//! immediate payloads for the primitive types and an opaque [`ObjRef`]
//! handle for everything that lives on the heap. Object handles are bare
//! indices; lifetime is managed solely by the tracing collector.

use crate::number::Int;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Handle to a heap object: an index into the heap arena.
///
/// `ObjRef` is deliberately not reference counted. The collector keeps
/// objects alive by tracing from roots, so copies of a handle are free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Create a handle from a raw arena index.
    #[inline]
    pub const fn from_index(index: u32) -> Self {
        ObjRef(index)
    }

    /// The raw arena index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<object #{}>", self.0)
    }
}

/// The runtime value union.
///
/// Primitives carry their payload inline; strings and bytes share their
/// backing storage via `Arc`, so cloning a `Value` never copies data.
/// `NotImplemented` is the sentinel returned by binary slots that do not
/// handle their operand combination, prompting the caller to try the
/// reflected operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The `None` singleton.
    None,
    /// `True` / `False`. Participates in arithmetic as 1 / 0.
    Bool(bool),
    /// Arbitrary-precision integer.
    Int(Int),
    /// IEEE-754 double.
    Float(f64),
    /// Immutable UTF-8 string.
    Str(Arc<str>),
    /// Immutable byte sequence.
    Bytes(Arc<[u8]>),
    /// The `...` singleton.
    Ellipsis,
    /// Sentinel for unsupported operand combinations.
    NotImplemented,
    /// Handle to a heap object.
    Object(ObjRef),
}

impl Value {
    /// Build an integer value from an `i64`.
    #[inline]
    pub fn int(v: i64) -> Value {
        Value::Int(Int::from_i64(v))
    }

    /// Build a string value, sharing the interned backing storage.
    #[inline]
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[inline]
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Value::NotImplemented)
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload, if this is an int (or bool, which counts as
    /// 1/0 for arithmetic) that fits in an `i64`.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => i.to_i64(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<&Int> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Truthiness for primitive values. `None` means the answer requires
    /// object-level dispatch (`__bool__` / `__len__`).
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::None => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(!i.is_zero()),
            Value::Float(f) => Some(*f != 0.0),
            Value::Str(s) => Some(!s.is_empty()),
            Value::Bytes(b) => Some(!b.is_empty()),
            Value::Ellipsis | Value::NotImplemented => Some(true),
            Value::Object(_) => None,
        }
    }

    /// The type name for primitive tags, used in diagnostics. Heap objects
    /// report their type through the runtime instead.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Ellipsis => "ellipsis",
            Value::NotImplemented => "NotImplementedType",
            Value::Object(_) => "object",
        }
    }

    /// Shallow equality between values.
    ///
    /// Returns `None` when the answer requires object-level dispatch (at
    /// least one side is a heap object). Differently-tagged values compare
    /// unequal except across the numeric tower, which compares numerically.
    pub fn shallow_eq(&self, other: &Value) -> Option<bool> {
        use Value::*;
        match (self, other) {
            (Object(_), _) | (_, Object(_)) => Option::None,
            (None, None) => Some(true),
            (Ellipsis, Ellipsis) => Some(true),
            (NotImplemented, NotImplemented) => Some(true),
            (Str(a), Str(b)) => Some(a == b),
            (Bytes(a), Bytes(b)) => Some(a == b),
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => Some(numeric_eq(&x, &y)),
                _ => Some(false),
            },
        }
    }

    /// View of this value as a member of the numeric tower, if it is one.
    pub(crate) fn numeric(&self) -> Option<Numeric<'_>> {
        match self {
            Value::Bool(b) => Some(Numeric::Int(std::borrow::Cow::Owned(Int::from_i64(
                *b as i64,
            )))),
            Value::Int(i) => Some(Numeric::Int(std::borrow::Cow::Borrowed(i))),
            Value::Float(f) => Some(Numeric::Float(*f)),
            _ => None,
        }
    }

    /// Hash for primitive values, `None` for heap objects.
    ///
    /// The numeric tower hashes through the float domain so that equal
    /// int/float/bool values hash equal, as the dict contract requires.
    /// Big integers beyond f64 precision collapse onto their nearest
    /// representable double; collisions are resolved by equality.
    pub fn primitive_hash(&self) -> Option<u64> {
        let mut h = rustc_hash::FxHasher::default();
        match self {
            Value::None => 0x6eb5u64.hash(&mut h),
            Value::Ellipsis => 0xe111u64.hash(&mut h),
            Value::NotImplemented => 0x401au64.hash(&mut h),
            Value::Bool(b) => hash_f64(*b as i64 as f64, &mut h),
            Value::Int(i) => hash_f64(i.to_f64(), &mut h),
            Value::Float(f) => hash_f64(*f, &mut h),
            Value::Str(s) => s.as_bytes().hash(&mut h),
            Value::Bytes(b) => b.hash(&mut h),
            Value::Object(_) => return Option::None,
        }
        Some(h.finish())
    }
}

/// A primitive value viewed as int-or-float.
pub(crate) enum Numeric<'a> {
    Int(std::borrow::Cow<'a, Int>),
    Float(f64),
}

fn numeric_eq(a: &Numeric<'_>, b: &Numeric<'_>) -> bool {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x.as_ref() == y.as_ref(),
        (Numeric::Float(x), Numeric::Float(y)) => x == y,
        (Numeric::Int(i), Numeric::Float(f)) | (Numeric::Float(f), Numeric::Int(i)) => {
            i.eq_f64(*f)
        }
    }
}

fn hash_f64(f: f64, h: &mut impl Hasher) {
    if f.is_nan() {
        0x7ff8_dead_beefu64.hash(h);
    } else if f == 0.0 {
        // -0.0 == 0.0 must hash equal
        0u64.hash(h);
    } else {
        f.to_bits().hash(h);
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e16 {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "b'{}'", b.escape_ascii()),
            Value::Ellipsis => write!(f, "Ellipsis"),
            Value::NotImplemented => write!(f, "NotImplemented"),
            Value::Object(r) => write!(f, "{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_eq_numeric_tower() {
        assert_eq!(Value::int(3).shallow_eq(&Value::Float(3.0)), Some(true));
        assert_eq!(Value::Bool(true).shallow_eq(&Value::int(1)), Some(true));
        assert_eq!(Value::int(3).shallow_eq(&Value::Float(3.5)), Some(false));
        assert_eq!(Value::int(3).shallow_eq(&Value::str("3")), Some(false));
    }

    #[test]
    fn test_shallow_eq_defers_objects() {
        let obj = Value::Object(ObjRef::from_index(7));
        assert_eq!(obj.shallow_eq(&Value::int(1)), None);
    }

    #[test]
    fn test_hash_contract() {
        let a = Value::int(42).primitive_hash();
        let b = Value::Float(42.0).primitive_hash();
        assert_eq!(a, b);
        let t = Value::Bool(true).primitive_hash();
        let one = Value::int(1).primitive_hash();
        assert_eq!(t, one);
        assert!(Value::Object(ObjRef::from_index(0))
            .primitive_hash()
            .is_none());
    }

    #[test]
    fn test_negative_zero_hash() {
        assert_eq!(
            Value::Float(0.0).primitive_hash(),
            Value::Float(-0.0).primitive_hash()
        );
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(Value::str("").truthy(), Some(false));
        assert_eq!(Value::str("x").truthy(), Some(true));
        assert_eq!(Value::int(0).truthy(), Some(false));
        assert_eq!(Value::None.truthy(), Some(false));
        assert_eq!(Value::Object(ObjRef::from_index(0)).truthy(), None);
    }
}
