//! Generic operation dispatch.
//!
//! Every VM opcode that touches values funnels through here. The order
//! of attack is always: primitive fast path (the numeric tower in
//! `opal_core`), then the receiver type's prototype slot, then the
//! reflected operand's slot, then a dunder lookup through the MRO for
//! user classes, and finally a TypeError. Slot pointers are checked
//! directly; there is no virtual dispatch on the hot paths.

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{Payload, PyObject, TypeId};
use crate::types;
use crate::types::dict::DictStorage;
use crate::types::iter::{DictViewKind, IterData};
use opal_core::{self as core, NumError, NumOp, ObjRef, Value};

// =============================================================================
// Type identity
// =============================================================================

/// The runtime type id of a value.
pub fn type_id_of(ctx: &dyn Ctx, value: &Value) -> TypeId {
    match value {
        Value::None => TypeId::NONE,
        Value::Bool(_) => TypeId::BOOL,
        Value::Int(_) => TypeId::INT,
        Value::Float(_) => TypeId::FLOAT,
        Value::Str(_) => TypeId::STR,
        Value::Bytes(_) => TypeId::BYTES,
        Value::Ellipsis => TypeId::ELLIPSIS,
        Value::NotImplemented => TypeId::NOT_IMPLEMENTED,
        Value::Object(r) => ctx.heap().get(*r).type_id,
    }
}

/// Human-readable type name for diagnostics.
pub fn type_name(ctx: &mut dyn Ctx, value: &Value) -> String {
    let tid = type_id_of(ctx, value);
    if let Some(proto) = types::prototype_of(tid) {
        return proto.name.to_string();
    }
    match ctx.type_object(tid) {
        Ok(type_obj) => match ctx.heap().get(type_obj).payload.as_type() {
            Some(td) => td.name.to_string(),
            None => value.tag_name().to_string(),
        },
        Err(_) => value.tag_name().to_string(),
    }
}

// =============================================================================
// Binary and unary operations
// =============================================================================

fn dunder_names(op: NumOp) -> (&'static str, &'static str, &'static str) {
    match op {
        NumOp::Add => ("__add__", "__radd__", "+"),
        NumOp::Sub => ("__sub__", "__rsub__", "-"),
        NumOp::Mul => ("__mul__", "__rmul__", "*"),
        NumOp::TrueDiv => ("__truediv__", "__rtruediv__", "/"),
        NumOp::FloorDiv => ("__floordiv__", "__rfloordiv__", "//"),
        NumOp::Mod => ("__mod__", "__rmod__", "%"),
        NumOp::Pow => ("__pow__", "__rpow__", "**"),
        NumOp::Shl => ("__lshift__", "__rlshift__", "<<"),
        NumOp::Shr => ("__rshift__", "__rrshift__", ">>"),
        NumOp::BitAnd => ("__and__", "__rand__", "&"),
        NumOp::BitOr => ("__or__", "__ror__", "|"),
        NumOp::BitXor => ("__xor__", "__rxor__", "^"),
    }
}

fn raise_num_error(ctx: &mut dyn Ctx, err: NumError) -> crate::context::Raised {
    match err {
        NumError::ZeroDivision(msg) => ctx.raise(ExcKind::ZeroDivisionError, msg.to_string()),
        NumError::Overflow(msg) => ctx.raise(ExcKind::OverflowError, msg.to_string()),
        NumError::Invalid(msg) => ctx.raise(ExcKind::ValueError, msg.to_string()),
    }
}

/// Binary operation dispatch.
pub fn binary(ctx: &mut dyn Ctx, op: NumOp, a: &Value, b: &Value) -> PyResult<Value> {
    // Numeric tower first.
    match core::binary_op(op, a, b) {
        Ok(Value::NotImplemented) => {}
        Ok(v) => return Ok(v),
        Err(e) => return Err(raise_num_error(ctx, e)),
    }

    // Receiver slot, then the reflected operand's slot.
    if matches!(op, NumOp::Add | NumOp::Mul) {
        for (lhs, rhs) in [(a, b), (b, a)] {
            let tid = type_id_of(ctx, lhs);
            let slot = types::prototype_of(tid).and_then(|p| match op {
                NumOp::Add => p.add,
                _ => p.mul,
            });
            if let Some(slot) = slot {
                let result = slot(ctx, lhs, rhs)?;
                if !result.is_not_implemented() {
                    return Ok(result);
                }
            }
            // Addition is not commutative for sequences; only try the
            // reflected slot for repetition (int * seq).
            if op == NumOp::Add {
                break;
            }
        }
    }

    // User-defined dunders.
    let (name, rname, symbol) = dunder_names(op);
    if let Some(result) = try_dunder_binary(ctx, a, b, name)? {
        if !result.is_not_implemented() {
            return Ok(result);
        }
    }
    if let Some(result) = try_dunder_binary(ctx, b, a, rname)? {
        if !result.is_not_implemented() {
            return Ok(result);
        }
    }

    let left = type_name(ctx, a);
    let right = type_name(ctx, b);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("unsupported operand type(s) for {symbol}: '{left}' and '{right}'"),
    ))
}

/// Invoke a dunder on a user instance, bound through the MRO.
/// `Ok(None)` when the receiver is not a user object or has no such
/// attribute.
fn try_dunder_binary(
    ctx: &mut dyn Ctx,
    receiver: &Value,
    operand: &Value,
    name: &str,
) -> PyResult<Option<Value>> {
    let Some(method) = lookup_special(ctx, receiver, name)? else {
        return Ok(None);
    };
    Ok(Some(ctx.call(method, &[operand.clone()])?))
}

/// Look up a dunder on the receiver's type (not its instance dict),
/// binding the receiver. Only user-defined classes carry dunders in
/// their class dicts.
pub fn lookup_special(ctx: &mut dyn Ctx, receiver: &Value, name: &str) -> PyResult<Option<Value>> {
    let tid = type_id_of(ctx, receiver);
    if tid.is_builtin() {
        return Ok(None);
    }
    let type_obj = ctx.type_object(tid)?;
    let Some(raw) = crate::object::attr::type_lookup(ctx, type_obj, name) else {
        return Ok(None);
    };
    Ok(Some(crate::object::attr::bind_class_attr(
        ctx,
        raw,
        receiver.clone(),
    )?))
}

/// Unary operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Neg,
    Pos,
    Invert,
    Not,
}

pub fn unary(ctx: &mut dyn Ctx, kind: UnaryKind, v: &Value) -> PyResult<Value> {
    match kind {
        UnaryKind::Not => return Ok(Value::Bool(!truthy(ctx, v)?)),
        UnaryKind::Neg => {
            if let Some(result) = core::negate(v) {
                return Ok(result);
            }
        }
        UnaryKind::Pos => {
            if matches!(v, Value::Int(_) | Value::Float(_) | Value::Bool(_)) {
                return Ok(v.clone());
            }
        }
        UnaryKind::Invert => {
            if let Some(result) = core::invert(v) {
                return Ok(result);
            }
        }
    }
    let (name, symbol) = match kind {
        UnaryKind::Neg => ("__neg__", "-"),
        UnaryKind::Pos => ("__pos__", "+"),
        UnaryKind::Invert => ("__invert__", "~"),
        UnaryKind::Not => unreachable!("not returned above"),
    };
    if let Some(method) = lookup_special(ctx, v, name)? {
        return ctx.call(method, &[]);
    }
    let tname = type_name(ctx, v);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("bad operand type for unary {symbol}: '{tname}'"),
    ))
}

// =============================================================================
// Equality, ordering, hashing
// =============================================================================

/// Comparison kinds for rich comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpKind {
    fn dunder(self) -> (&'static str, &'static str) {
        match self {
            CmpKind::Eq => ("__eq__", "__eq__"),
            CmpKind::Ne => ("__ne__", "__ne__"),
            CmpKind::Lt => ("__lt__", "__gt__"),
            CmpKind::Le => ("__le__", "__ge__"),
            CmpKind::Gt => ("__gt__", "__lt__"),
            CmpKind::Ge => ("__ge__", "__le__"),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpKind::Eq => "==",
            CmpKind::Ne => "!=",
            CmpKind::Lt => "<",
            CmpKind::Le => "<=",
            CmpKind::Gt => ">",
            CmpKind::Ge => ">=",
        }
    }
}

/// Value equality: numeric across the tower, structural for built-in
/// containers, `__eq__` for user classes, identity as the last resort.
pub fn value_eq(ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<bool> {
    if let Some(result) = a.shallow_eq(b) {
        return Ok(result);
    }

    // At least one side is a heap object.
    if let (Value::Object(x), Value::Object(y)) = (a, b) {
        if x == y {
            return Ok(true);
        }
        let (pa, pb) = (&ctx.heap().get(*x).payload, &ctx.heap().get(*y).payload);
        match (pa, pb) {
            (Payload::List(xs), Payload::List(ys)) | (Payload::Tuple(xs), Payload::Tuple(ys)) => {
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                let xs = xs.clone();
                let ys = ys.clone();
                for (x, y) in xs.iter().zip(&ys) {
                    if !value_eq(ctx, x, y)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
            (Payload::Range(r1), Payload::Range(r2)) => return Ok(r1 == r2),
            _ => {}
        }
    }

    // User __eq__, either direction.
    for (lhs, rhs) in [(a, b), (b, a)] {
        if let Some(result) = try_dunder_binary(ctx, lhs, rhs, "__eq__")? {
            if !result.is_not_implemented() {
                return truthy(ctx, &result);
            }
        }
    }

    Ok(false)
}

/// Rich comparison per the reflected-operand protocol.
pub fn rich_compare(ctx: &mut dyn Ctx, kind: CmpKind, a: &Value, b: &Value) -> PyResult<Value> {
    match kind {
        CmpKind::Eq => return Ok(Value::Bool(value_eq(ctx, a, b)?)),
        CmpKind::Ne => return Ok(Value::Bool(!value_eq(ctx, a, b)?)),
        _ => {}
    }

    // Numeric ordering.
    if let Some(ordering) = core::compare(a, b) {
        return Ok(Value::Bool(match kind {
            CmpKind::Lt => ordering.is_lt(),
            CmpKind::Le => ordering.is_le(),
            CmpKind::Gt => ordering.is_gt(),
            CmpKind::Ge => ordering.is_ge(),
            _ => unreachable!(),
        }));
    }

    // Strings and bytes order lexicographically.
    let ordering = match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        _ => sequence_ordering(ctx, a, b)?,
    };
    if let Some(ordering) = ordering {
        return Ok(Value::Bool(match kind {
            CmpKind::Lt => ordering.is_lt(),
            CmpKind::Le => ordering.is_le(),
            CmpKind::Gt => ordering.is_gt(),
            CmpKind::Ge => ordering.is_ge(),
            _ => unreachable!(),
        }));
    }

    // User dunders with reflected fallback.
    let (name, rname) = kind.dunder();
    if let Some(result) = try_dunder_binary(ctx, a, b, name)? {
        if !result.is_not_implemented() {
            return Ok(result);
        }
    }
    if let Some(result) = try_dunder_binary(ctx, b, a, rname)? {
        if !result.is_not_implemented() {
            return Ok(result);
        }
    }

    let left = type_name(ctx, a);
    let right = type_name(ctx, b);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!(
            "'{}' not supported between instances of '{left}' and '{right}'",
            kind.symbol()
        ),
    ))
}

/// Lexicographic ordering for same-typed list/tuple pairs.
fn sequence_ordering(
    ctx: &mut dyn Ctx,
    a: &Value,
    b: &Value,
) -> PyResult<Option<std::cmp::Ordering>> {
    let (Value::Object(x), Value::Object(y)) = (a, b) else {
        return Ok(None);
    };
    let (xs, ys) = match (&ctx.heap().get(*x).payload, &ctx.heap().get(*y).payload) {
        (Payload::List(xs), Payload::List(ys)) | (Payload::Tuple(xs), Payload::Tuple(ys)) => {
            (xs.clone(), ys.clone())
        }
        _ => return Ok(None),
    };
    for (x, y) in xs.iter().zip(&ys) {
        if !value_eq(ctx, x, y)? {
            let lt = rich_compare(ctx, CmpKind::Lt, x, y)?;
            return Ok(Some(if truthy(ctx, &lt)? {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }));
        }
    }
    Ok(Some(xs.len().cmp(&ys.len())))
}

/// Identity comparison (`is`).
pub fn value_is(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => x == y,
        (Value::None, Value::None) => true,
        (Value::Ellipsis, Value::Ellipsis) => true,
        (Value::NotImplemented, Value::NotImplemented) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        // Immediate values behave as interned.
        _ => a.shallow_eq(b).unwrap_or(false),
    }
}

/// Hash for dict keys and set members. Mutable containers are
/// unhashable; other heap objects hash by identity unless their
/// prototype says otherwise.
pub fn value_hash(ctx: &mut dyn Ctx, v: &Value) -> PyResult<u64> {
    if let Some(h) = v.primitive_hash() {
        return Ok(h);
    }
    let Value::Object(r) = v else {
        unreachable!("primitive without a hash")
    };
    match &ctx.heap().get(*r).payload {
        Payload::List(_) | Payload::Dict(_) | Payload::Set(_) => {
            let tname = type_name(ctx, v);
            Err(ctx.raise(ExcKind::TypeError, format!("unhashable type: '{tname}'")))
        }
        Payload::Tuple(items) => {
            let items = items.clone();
            let mut h: u64 = 0x345678;
            for item in &items {
                h = h
                    .rotate_left(13)
                    .wrapping_mul(1_000_003)
                    .wrapping_add(value_hash(ctx, item)?);
            }
            Ok(h)
        }
        _ => Ok(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(r.index() as u64 + 1)),
    }
}

// =============================================================================
// Truthiness, length
// =============================================================================

pub fn truthy(ctx: &mut dyn Ctx, v: &Value) -> PyResult<bool> {
    if let Some(result) = v.truthy() {
        return Ok(result);
    }
    let tid = type_id_of(ctx, v);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.len) {
        return Ok(slot(ctx, v)? != 0);
    }
    if let Some(method) = lookup_special(ctx, v, "__bool__")? {
        let result = ctx.call(method, &[])?;
        return match result {
            Value::Bool(b) => Ok(b),
            _ => Err(ctx.raise(
                ExcKind::TypeError,
                "__bool__ should return bool".to_string(),
            )),
        };
    }
    if let Some(method) = lookup_special(ctx, v, "__len__")? {
        let result = ctx.call(method, &[])?;
        return truthy(ctx, &result);
    }
    Ok(true)
}

pub fn len_of(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    if let Value::Str(s) = v {
        return Ok(s.chars().count());
    }
    if let Value::Bytes(b) = v {
        return Ok(b.len());
    }
    let tid = type_id_of(ctx, v);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.len) {
        return slot(ctx, v);
    }
    if let Some(method) = lookup_special(ctx, v, "__len__")? {
        let result = ctx.call(method, &[])?;
        return match result.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(ctx.raise(
                ExcKind::ValueError,
                "__len__ should return a non-negative integer".to_string(),
            )),
        };
    }
    let tname = type_name(ctx, v);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("object of type '{tname}' has no len()"),
    ))
}

// =============================================================================
// Representation
// =============================================================================

/// Developer representation, with a depth guard for cyclic containers.
pub fn repr_value(ctx: &mut dyn Ctx, v: &Value) -> PyResult<String> {
    repr_with_depth(ctx, v, 0)
}

fn repr_seq(
    ctx: &mut dyn Ctx,
    items: &[Value],
    depth: usize,
    open: &str,
    close: &str,
) -> PyResult<String> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(repr_with_depth(ctx, item, depth + 1)?);
    }
    Ok(format!("{open}{}{close}", parts.join(", ")))
}

pub(crate) fn repr_with_depth(ctx: &mut dyn Ctx, v: &Value, depth: usize) -> PyResult<String> {
    if depth > 6 {
        return Ok("...".to_string());
    }
    let Value::Object(r) = v else {
        return Ok(match v {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        });
    };

    enum Shape {
        Seq(Vec<Value>, &'static str, &'static str),
        Pairs(Vec<(Value, Value)>),
        Set(Vec<Value>),
        Done(String),
        Exception(Vec<Value>),
        Instance,
    }

    let shape = match &ctx.heap().get(*r).payload {
        Payload::List(items) => Shape::Seq(items.clone(), "[", "]"),
        Payload::Tuple(items) => {
            if items.len() == 1 {
                let only = items[0].clone();
                let inner = repr_with_depth(ctx, &only, depth + 1)?;
                return Ok(format!("({inner},)"));
            }
            Shape::Seq(items.clone(), "(", ")")
        }
        Payload::Dict(storage) => {
            Shape::Pairs(storage.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        Payload::Set(storage) => Shape::Set(storage.iter().map(|(k, _)| k.clone()).collect()),
        Payload::Range(range) => Shape::Done(if range.step == 1 {
            format!("range({}, {})", range.start, range.stop)
        } else {
            format!("range({}, {}, {})", range.start, range.stop, range.step)
        }),
        Payload::Slice { start, stop, step } => {
            let parts = [start.clone(), stop.clone(), step.clone()];
            let mut rendered = Vec::new();
            for p in &parts {
                rendered.push(repr_with_depth(ctx, p, depth + 1)?);
            }
            Shape::Done(format!("slice({})", rendered.join(", ")))
        }
        Payload::Function(f) => Shape::Done(format!("<function {}>", f.qualname)),
        Payload::BuiltinFunction(f) => Shape::Done(format!("<built-in function {}>", f.name)),
        Payload::BoundMethod(_) => Shape::Done("<bound method>".to_string()),
        Payload::Type(t) => Shape::Done(format!("<class '{}'>", t.name)),
        Payload::Module { name } => Shape::Done(format!("<module '{name}'>")),
        Payload::Generator(g) => Shape::Done(format!("<generator object {}>", g.qualname)),
        Payload::Frame(f) => Shape::Done(format!("<frame object for {}>", f.code.qualname)),
        Payload::Cell(_) => Shape::Done("<cell>".to_string()),
        Payload::Code(code) => Shape::Done(format!("<code object {}>", code.qualname)),
        Payload::Iter(_) => Shape::Done("<iterator>".to_string()),
        Payload::Exception { args } => Shape::Exception(args.clone()),
        Payload::Instance => Shape::Instance,
    };

    match shape {
        Shape::Done(s) => Ok(s),
        Shape::Seq(items, open, close) => repr_seq(ctx, &items, depth, open, close),
        Shape::Set(items) => {
            if items.is_empty() {
                Ok("set()".to_string())
            } else {
                repr_seq(ctx, &items, depth, "{", "}")
            }
        }
        Shape::Pairs(pairs) => {
            let mut parts = Vec::with_capacity(pairs.len());
            for (k, val) in &pairs {
                let k = repr_with_depth(ctx, k, depth + 1)?;
                let val = repr_with_depth(ctx, val, depth + 1)?;
                parts.push(format!("{k}: {val}"));
            }
            Ok(format!("{{{}}}", parts.join(", ")))
        }
        Shape::Exception(args) => {
            let tname = type_name(ctx, v);
            let rendered = repr_seq(ctx, &args, depth, "(", ")")?;
            Ok(format!("{tname}{rendered}"))
        }
        Shape::Instance => {
            if let Some(method) = lookup_special(ctx, v, "__repr__")? {
                let result = ctx.call(method, &[])?;
                if let Value::Str(s) = result {
                    return Ok(s.to_string());
                }
                return Err(ctx.raise(
                    ExcKind::TypeError,
                    "__repr__ returned non-string".to_string(),
                ));
            }
            let tname = type_name(ctx, v);
            Ok(format!("<{tname} object>"))
        }
    }
}

/// Informal string form: like repr, but strings pass through unquoted
/// and exceptions render their message.
pub fn str_value(ctx: &mut dyn Ctx, v: &Value) -> PyResult<String> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        Value::Object(r) => {
            if let Payload::Exception { args } = &ctx.heap().get(*r).payload {
                let args = args.clone();
                return match args.len() {
                    0 => Ok(String::new()),
                    1 => str_value(ctx, &args[0]),
                    _ => repr_value(ctx, v),
                };
            }
            if let Some(method) = lookup_special(ctx, v, "__str__")? {
                let result = ctx.call(method, &[])?;
                if let Value::Str(s) = result {
                    return Ok(s.to_string());
                }
            }
            repr_value(ctx, v)
        }
        other => Ok(other.to_string()),
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Produce an iterator for a value (`iter(v)`).
pub fn get_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let tid = type_id_of(ctx, v);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.iter) {
        return slot(ctx, v);
    }
    if let Some(method) = lookup_special(ctx, v, "__iter__")? {
        return ctx.call(method, &[]);
    }
    let tname = type_name(ctx, v);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("'{tname}' object is not iterable"),
    ))
}

/// Advance an iterator. `Ok(None)` signals exhaustion; user iterators
/// signal it by raising StopIteration, which is translated here.
pub fn iter_next(ctx: &mut dyn Ctx, iter: &Value) -> PyResult<Option<Value>> {
    let tid = type_id_of(ctx, iter);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.next) {
        return slot(ctx, iter);
    }
    if let Some(method) = lookup_special(ctx, iter, "__next__")? {
        return match ctx.call(method, &[]) {
            Ok(v) => Ok(Some(v)),
            Err(raised) if ctx.exception_matches(raised.0, ExcKind::StopIteration) => Ok(None),
            Err(raised) => Err(raised),
        };
    }
    let tname = type_name(ctx, iter);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("'{tname}' object is not an iterator"),
    ))
}

/// Membership test (`needle in container`).
pub fn contains(ctx: &mut dyn Ctx, container: &Value, needle: &Value) -> PyResult<bool> {
    if let (Value::Str(haystack), Value::Str(n)) = (container, needle) {
        return Ok(haystack.contains(&**n));
    }
    let tid = type_id_of(ctx, container);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.contains) {
        return slot(ctx, container, needle);
    }
    if let Some(method) = lookup_special(ctx, container, "__contains__")? {
        let result = ctx.call(method, &[needle.clone()])?;
        return truthy(ctx, &result);
    }
    // Fall back to iteration.
    let iter = get_iter(ctx, container)?;
    while let Some(item) = iter_next(ctx, &iter)? {
        if value_eq(ctx, &item, needle)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// =============================================================================
// Subscripts
// =============================================================================

pub fn get_item(ctx: &mut dyn Ctx, obj: &Value, key: &Value) -> PyResult<Value> {
    if let Value::Str(s) = obj {
        return types::str_type::str_get_item(ctx, s, key);
    }
    let tid = type_id_of(ctx, obj);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.getitem) {
        return slot(ctx, obj, key);
    }
    if let Some(method) = lookup_special(ctx, obj, "__getitem__")? {
        return ctx.call(method, &[key.clone()]);
    }
    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("'{tname}' object is not subscriptable"),
    ))
}

pub fn set_item(ctx: &mut dyn Ctx, obj: &Value, key: &Value, value: &Value) -> PyResult<()> {
    let tid = type_id_of(ctx, obj);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.setitem) {
        return slot(ctx, obj, key, value);
    }
    if let Some(method) = lookup_special(ctx, obj, "__setitem__")? {
        ctx.call(method, &[key.clone(), value.clone()])?;
        return Ok(());
    }
    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("'{tname}' object does not support item assignment"),
    ))
}

pub fn del_item(ctx: &mut dyn Ctx, obj: &Value, key: &Value) -> PyResult<()> {
    let tid = type_id_of(ctx, obj);
    if let Some(slot) = types::prototype_of(tid).and_then(|p| p.delitem) {
        return slot(ctx, obj, key);
    }
    if let Some(method) = lookup_special(ctx, obj, "__delitem__")? {
        ctx.call(method, &[key.clone()])?;
        return Ok(());
    }
    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("'{tname}' object does not support item deletion"),
    ))
}

// =============================================================================
// Dict operations (shared by dict and set payloads)
// =============================================================================

fn with_storage<R>(
    ctx: &dyn Ctx,
    dict: ObjRef,
    f: impl FnOnce(&DictStorage) -> R,
) -> R {
    match &ctx.heap().get(dict).payload {
        Payload::Dict(s) | Payload::Set(s) => f(s),
        _ => unreachable!("dict operation on non-dict object"),
    }
}

fn with_storage_mut<R>(
    ctx: &mut dyn Ctx,
    dict: ObjRef,
    f: impl FnOnce(&mut DictStorage) -> R,
) -> R {
    match &mut ctx.heap_mut().get_mut(dict).payload {
        Payload::Dict(s) | Payload::Set(s) => f(s),
        _ => unreachable!("dict operation on non-dict object"),
    }
}

/// Find the storage slot holding `key`, probing candidates with full
/// value equality.
pub fn dict_find(ctx: &mut dyn Ctx, dict: ObjRef, key: &Value) -> PyResult<Option<u32>> {
    let hash = value_hash(ctx, key)?;
    let candidates = with_storage(ctx, dict, |s| s.candidates(hash));
    for slot in candidates {
        let Some(stored) = with_storage(ctx, dict, |s| s.key_at(slot)) else {
            continue;
        };
        if value_eq(ctx, &stored, key)? {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

pub fn dict_get(ctx: &mut dyn Ctx, dict: ObjRef, key: &Value) -> PyResult<Option<Value>> {
    let Some(slot) = dict_find(ctx, dict, key)? else {
        return Ok(None);
    };
    Ok(with_storage(ctx, dict, |s| s.value_at(slot)))
}

pub fn dict_set(ctx: &mut dyn Ctx, dict: ObjRef, key: Value, value: Value) -> PyResult<()> {
    match dict_find(ctx, dict, &key)? {
        Some(slot) => with_storage_mut(ctx, dict, |s| s.set_value_at(slot, value)),
        None => {
            let hash = value_hash(ctx, &key)?;
            with_storage_mut(ctx, dict, |s| s.push(hash, key, value));
        }
    }
    Ok(())
}

pub fn dict_remove(ctx: &mut dyn Ctx, dict: ObjRef, key: &Value) -> PyResult<Option<Value>> {
    let Some(slot) = dict_find(ctx, dict, key)? else {
        return Ok(None);
    };
    Ok(with_storage_mut(ctx, dict, |s| s.remove_at(slot)))
}

pub fn dict_len(ctx: &dyn Ctx, dict: ObjRef) -> usize {
    with_storage(ctx, dict, |s| s.len())
}

/// Allocate an iterator object over a dict projection.
pub fn new_dict_iter(ctx: &mut dyn Ctx, dict: ObjRef, kind: DictViewKind) -> PyResult<Value> {
    let iter = ctx.alloc(PyObject::new(
        TypeId::DICT_ITER,
        Payload::Iter(IterData::Dict {
            dict,
            slot: 0,
            kind,
        }),
    ))?;
    Ok(Value::Object(iter))
}

#[cfg(test)]
mod tests {
    // The protocol needs a live machine; behavior is covered by the VM
    // crate's integration tests.
}
