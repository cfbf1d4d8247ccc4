//! List: mutable sequence.

use super::{check_arity, normalize_index, receiver_ref, slice_indices};
use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, PyObject, TypeId, TypePrototype};
use crate::protocol::{self, CmpKind};
use crate::types::iter::IterData;
use opal_core::{ObjRef, Value};

pub static PROTOTYPE: TypePrototype = TypePrototype {
    add: Some(list_add),
    mul: Some(list_mul),
    len: Some(list_len),
    getitem: Some(list_getitem),
    setitem: Some(list_setitem),
    delitem: Some(list_delitem),
    contains: Some(list_contains),
    iter: Some(list_iter),
    methods: &[
        MethodDef {
            name: "append",
            func: list_append,
        },
        MethodDef {
            name: "extend",
            func: list_extend,
        },
        MethodDef {
            name: "pop",
            func: list_pop,
        },
        MethodDef {
            name: "insert",
            func: list_insert,
        },
        MethodDef {
            name: "remove",
            func: list_remove,
        },
        MethodDef {
            name: "index",
            func: list_index,
        },
        MethodDef {
            name: "count",
            func: list_count,
        },
        MethodDef {
            name: "clear",
            func: list_clear,
        },
        MethodDef {
            name: "reverse",
            func: list_reverse,
        },
        MethodDef {
            name: "sort",
            func: list_sort,
        },
        MethodDef {
            name: "copy",
            func: list_copy,
        },
    ],
    ..TypePrototype::empty("list")
};

/// The list object behind a receiver, or TypeError.
fn as_list(ctx: &mut dyn Ctx, v: &Value) -> PyResult<ObjRef> {
    let r = receiver_ref(ctx, v, "list")?;
    match &ctx.heap().get(r).payload {
        Payload::List(_) => Ok(r),
        _ => {
            let got = protocol::type_name(ctx, v);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("descriptor requires a 'list' receiver, got '{got}'"),
            ))
        }
    }
}

fn items(ctx: &dyn Ctx, list: ObjRef) -> Vec<Value> {
    match &ctx.heap().get(list).payload {
        Payload::List(items) => items.clone(),
        _ => unreachable!("receiver checked by as_list"),
    }
}

fn with_items<R>(ctx: &mut dyn Ctx, list: ObjRef, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
    match &mut ctx.heap_mut().get_mut(list).payload {
        Payload::List(items) => f(items),
        _ => unreachable!("receiver checked by as_list"),
    }
}

pub fn new_list(ctx: &mut dyn Ctx, items: Vec<Value>) -> PyResult<Value> {
    let r = ctx.alloc(PyObject::new(TypeId::LIST, Payload::List(items)))?;
    Ok(Value::Object(r))
}

// =============================================================================
// Slots
// =============================================================================

fn list_add(ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    let (Value::Object(x), Value::Object(y)) = (a, b) else {
        return Ok(Value::NotImplemented);
    };
    let (pa, pb) = (&ctx.heap().get(*x).payload, &ctx.heap().get(*y).payload);
    match (pa, pb) {
        (Payload::List(xs), Payload::List(ys)) => {
            let mut out = xs.clone();
            out.extend(ys.iter().cloned());
            new_list(ctx, out)
        }
        _ => Ok(Value::NotImplemented),
    }
}

fn list_mul(ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    // Receiver may be either operand (list * n or n * list).
    let (list_val, count_val) = if matches!(a, Value::Object(_)) {
        (a, b)
    } else {
        (b, a)
    };
    let Some(n) = count_val.as_i64() else {
        return Ok(Value::NotImplemented);
    };
    let Value::Object(r) = list_val else {
        return Ok(Value::NotImplemented);
    };
    let Payload::List(xs) = &ctx.heap().get(*r).payload else {
        return Ok(Value::NotImplemented);
    };
    let xs = xs.clone();
    let n = n.max(0) as usize;
    let mut out = Vec::with_capacity(xs.len() * n);
    for _ in 0..n {
        out.extend(xs.iter().cloned());
    }
    new_list(ctx, out)
}

fn list_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    let list = as_list(ctx, v)?;
    Ok(items(ctx, list).len())
}

fn list_getitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let list = as_list(ctx, v)?;

    // A slice subscript produces a new list.
    if let Value::Object(k) = key {
        if matches!(ctx.heap().get(*k).payload, Payload::Slice { .. }) {
            let xs = items(ctx, list);
            let indices = slice_indices(ctx, *k, xs.len())?;
            let selected = indices.into_iter().map(|i| xs[i].clone()).collect();
            return new_list(ctx, selected);
        }
    }

    let xs = items(ctx, list);
    let index = normalize_index(ctx, key, xs.len(), "list")?;
    Ok(xs[index].clone())
}

fn list_setitem(ctx: &mut dyn Ctx, v: &Value, key: &Value, value: &Value) -> PyResult<()> {
    let list = as_list(ctx, v)?;
    let len = items(ctx, list).len();
    let index = normalize_index(ctx, key, len, "list")?;
    with_items(ctx, list, |xs| xs[index] = value.clone());
    Ok(())
}

fn list_delitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<()> {
    let list = as_list(ctx, v)?;
    let len = items(ctx, list).len();
    let index = normalize_index(ctx, key, len, "list")?;
    with_items(ctx, list, |xs| {
        xs.remove(index);
    });
    Ok(())
}

fn list_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let list = as_list(ctx, v)?;
    for item in items(ctx, list) {
        if protocol::value_eq(ctx, &item, needle)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The iterator holds a strong reference to the list, so iterating a
/// temporary keeps it alive across collections.
fn list_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let list = as_list(ctx, v)?;
    let iter = ctx.alloc(PyObject::new(
        TypeId::LIST_ITER,
        Payload::Iter(IterData::List { list, index: 0 }),
    ))?;
    Ok(Value::Object(iter))
}

// =============================================================================
// Methods
// =============================================================================

fn list_append(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "append", args, 1, 1)?;
    let list = as_list(ctx, recv)?;
    let item = args[0].clone();
    with_items(ctx, list, |xs| xs.push(item));
    Ok(Value::None)
}

fn list_extend(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "extend", args, 1, 1)?;
    let list = as_list(ctx, recv)?;
    let iter = protocol::get_iter(ctx, &args[0])?;
    while let Some(item) = protocol::iter_next(ctx, &iter)? {
        with_items(ctx, list, |xs| xs.push(item));
    }
    Ok(Value::None)
}

fn list_pop(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "pop", args, 0, 1)?;
    let list = as_list(ctx, recv)?;
    let len = items(ctx, list).len();
    if len == 0 {
        return Err(ctx.raise(ExcKind::IndexError, "pop from empty list".to_string()));
    }
    let index = match args.first() {
        Some(v) => normalize_index(ctx, v, len, "list")?,
        None => len - 1,
    };
    Ok(with_items(ctx, list, |xs| xs.remove(index)))
}

fn list_insert(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "insert", args, 2, 2)?;
    let list = as_list(ctx, recv)?;
    let len = items(ctx, list).len();
    let Some(mut at) = args[0].as_i64() else {
        return Err(ctx.raise(
            ExcKind::TypeError,
            "insert position must be an integer".to_string(),
        ));
    };
    if at < 0 {
        at += len as i64;
    }
    let at = at.clamp(0, len as i64) as usize;
    let item = args[1].clone();
    with_items(ctx, list, |xs| xs.insert(at, item));
    Ok(Value::None)
}

fn list_remove(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "remove", args, 1, 1)?;
    let list = as_list(ctx, recv)?;
    for (i, item) in items(ctx, list).into_iter().enumerate() {
        if protocol::value_eq(ctx, &item, &args[0])? {
            with_items(ctx, list, |xs| {
                xs.remove(i);
            });
            return Ok(Value::None);
        }
    }
    Err(ctx.raise(
        ExcKind::ValueError,
        "list.remove(x): x not in list".to_string(),
    ))
}

fn list_index(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "index", args, 1, 1)?;
    let list = as_list(ctx, recv)?;
    for (i, item) in items(ctx, list).into_iter().enumerate() {
        if protocol::value_eq(ctx, &item, &args[0])? {
            return Ok(Value::int(i as i64));
        }
    }
    Err(ctx.raise(ExcKind::ValueError, "value not in list".to_string()))
}

fn list_count(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "count", args, 1, 1)?;
    let list = as_list(ctx, recv)?;
    let mut count = 0i64;
    for item in items(ctx, list) {
        if protocol::value_eq(ctx, &item, &args[0])? {
            count += 1;
        }
    }
    Ok(Value::int(count))
}

fn list_clear(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "clear", args, 0, 0)?;
    let list = as_list(ctx, recv)?;
    with_items(ctx, list, |xs| xs.clear());
    Ok(Value::None)
}

fn list_reverse(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "reverse", args, 0, 0)?;
    let list = as_list(ctx, recv)?;
    with_items(ctx, list, |xs| xs.reverse());
    Ok(Value::None)
}

/// In-place stable sort. Comparison dispatches through the rich
/// comparison protocol, so user `__lt__` participates; a binary
/// insertion sort keeps the comparison count reasonable without needing
/// a key function.
fn list_sort(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "sort", args, 0, 0)?;
    let list = as_list(ctx, recv)?;
    let mut xs = items(ctx, list);

    for i in 1..xs.len() {
        let current = xs[i].clone();
        let mut j = i;
        while j > 0 {
            let lt = protocol::rich_compare(ctx, CmpKind::Lt, &current, &xs[j - 1])?;
            if !protocol::truthy(ctx, &lt)? {
                break;
            }
            xs[j] = xs[j - 1].clone();
            j -= 1;
        }
        xs[j] = current;
    }

    with_items(ctx, list, |items| *items = xs);
    Ok(Value::None)
}

fn list_copy(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "copy", args, 0, 0)?;
    let list = as_list(ctx, recv)?;
    let xs = items(ctx, list);
    new_list(ctx, xs)
}
