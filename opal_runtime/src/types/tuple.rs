//! Tuple: immutable fixed-length sequence.

use super::{check_arity, normalize_index, receiver_ref, slice_indices};
use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, PyObject, TypeId, TypePrototype};
use crate::protocol;
use crate::types::iter::IterData;
use opal_core::{ObjRef, Value};

pub static PROTOTYPE: TypePrototype = TypePrototype {
    add: Some(tuple_add),
    len: Some(tuple_len),
    getitem: Some(tuple_getitem),
    contains: Some(tuple_contains),
    iter: Some(tuple_iter),
    methods: &[
        MethodDef {
            name: "index",
            func: tuple_index,
        },
        MethodDef {
            name: "count",
            func: tuple_count,
        },
    ],
    ..TypePrototype::empty("tuple")
};

fn as_tuple(ctx: &mut dyn Ctx, v: &Value) -> PyResult<ObjRef> {
    let r = receiver_ref(ctx, v, "tuple")?;
    match &ctx.heap().get(r).payload {
        Payload::Tuple(_) => Ok(r),
        _ => {
            let got = protocol::type_name(ctx, v);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("descriptor requires a 'tuple' receiver, got '{got}'"),
            ))
        }
    }
}

fn items(ctx: &dyn Ctx, tuple: ObjRef) -> Vec<Value> {
    match &ctx.heap().get(tuple).payload {
        Payload::Tuple(items) => items.clone(),
        _ => unreachable!("receiver checked by as_tuple"),
    }
}

pub fn new_tuple(ctx: &mut dyn Ctx, items: Vec<Value>) -> PyResult<Value> {
    let r = ctx.alloc(PyObject::new(TypeId::TUPLE, Payload::Tuple(items)))?;
    Ok(Value::Object(r))
}

fn tuple_add(ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    let (Value::Object(x), Value::Object(y)) = (a, b) else {
        return Ok(Value::NotImplemented);
    };
    match (&ctx.heap().get(*x).payload, &ctx.heap().get(*y).payload) {
        (Payload::Tuple(xs), Payload::Tuple(ys)) => {
            let mut out = xs.clone();
            out.extend(ys.iter().cloned());
            new_tuple(ctx, out)
        }
        _ => Ok(Value::NotImplemented),
    }
}

fn tuple_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    let t = as_tuple(ctx, v)?;
    Ok(items(ctx, t).len())
}

fn tuple_getitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let t = as_tuple(ctx, v)?;

    if let Value::Object(k) = key {
        if matches!(ctx.heap().get(*k).payload, Payload::Slice { .. }) {
            let xs = items(ctx, t);
            let indices = slice_indices(ctx, *k, xs.len())?;
            let selected = indices.into_iter().map(|i| xs[i].clone()).collect();
            return new_tuple(ctx, selected);
        }
    }

    let xs = items(ctx, t);
    let index = normalize_index(ctx, key, xs.len(), "tuple")?;
    Ok(xs[index].clone())
}

fn tuple_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let t = as_tuple(ctx, v)?;
    for item in items(ctx, t) {
        if protocol::value_eq(ctx, &item, needle)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tuple_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let t = as_tuple(ctx, v)?;
    let iter = ctx.alloc(PyObject::new(
        TypeId::TUPLE_ITER,
        Payload::Iter(IterData::Tuple { tuple: t, index: 0 }),
    ))?;
    Ok(Value::Object(iter))
}

fn tuple_index(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "index", args, 1, 1)?;
    let t = as_tuple(ctx, recv)?;
    for (i, item) in items(ctx, t).into_iter().enumerate() {
        if protocol::value_eq(ctx, &item, &args[0])? {
            return Ok(Value::int(i as i64));
        }
    }
    Err(ctx.raise(ExcKind::ValueError, "value not in tuple".to_string()))
}

fn tuple_count(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "count", args, 1, 1)?;
    let t = as_tuple(ctx, recv)?;
    let mut count = 0i64;
    for item in items(ctx, t) {
        if protocol::value_eq(ctx, &item, &args[0])? {
            count += 1;
        }
    }
    Ok(Value::int(count))
}
