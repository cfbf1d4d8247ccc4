//! Set: unordered collection backed by the dict storage (keys only).

use super::{check_arity, receiver_ref};
use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, PyObject, TypeId, TypePrototype};
use crate::protocol;
use crate::types::dict::DictStorage;
use crate::types::iter::IterData;
use opal_core::{ObjRef, Value};

pub static PROTOTYPE: TypePrototype = TypePrototype {
    len: Some(set_len),
    contains: Some(set_contains),
    iter: Some(set_iter),
    methods: &[
        MethodDef {
            name: "add",
            func: set_add,
        },
        MethodDef {
            name: "remove",
            func: set_remove,
        },
        MethodDef {
            name: "discard",
            func: set_discard,
        },
        MethodDef {
            name: "clear",
            func: set_clear,
        },
    ],
    ..TypePrototype::empty("set")
};

fn as_set(ctx: &mut dyn Ctx, v: &Value) -> PyResult<ObjRef> {
    let r = receiver_ref(ctx, v, "set")?;
    match &ctx.heap().get(r).payload {
        Payload::Set(_) => Ok(r),
        _ => Err(ctx.raise(
            ExcKind::TypeError,
            "descriptor requires a 'set' receiver".to_string(),
        )),
    }
}

pub fn new_set(ctx: &mut dyn Ctx) -> PyResult<ObjRef> {
    ctx.alloc(PyObject::new(TypeId::SET, Payload::Set(DictStorage::new())))
}

fn set_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    let set = as_set(ctx, v)?;
    Ok(protocol::dict_len(ctx, set))
}

fn set_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let set = as_set(ctx, v)?;
    Ok(protocol::dict_find(ctx, set, needle)?.is_some())
}

fn set_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let set = as_set(ctx, v)?;
    let iter = ctx.alloc(PyObject::new(
        TypeId::SET_ITER,
        Payload::Iter(IterData::Set { set, slot: 0 }),
    ))?;
    Ok(Value::Object(iter))
}

fn set_add(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "add", args, 1, 1)?;
    let set = as_set(ctx, recv)?;
    protocol::dict_set(ctx, set, args[0].clone(), Value::None)?;
    Ok(Value::None)
}

fn set_remove(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "remove", args, 1, 1)?;
    let set = as_set(ctx, recv)?;
    match protocol::dict_remove(ctx, set, &args[0])? {
        Some(_) => Ok(Value::None),
        None => {
            let repr = protocol::repr_value(ctx, &args[0])?;
            Err(ctx.raise(ExcKind::KeyError, repr))
        }
    }
}

fn set_discard(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "discard", args, 1, 1)?;
    let set = as_set(ctx, recv)?;
    protocol::dict_remove(ctx, set, &args[0])?;
    Ok(Value::None)
}

fn set_clear(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "clear", args, 0, 0)?;
    let set = as_set(ctx, recv)?;
    match &mut ctx.heap_mut().get_mut(set).payload {
        Payload::Set(storage) => storage.clear(),
        _ => unreachable!("receiver checked by as_set"),
    }
    Ok(Value::None)
}
