//! The attribute protocol.
//!
//! Lookup order, for an instance attribute access `obj.name`:
//!
//! 1. Walk the MRO of `type(obj)` for a class-level entry.
//! 2. If that entry is a data descriptor (its type defines `__set__`),
//!    its `__get__` wins over everything.
//! 3. Otherwise the instance attribute map.
//! 4. Otherwise the class entry: non-data descriptors (`__get__`,
//!    functions, built-in functions) bind to the instance; anything
//!    else is returned as-is.
//! 5. Otherwise AttributeError.

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{Payload, PyObject, TypeId};
use crate::protocol::{type_id_of, type_name};
use crate::types::function::BoundMethodData;
use opal_core::{intern, ObjRef, Value};

/// Walk a type object's MRO looking for a class-dict entry.
pub fn type_lookup(ctx: &dyn Ctx, type_obj: ObjRef, name: &str) -> Option<Value> {
    let mro = ctx.heap().get(type_obj).payload.as_type()?.mro.clone();
    for entry in mro {
        if let Some(v) = ctx.heap().get(entry).attrs.get(name) {
            return Some(v.clone());
        }
    }
    None
}

/// Whether a class attribute is a data descriptor: its type defines
/// `__set__` (built-in callables never are).
fn is_data_descriptor(ctx: &mut dyn Ctx, attr: &Value) -> PyResult<bool> {
    let Value::Object(_) = attr else {
        return Ok(false);
    };
    let tid = type_id_of(ctx, attr);
    if tid.is_builtin() {
        return Ok(false);
    }
    let attr_type = ctx.type_object(tid)?;
    Ok(type_lookup(ctx, attr_type, "__set__").is_some())
}

/// Bind a class-dict entry to an instance: functions become bound
/// methods, descriptors run `__get__`, plain values pass through.
pub fn bind_class_attr(ctx: &mut dyn Ctx, attr: Value, receiver: Value) -> PyResult<Value> {
    if let Value::Object(r) = &attr {
        match &ctx.heap().get(*r).payload {
            Payload::Function(_) | Payload::BuiltinFunction(_) => {
                let bound = ctx.alloc(PyObject::new(
                    TypeId::BOUND_METHOD,
                    Payload::BoundMethod(BoundMethodData {
                        func: attr.clone(),
                        receiver,
                    }),
                ))?;
                return Ok(Value::Object(bound));
            }
            _ => {}
        }
        // User descriptor protocol.
        let tid = type_id_of(ctx, &attr);
        if !tid.is_builtin() {
            let attr_type = ctx.type_object(tid)?;
            if let Some(getter) = type_lookup(ctx, attr_type, "__get__") {
                let owner = ctx.type_object(type_id_of(ctx, &receiver))?;
                return ctx.call(getter, &[attr.clone(), receiver, Value::Object(owner)]);
            }
        }
    }
    Ok(attr)
}

/// `obj.name`.
pub fn get_attribute(ctx: &mut dyn Ctx, obj: &Value, name: &str) -> PyResult<Value> {
    // Attribute access on a class looks through the class's own MRO and
    // does not bind.
    if let Value::Object(r) = obj {
        if ctx.heap().get(*r).payload.as_type().is_some() {
            if let Some(v) = type_lookup(ctx, *r, name) {
                return Ok(v);
            }
            let tname = ctx
                .heap()
                .get(*r)
                .payload
                .as_type()
                .map(|t| t.name.to_string())
                .unwrap_or_default();
            return Err(ctx.raise(
                ExcKind::AttributeError,
                format!("type object '{tname}' has no attribute '{name}'"),
            ));
        }
    }

    let type_obj = ctx.type_object(type_id_of(ctx, obj))?;
    let class_attr = type_lookup(ctx, type_obj, name);

    if let Some(attr) = &class_attr {
        if is_data_descriptor(ctx, attr)? {
            return bind_class_attr(ctx, attr.clone(), obj.clone());
        }
    }

    if let Value::Object(r) = obj {
        if let Some(v) = ctx.heap().get(*r).get_attr(name) {
            return Ok(v);
        }
    }

    if let Some(attr) = class_attr {
        return bind_class_attr(ctx, attr, obj.clone());
    }

    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::AttributeError,
        format!("'{tname}' object has no attribute '{name}'"),
    ))
}

/// `obj.name = value`.
pub fn set_attribute(ctx: &mut dyn Ctx, obj: &Value, name: &str, value: Value) -> PyResult<()> {
    // Class attribute assignment goes straight to the class dict.
    if let Value::Object(r) = obj {
        if ctx.heap().get(*r).payload.as_type().is_some() {
            ctx.heap_mut().get_mut(*r).set_attr(intern(name), value);
            return Ok(());
        }
    }

    let type_obj = ctx.type_object(type_id_of(ctx, obj))?;
    if let Some(attr) = type_lookup(ctx, type_obj, name) {
        if is_data_descriptor(ctx, &attr)? {
            let tid = type_id_of(ctx, &attr);
            let attr_type = ctx.type_object(tid)?;
            if let Some(setter) = type_lookup(ctx, attr_type, "__set__") {
                ctx.call(setter, &[attr, obj.clone(), value])?;
                return Ok(());
            }
        }
    }

    if let Value::Object(r) = obj {
        ctx.heap_mut().get_mut(*r).set_attr(intern(name), value);
        return Ok(());
    }

    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::AttributeError,
        format!("'{tname}' object has no settable attributes"),
    ))
}

/// `del obj.name`.
pub fn del_attribute(ctx: &mut dyn Ctx, obj: &Value, name: &str) -> PyResult<()> {
    if let Value::Object(r) = obj {
        if ctx.heap_mut().get_mut(*r).attrs.remove(name).is_some() {
            return Ok(());
        }
    }
    let tname = type_name(ctx, obj);
    Err(ctx.raise(
        ExcKind::AttributeError,
        format!("'{tname}' object has no attribute '{name}'"),
    ))
}
