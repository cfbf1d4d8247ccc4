//! String operations.
//!
//! Strings are immutable `Arc<str>` values, not heap objects, so the
//! receiver of every slot and method here is a `Value::Str`.

use super::check_arity;
use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, PyObject, TypeId, TypePrototype};
use crate::protocol;
use crate::types::iter::IterData;
use crate::types::list::new_list;
use opal_core::Value;
use std::sync::Arc;

pub static PROTOTYPE: TypePrototype = TypePrototype {
    add: Some(str_add),
    mul: Some(str_mul),
    len: Some(str_len),
    getitem: Some(str_getitem_slot),
    contains: Some(str_contains),
    iter: Some(str_iter),
    methods: &[
        MethodDef {
            name: "upper",
            func: str_upper,
        },
        MethodDef {
            name: "lower",
            func: str_lower,
        },
        MethodDef {
            name: "strip",
            func: str_strip,
        },
        MethodDef {
            name: "split",
            func: str_split,
        },
        MethodDef {
            name: "join",
            func: str_join,
        },
        MethodDef {
            name: "startswith",
            func: str_startswith,
        },
        MethodDef {
            name: "endswith",
            func: str_endswith,
        },
        MethodDef {
            name: "find",
            func: str_find,
        },
        MethodDef {
            name: "replace",
            func: str_replace,
        },
    ],
    ..TypePrototype::empty("str")
};

fn as_str(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Arc<str>> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        _ => {
            let got = protocol::type_name(ctx, v);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("descriptor requires a 'str' receiver, got '{got}'"),
            ))
        }
    }
}

fn str_add(_ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{x}{y}").into())),
        _ => Ok(Value::NotImplemented),
    }
}

fn str_mul(_ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    let (s, n) = match (a, b) {
        (Value::Str(s), n) | (n, Value::Str(s)) => (s, n),
        _ => return Ok(Value::NotImplemented),
    };
    match n.as_i64() {
        Some(n) => Ok(Value::Str(s.repeat(n.max(0) as usize).into())),
        None => Ok(Value::NotImplemented),
    }
}

fn str_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    Ok(as_str(ctx, v)?.chars().count())
}

fn str_getitem_slot(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let s = as_str(ctx, v)?;
    str_get_item(ctx, &s, key)
}

/// Subscript on a string: integer index or slice, both over characters.
pub fn str_get_item(ctx: &mut dyn Ctx, s: &Arc<str>, key: &Value) -> PyResult<Value> {
    let chars: Vec<char> = s.chars().collect();

    if let Value::Object(k) = key {
        if matches!(ctx.heap().get(*k).payload, Payload::Slice { .. }) {
            let indices = super::slice_indices(ctx, *k, chars.len())?;
            let out: String = indices.into_iter().map(|i| chars[i]).collect();
            return Ok(Value::Str(out.into()));
        }
    }

    let index = super::normalize_index(ctx, key, chars.len(), "string")?;
    Ok(Value::Str(chars[index].to_string().into()))
}

fn str_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let s = as_str(ctx, v)?;
    match needle {
        Value::Str(n) => Ok(s.contains(&**n)),
        _ => {
            let got = protocol::type_name(ctx, needle);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("'in <string>' requires string as left operand, not '{got}'"),
            ))
        }
    }
}

fn str_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let s = as_str(ctx, v)?;
    let iter = ctx.alloc(PyObject::new(
        TypeId::STR_ITER,
        Payload::Iter(IterData::Str {
            string: Value::Str(s),
            index: 0,
        }),
    ))?;
    Ok(Value::Object(iter))
}

// =============================================================================
// Methods
// =============================================================================

fn str_upper(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "upper", args, 0, 0)?;
    Ok(Value::Str(as_str(ctx, recv)?.to_uppercase().into()))
}

fn str_lower(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "lower", args, 0, 0)?;
    Ok(Value::Str(as_str(ctx, recv)?.to_lowercase().into()))
}

fn str_strip(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "strip", args, 0, 1)?;
    let s = as_str(ctx, recv)?;
    match args.first() {
        None => Ok(Value::Str(s.trim().into())),
        Some(Value::Str(chars)) => {
            let set: Vec<char> = chars.chars().collect();
            Ok(Value::Str(s.trim_matches(|c| set.contains(&c)).into()))
        }
        Some(other) => {
            let got = protocol::type_name(ctx, other);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("strip arg must be str, not '{got}'"),
            ))
        }
    }
}

fn str_split(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "split", args, 0, 1)?;
    let s = as_str(ctx, recv)?;
    let parts: Vec<Value> = match args.first() {
        None => s
            .split_whitespace()
            .map(|p| Value::Str(p.into()))
            .collect(),
        Some(Value::Str(sep)) if !sep.is_empty() => {
            s.split(&**sep).map(|p| Value::Str(p.into())).collect()
        }
        Some(Value::Str(_)) => {
            return Err(ctx.raise(ExcKind::ValueError, "empty separator".to_string()));
        }
        Some(other) => {
            let got = protocol::type_name(ctx, other);
            return Err(ctx.raise(
                ExcKind::TypeError,
                format!("separator must be str, not '{got}'"),
            ));
        }
    };
    new_list(ctx, parts)
}

fn str_join(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "join", args, 1, 1)?;
    let sep = as_str(ctx, recv)?;
    let iter = protocol::get_iter(ctx, &args[0])?;
    let mut parts = Vec::new();
    while let Some(item) = protocol::iter_next(ctx, &iter)? {
        match item {
            Value::Str(s) => parts.push(s.to_string()),
            other => {
                let got = protocol::type_name(ctx, &other);
                return Err(ctx.raise(
                    ExcKind::TypeError,
                    format!("sequence item: expected str instance, '{got}' found"),
                ));
            }
        }
    }
    Ok(Value::Str(parts.join(&sep).into()))
}

fn expect_str_arg(
    ctx: &mut dyn Ctx,
    method: &str,
    arg: &Value,
) -> PyResult<Arc<str>> {
    match arg {
        Value::Str(s) => Ok(s.clone()),
        other => {
            let got = protocol::type_name(ctx, other);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("{method} arg must be str, not '{got}'"),
            ))
        }
    }
}

fn str_startswith(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "startswith", args, 1, 1)?;
    let s = as_str(ctx, recv)?;
    let prefix = expect_str_arg(ctx, "startswith", &args[0])?;
    Ok(Value::Bool(s.starts_with(&*prefix)))
}

fn str_endswith(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "endswith", args, 1, 1)?;
    let s = as_str(ctx, recv)?;
    let suffix = expect_str_arg(ctx, "endswith", &args[0])?;
    Ok(Value::Bool(s.ends_with(&*suffix)))
}

fn str_find(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "find", args, 1, 1)?;
    let s = as_str(ctx, recv)?;
    let needle = expect_str_arg(ctx, "find", &args[0])?;
    match s.find(&*needle) {
        // Byte offset converted to a character index.
        Some(byte_pos) => Ok(Value::int(s[..byte_pos].chars().count() as i64)),
        None => Ok(Value::int(-1)),
    }
}

fn str_replace(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    check_arity(ctx, "replace", args, 2, 2)?;
    let s = as_str(ctx, recv)?;
    let from = expect_str_arg(ctx, "replace", &args[0])?;
    let to = expect_str_arg(ctx, "replace", &args[1])?;
    Ok(Value::Str(s.replace(&*from, &to).into()))
}
