//! Generator objects.
//!
//! Calling a function whose code carries the GENERATOR flag builds one
//! of these instead of running the body. The captured frame preserves
//! registers, instruction pointer and exception stash across
//! suspensions; identity is stable across yields.

use opal_core::ObjRef;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Created, body not yet entered.
    Created,
    /// Suspended at a yield.
    Suspended,
    /// Currently executing (re-entry is a ValueError).
    Running,
    /// Returned or raised; every further resume raises StopIteration.
    Done,
}

#[derive(Debug)]
pub struct GeneratorData {
    /// The captured execution frame.
    pub frame: ObjRef,
    pub state: GenState,
    pub qualname: Arc<str>,
}

impl GeneratorData {
    pub fn new(frame: ObjRef, qualname: Arc<str>) -> Self {
        GeneratorData {
            frame,
            state: GenState::Created,
            qualname,
        }
    }
}

// =============================================================================
// Prototype
// =============================================================================

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, TypePrototype};
use opal_core::Value;

pub static PROTOTYPE: TypePrototype = TypePrototype {
    iter: Some(gen_iter),
    next: Some(gen_next),
    methods: &[
        MethodDef {
            name: "send",
            func: gen_send,
        },
        MethodDef {
            name: "close",
            func: gen_close,
        },
    ],
    ..TypePrototype::empty("generator")
};

fn as_generator(ctx: &mut dyn Ctx, v: &Value) -> PyResult<opal_core::ObjRef> {
    if let Value::Object(r) = v {
        if matches!(ctx.heap().get(*r).payload, Payload::Generator(_)) {
            return Ok(*r);
        }
    }
    Err(ctx.raise(
        ExcKind::TypeError,
        "descriptor requires a 'generator' receiver".to_string(),
    ))
}

fn gen_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    as_generator(ctx, v)?;
    Ok(v.clone())
}

fn gen_next(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Option<Value>> {
    let gen = as_generator(ctx, v)?;
    ctx.resume_generator(gen, Value::None)
}

fn gen_send(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "send", args, 1, 1)?;
    let gen = as_generator(ctx, recv)?;
    match ctx.resume_generator(gen, args[0].clone())? {
        Some(value) => Ok(value),
        None => Err(ctx.raise(ExcKind::StopIteration, String::new())),
    }
}

fn gen_close(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "close", args, 0, 0)?;
    let gen = as_generator(ctx, recv)?;
    ctx.close_generator(gen)?;
    Ok(Value::None)
}
