//! Built-in type implementations.
//!
//! Each module defines its payload data (where it has any) and its
//! [`TypePrototype`] slot table. [`prototype_of`] is the registry the
//! dispatch layer consults; it is a plain static table, so prototypes
//! exist exactly once per process.

pub mod bytes;
pub mod dict;
pub mod frame;
pub mod function;
pub mod generator;
pub mod iter;
pub mod list;
pub mod misc;
pub mod range;
pub mod set;
pub mod str_type;
pub mod tuple;

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{Payload, TypeId, TypePrototype};
use opal_core::{ObjRef, Value};

/// The slot table for a built-in type id, `None` for user classes.
pub fn prototype_of(tid: TypeId) -> Option<&'static TypePrototype> {
    Some(match tid {
        TypeId::NONE => &misc::NONE_PROTO,
        TypeId::BOOL => &misc::BOOL_PROTO,
        TypeId::INT => &misc::INT_PROTO,
        TypeId::FLOAT => &misc::FLOAT_PROTO,
        TypeId::STR => &str_type::PROTOTYPE,
        TypeId::BYTES => &bytes::PROTOTYPE,
        TypeId::ELLIPSIS => &misc::ELLIPSIS_PROTO,
        TypeId::NOT_IMPLEMENTED => &misc::NOT_IMPLEMENTED_PROTO,
        TypeId::OBJECT => &misc::OBJECT_PROTO,
        TypeId::TYPE => &misc::TYPE_PROTO,
        TypeId::TUPLE => &tuple::PROTOTYPE,
        TypeId::LIST => &list::PROTOTYPE,
        TypeId::DICT => &dict::PROTOTYPE,
        TypeId::SET => &set::PROTOTYPE,
        TypeId::RANGE => &range::PROTOTYPE,
        TypeId::SLICE => &misc::SLICE_PROTO,
        TypeId::FUNCTION => &misc::FUNCTION_PROTO,
        TypeId::BUILTIN_FUNCTION => &misc::BUILTIN_FUNCTION_PROTO,
        TypeId::BOUND_METHOD => &misc::BOUND_METHOD_PROTO,
        TypeId::CELL => &misc::CELL_PROTO,
        TypeId::CODE => &misc::CODE_PROTO,
        TypeId::FRAME => &misc::FRAME_PROTO,
        TypeId::GENERATOR => &generator::PROTOTYPE,
        TypeId::MODULE => &misc::MODULE_PROTO,
        TypeId::LIST_ITER
        | TypeId::TUPLE_ITER
        | TypeId::STR_ITER
        | TypeId::RANGE_ITER
        | TypeId::DICT_ITER
        | TypeId::SET_ITER => &iter::ITER_PROTOTYPE,
        TypeId::DICT_VIEW => &iter::VIEW_PROTOTYPE,
        _ => return None,
    })
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Enforce a method's positional arity.
pub(crate) fn check_arity(
    ctx: &mut dyn Ctx,
    name: &str,
    args: &[Value],
    min: usize,
    max: usize,
) -> PyResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(ctx.raise(
            ExcKind::TypeError,
            format!(
                "{name}() takes {expected} argument(s) but {} were given",
                args.len()
            ),
        ));
    }
    Ok(())
}

/// The heap object behind a receiver whose payload the caller will
/// match; raises TypeError for non-objects.
pub(crate) fn receiver_ref(
    ctx: &mut dyn Ctx,
    v: &Value,
    expected: &str,
) -> PyResult<ObjRef> {
    match v {
        Value::Object(r) => Ok(*r),
        _ => {
            let got = crate::protocol::type_name(ctx, v);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("descriptor requires a '{expected}' receiver, got '{got}'"),
            ))
        }
    }
}

/// Resolve an integer index with negative wrap-around.
pub(crate) fn normalize_index(
    ctx: &mut dyn Ctx,
    key: &Value,
    len: usize,
    what: &'static str,
) -> PyResult<usize> {
    let Some(mut i) = key.as_i64() else {
        let got = crate::protocol::type_name(ctx, key);
        return Err(ctx.raise(
            ExcKind::TypeError,
            format!("{what} indices must be integers, not '{got}'"),
        ));
    };
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i as usize >= len {
        return Err(ctx.raise(ExcKind::IndexError, format!("{what} index out of range")));
    }
    Ok(i as usize)
}

/// Resolve a slice object against a sequence length, yielding the
/// element indices it selects, in order.
pub(crate) fn slice_indices(
    ctx: &mut dyn Ctx,
    slice: ObjRef,
    len: usize,
) -> PyResult<Vec<usize>> {
    let (start, stop, step) = match &ctx.heap().get(slice).payload {
        Payload::Slice { start, stop, step } => (start.clone(), stop.clone(), step.clone()),
        _ => unreachable!("slice_indices on non-slice"),
    };

    let step = match &step {
        Value::None => 1,
        v => v
            .as_i64()
            .ok_or_else(|| {
                ctx.raise(
                    ExcKind::TypeError,
                    "slice indices must be integers or None".to_string(),
                )
            })?,
    };
    if step == 0 {
        return Err(ctx.raise(
            ExcKind::ValueError,
            "slice step cannot be zero".to_string(),
        ));
    }

    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);

    let to_i64 = |ctx: &mut dyn Ctx, v: &Value| -> PyResult<Option<i64>> {
        match v {
            Value::None => Ok(None),
            v => match v.as_i64() {
                Some(i) => Ok(Some(i)),
                None => Err(ctx.raise(
                    ExcKind::TypeError,
                    "slice indices must be integers or None".to_string(),
                )),
            },
        }
    };

    let start_i = to_i64(ctx, &start)?;
    let stop_i = to_i64(ctx, &stop)?;

    let (default_start, default_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
    let adjust = |i: Option<i64>, default: i64| -> i64 {
        match i {
            None => default,
            Some(mut i) => {
                if i < 0 {
                    i += len;
                }
                if step > 0 {
                    clamp(i, 0, len)
                } else {
                    clamp(i, -1, len - 1)
                }
            }
        }
    };
    let start = adjust(start_i, default_start);
    let stop = adjust(stop_i, default_stop);

    let mut indices = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            indices.push(i as usize);
            i += step;
        }
    } else {
        while i > stop {
            indices.push(i as usize);
            i += step;
        }
    }
    Ok(indices)
}
