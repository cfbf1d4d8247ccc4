//! Bytes: immutable byte sequence values.

use crate::context::{Ctx, PyResult};
use crate::object::TypePrototype;
use opal_core::Value;

pub static PROTOTYPE: TypePrototype = TypePrototype {
    add: Some(bytes_add),
    len: Some(bytes_len),
    getitem: Some(bytes_getitem),
    ..TypePrototype::empty("bytes")
};

fn bytes_add(_ctx: &mut dyn Ctx, a: &Value, b: &Value) -> PyResult<Value> {
    match (a, b) {
        (Value::Bytes(x), Value::Bytes(y)) => {
            let mut out = Vec::with_capacity(x.len() + y.len());
            out.extend_from_slice(x);
            out.extend_from_slice(y);
            Ok(Value::Bytes(out.into()))
        }
        _ => Ok(Value::NotImplemented),
    }
}

fn bytes_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    match v {
        Value::Bytes(b) => Ok(b.len()),
        _ => Err(ctx.raise(
            crate::context::ExcKind::TypeError,
            "descriptor requires a 'bytes' receiver".to_string(),
        )),
    }
}

/// Indexing bytes yields the byte as an integer.
fn bytes_getitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let Value::Bytes(b) = v else {
        return Err(ctx.raise(
            crate::context::ExcKind::TypeError,
            "descriptor requires a 'bytes' receiver".to_string(),
        ));
    };
    let b = b.clone();
    let index = super::normalize_index(ctx, key, b.len(), "bytes")?;
    Ok(Value::int(b[index] as i64))
}
