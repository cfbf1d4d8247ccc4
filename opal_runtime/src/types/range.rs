//! Range payload.

/// A half-open arithmetic progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeData {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeData {
    /// Number of elements in the progression.
    pub fn len(&self) -> usize {
        if self.step > 0 && self.start < self.stop {
            ((self.stop - self.start - 1) / self.step + 1) as usize
        } else if self.step < 0 && self.start > self.stop {
            ((self.start - self.stop - 1) / (-self.step) + 1) as usize
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The nth element, if in range.
    pub fn get(&self, index: usize) -> Option<i64> {
        if index < self.len() {
            Some(self.start + self.step * index as i64)
        } else {
            None
        }
    }
}

// =============================================================================
// Prototype
// =============================================================================

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{Payload, PyObject, TypeId, TypePrototype};
use crate::types::iter::IterData;
use opal_core::Value;

pub static PROTOTYPE: TypePrototype = TypePrototype {
    len: Some(range_len),
    getitem: Some(range_getitem),
    contains: Some(range_contains),
    iter: Some(range_iter),
    ..TypePrototype::empty("range")
};

fn as_range(ctx: &mut dyn Ctx, v: &Value) -> PyResult<RangeData> {
    if let Value::Object(r) = v {
        if let Payload::Range(data) = &ctx.heap().get(*r).payload {
            return Ok(*data);
        }
    }
    Err(ctx.raise(
        ExcKind::TypeError,
        "descriptor requires a 'range' receiver".to_string(),
    ))
}

fn range_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    Ok(as_range(ctx, v)?.len())
}

fn range_getitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let range = as_range(ctx, v)?;
    let index = super::normalize_index(ctx, key, range.len(), "range")?;
    Ok(Value::int(range.get(index).expect("index normalized")))
}

fn range_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let range = as_range(ctx, v)?;
    let Some(n) = needle.as_i64() else {
        return Ok(false);
    };
    let in_bounds = if range.step > 0 {
        n >= range.start && n < range.stop
    } else {
        n <= range.start && n > range.stop
    };
    Ok(in_bounds && (n - range.start) % range.step == 0)
}

fn range_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let range = as_range(ctx, v)?;
    let iter = ctx.alloc(PyObject::new(
        TypeId::RANGE_ITER,
        Payload::Iter(IterData::Range {
            next: range.start,
            stop: range.stop,
            step: range.step,
        }),
    ))?;
    Ok(Value::Object(iter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_range() {
        let r = RangeData {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(0), Some(0));
        assert_eq!(r.get(3), Some(9));
        assert_eq!(r.get(4), None);
    }

    #[test]
    fn test_backward_range() {
        let r = RangeData {
            start: 10,
            stop: 0,
            step: -2,
        };
        assert_eq!(r.len(), 5);
        assert_eq!(r.get(0), Some(10));
        assert_eq!(r.get(4), Some(2));
    }

    #[test]
    fn test_empty_range() {
        let r = RangeData {
            start: 5,
            stop: 5,
            step: 1,
        };
        assert!(r.is_empty());
        let r = RangeData {
            start: 0,
            stop: 10,
            step: -1,
        };
        assert!(r.is_empty());
    }
}
