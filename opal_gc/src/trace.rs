//! Graph visitation protocol.

use opal_core::{ObjRef, Value};

/// Implemented by every heap-managed type to enumerate the objects it
/// keeps alive.
pub trait Trace {
    /// Report every owned object handle to the tracer.
    fn trace(&self, tracer: &mut Tracer);
}

/// Mark-phase visitor handed to [`Trace::trace`].
///
/// Visits are idempotent: the collector marks each object the first time
/// it is reported and ignores re-visits, so cyclic graphs terminate.
pub struct Tracer {
    pending: Vec<ObjRef>,
}

impl Tracer {
    pub(crate) fn new() -> Self {
        Tracer {
            pending: Vec::new(),
        }
    }

    /// Visit an object handle.
    #[inline]
    pub fn visit(&mut self, obj: ObjRef) {
        self.pending.push(obj);
    }

    /// Visit a value, following it if it holds an object handle.
    #[inline]
    pub fn visit_value(&mut self, value: &Value) {
        if let Value::Object(obj) = value {
            self.pending.push(*obj);
        }
    }

    /// Visit a slice of values.
    #[inline]
    pub fn visit_values(&mut self, values: &[Value]) {
        for v in values {
            self.visit_value(v);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<ObjRef> {
        self.pending.pop()
    }
}
