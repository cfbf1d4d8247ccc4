//! Function, builtin-function and bound-method payloads.

use crate::context::{Ctx, PyResult};
use opal_compiler::CodeObject;
use opal_core::{ObjRef, Value};
use opal_gc::Tracer;
use std::sync::Arc;

/// A compiled script function: code plus everything captured at
/// `MakeFunction` time.
pub struct FunctionData {
    pub code: Arc<CodeObject>,
    /// The defining module's globals dict object.
    pub globals: ObjRef,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    /// Defaults for keyword-only parameters.
    pub kw_defaults: Vec<(Arc<str>, Value)>,
    /// Captured cells, parallel to the code object's freevars.
    pub closure: Vec<ObjRef>,
    pub qualname: Arc<str>,
}

impl std::fmt::Debug for FunctionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {}>", self.qualname)
    }
}

impl FunctionData {
    pub(crate) fn trace(&self, tracer: &mut Tracer) {
        tracer.visit(self.globals);
        tracer.visit_values(&self.defaults);
        for (_, v) in &self.kw_defaults {
            tracer.visit_value(v);
        }
        for cell in &self.closure {
            tracer.visit(*cell);
        }
    }
}

/// Signature of a native builtin.
pub type BuiltinFn = fn(&mut dyn Ctx, &[Value]) -> PyResult<Value>;

/// Native implementations come in two calling shapes: free functions
/// (`print`, `len`) and prototype methods, which receive the bound
/// receiver separately.
#[derive(Clone, Copy)]
pub enum BuiltinImpl {
    Function(BuiltinFn),
    Method(crate::object::MethodSlot),
}

/// A native callable exposed to scripts.
pub struct BuiltinFunctionData {
    pub name: Arc<str>,
    pub imp: BuiltinImpl,
}

impl BuiltinFunctionData {
    /// Invoke with the receiver (if any) already folded into `args[0]`
    /// for the method shape.
    pub fn invoke(&self, ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
        match self.imp {
            BuiltinImpl::Function(f) => f(ctx, args),
            BuiltinImpl::Method(m) => match args.split_first() {
                Some((recv, rest)) => m(ctx, recv, rest),
                None => Err(ctx.raise(
                    crate::context::ExcKind::TypeError,
                    format!("{}() needs a receiver argument", self.name),
                )),
            },
        }
    }
}

impl std::fmt::Debug for BuiltinFunctionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// A callable bound to its receiver by the attribute protocol.
#[derive(Debug)]
pub struct BoundMethodData {
    pub func: Value,
    pub receiver: Value,
}
