//! Per-type operation slots.
//!
//! Every built-in type has exactly one [`TypePrototype`]: a table of
//! optional function pointers for the operations the type supports, plus
//! a named-method table. Dispatch checks the slot pointer directly; an
//! absent slot means the operation falls through to the generic protocol
//! (reflected operand, user `__op__` lookup, or a TypeError).
//!
//! Equality, ordering, hashing and repr are dispatched centrally in
//! [`crate::protocol`], which knows the built-in payloads; the slots
//! here cover the shape-specific operations (concatenation, subscripts,
//! iteration, calls) and the named methods.
//!
//! User classes have no prototype; their behavior is defined entirely by
//! dunder entries in the class dict, resolved through the MRO.

use crate::context::{Ctx, PyResult};
use opal_core::Value;

/// `op(ctx, receiver, operand)`, returning `NotImplemented` when the
/// operand combination is unsupported.
pub type BinarySlot = fn(&mut dyn Ctx, &Value, &Value) -> PyResult<Value>;
/// `receiver(args...)`.
pub type CallSlot = fn(&mut dyn Ctx, &Value, &[Value]) -> PyResult<Value>;
/// `receiver[key]`.
pub type GetItemSlot = fn(&mut dyn Ctx, &Value, &Value) -> PyResult<Value>;
/// `receiver[key] = value`.
pub type SetItemSlot = fn(&mut dyn Ctx, &Value, &Value, &Value) -> PyResult<()>;
/// `del receiver[key]`.
pub type DelItemSlot = fn(&mut dyn Ctx, &Value, &Value) -> PyResult<()>;
/// Element count.
pub type LenSlot = fn(&mut dyn Ctx, &Value) -> PyResult<usize>;
/// Produce an iterator over the receiver.
pub type IterSlot = fn(&mut dyn Ctx, &Value) -> PyResult<Value>;
/// Advance an iterator; `Ok(None)` signals exhaustion.
pub type NextSlot = fn(&mut dyn Ctx, &Value) -> PyResult<Option<Value>>;
/// Membership test: `needle in receiver`.
pub type ContainsSlot = fn(&mut dyn Ctx, &Value, &Value) -> PyResult<bool>;
/// A named method: `method(ctx, receiver, args)`.
pub type MethodSlot = fn(&mut dyn Ctx, &Value, &[Value]) -> PyResult<Value>;

/// A named built-in method.
pub struct MethodDef {
    pub name: &'static str,
    pub func: MethodSlot,
}

/// The slot table for one built-in type.
pub struct TypePrototype {
    pub name: &'static str,

    pub add: Option<BinarySlot>,
    pub mul: Option<BinarySlot>,

    pub len: Option<LenSlot>,
    pub getitem: Option<GetItemSlot>,
    pub setitem: Option<SetItemSlot>,
    pub delitem: Option<DelItemSlot>,
    pub contains: Option<ContainsSlot>,

    pub iter: Option<IterSlot>,
    pub next: Option<NextSlot>,

    pub call: Option<CallSlot>,

    pub methods: &'static [MethodDef],
}

impl TypePrototype {
    /// A prototype with every slot absent; type modules fill in what
    /// they support.
    pub const fn empty(name: &'static str) -> TypePrototype {
        TypePrototype {
            name,
            add: None,
            mul: None,
            len: None,
            getitem: None,
            setitem: None,
            delitem: None,
            contains: None,
            iter: None,
            next: None,
            call: None,
            methods: &[],
        }
    }

    pub fn method(&self, name: &str) -> Option<&'static MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}
