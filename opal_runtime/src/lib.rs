//! Opal runtime object model.
//!
//! Defines the heap object representation ([`object::PyObject`]), the
//! per-type slot tables ([`object::TypePrototype`]), the attribute and
//! operation dispatch protocols, and every built-in type the interpreter
//! requires. The virtual machine implements [`Ctx`] and drives
//! everything here; this crate never owns an instruction pointer.

pub mod context;
pub mod object;
pub mod protocol;
pub mod types;

pub use context::{Ctx, ExcKind, PyResult, Raised};
pub use object::{Payload, PyObject, TypeData, TypeFlags, TypeId, TypePrototype};
