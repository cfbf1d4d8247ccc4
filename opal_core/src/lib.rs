//! Core value representation for the Opal runtime.
//!
//! This crate defines the [`Value`] type shared by the compiler, the object
//! model and the virtual machine, together with the numeric tower and the
//! process-wide string interner. It deliberately knows nothing about the
//! heap beyond the opaque [`ObjRef`] handle, so the compiler can embed
//! values in constant pools without dragging in the runtime.

pub mod intern;
pub mod number;
pub mod value;

pub use intern::intern;
pub use number::{binary_op, compare, invert, negate, Int, NumError, NumOp};
pub use value::{ObjRef, Value};
