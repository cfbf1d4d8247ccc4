//! Prototypes for the types with little or no slot behavior of their
//! own: the numeric and singleton values (whose operations live in the
//! numeric tower and the central protocol), and the internal object
//! kinds (functions, frames, cells, modules).

use crate::object::TypePrototype;

pub static NONE_PROTO: TypePrototype = TypePrototype::empty("NoneType");
pub static BOOL_PROTO: TypePrototype = TypePrototype::empty("bool");
pub static INT_PROTO: TypePrototype = TypePrototype::empty("int");
pub static FLOAT_PROTO: TypePrototype = TypePrototype::empty("float");
pub static ELLIPSIS_PROTO: TypePrototype = TypePrototype::empty("ellipsis");
pub static NOT_IMPLEMENTED_PROTO: TypePrototype = TypePrototype::empty("NotImplementedType");
pub static OBJECT_PROTO: TypePrototype = TypePrototype::empty("object");
pub static TYPE_PROTO: TypePrototype = TypePrototype::empty("type");
pub static SLICE_PROTO: TypePrototype = TypePrototype::empty("slice");
pub static FUNCTION_PROTO: TypePrototype = TypePrototype::empty("function");
pub static BUILTIN_FUNCTION_PROTO: TypePrototype =
    TypePrototype::empty("builtin_function_or_method");
pub static BOUND_METHOD_PROTO: TypePrototype = TypePrototype::empty("method");
pub static CELL_PROTO: TypePrototype = TypePrototype::empty("cell");
pub static CODE_PROTO: TypePrototype = TypePrototype::empty("code");
pub static FRAME_PROTO: TypePrototype = TypePrototype::empty("frame");
pub static MODULE_PROTO: TypePrototype = TypePrototype::empty("module");
