//! Type identity and type-object payloads.

use opal_core::ObjRef;
use smallvec::SmallVec;
use std::sync::Arc;

/// Identifies a runtime type. Built-in types use the fixed ids below;
/// user classes allocate ids from [`TypeId::FIRST_USER`] upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const NONE: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const INT: TypeId = TypeId(2);
    pub const FLOAT: TypeId = TypeId(3);
    pub const STR: TypeId = TypeId(4);
    pub const BYTES: TypeId = TypeId(5);
    pub const ELLIPSIS: TypeId = TypeId(6);
    pub const NOT_IMPLEMENTED: TypeId = TypeId(7);
    pub const OBJECT: TypeId = TypeId(8);
    pub const TYPE: TypeId = TypeId(9);
    pub const TUPLE: TypeId = TypeId(10);
    pub const LIST: TypeId = TypeId(11);
    pub const DICT: TypeId = TypeId(12);
    pub const SET: TypeId = TypeId(13);
    pub const RANGE: TypeId = TypeId(14);
    pub const SLICE: TypeId = TypeId(15);
    pub const FUNCTION: TypeId = TypeId(16);
    pub const BUILTIN_FUNCTION: TypeId = TypeId(17);
    pub const BOUND_METHOD: TypeId = TypeId(18);
    pub const CELL: TypeId = TypeId(19);
    pub const CODE: TypeId = TypeId(20);
    pub const FRAME: TypeId = TypeId(21);
    pub const GENERATOR: TypeId = TypeId(22);
    pub const MODULE: TypeId = TypeId(23);
    pub const LIST_ITER: TypeId = TypeId(24);
    pub const TUPLE_ITER: TypeId = TypeId(25);
    pub const STR_ITER: TypeId = TypeId(26);
    pub const RANGE_ITER: TypeId = TypeId(27);
    pub const DICT_ITER: TypeId = TypeId(28);
    pub const DICT_VIEW: TypeId = TypeId(29);
    pub const SET_ITER: TypeId = TypeId(30);

    /// First id available to dynamically created types (user classes and
    /// the exception hierarchy).
    pub const FIRST_USER: u32 = 64;

    #[inline]
    pub fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER
    }
}

bitflags::bitflags! {
    /// Capabilities of a type object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Interned built-in type.
        const BUILTIN = 1 << 0;
        /// Instances carry an exception payload.
        const EXCEPTION = 1 << 1;
        /// Created by a `class` statement.
        const HEAP_TYPE = 1 << 2;
    }
}

/// Payload of a type object.
///
/// The class dict (methods, class attributes) lives in the owning
/// object's attribute map; this payload carries identity, bases and the
/// cached linearization.
#[derive(Debug)]
pub struct TypeData {
    pub name: Arc<str>,
    /// The id instances of this type carry.
    pub instance_type_id: TypeId,
    /// Direct bases, in declaration order (type objects).
    pub bases: SmallVec<[ObjRef; 2]>,
    /// C3 linearization including self, computed eagerly at creation.
    pub mro: Vec<ObjRef>,
    pub flags: TypeFlags,
}
