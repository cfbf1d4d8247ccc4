//! Type object registry.
//!
//! Maps every instance type id to its interned type object. Built-in
//! type objects are created lazily on first use and memoized; their
//! class dicts are populated from the prototype method tables, so
//! attribute lookup sees built-in methods as ordinary non-data
//! descriptors. User classes and the exception hierarchy allocate fresh
//! ids from the dynamic range.

use opal_core::{intern, ObjRef, Value};
use opal_gc::Heap;
use opal_runtime::object::compute_c3_mro;
use opal_runtime::types::function::{BuiltinFunctionData, BuiltinImpl};
use opal_runtime::{Payload, PyObject, TypeData, TypeFlags, TypeId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

pub(crate) struct TypeRegistry {
    /// Instance type id -> interned type object.
    type_objects: FxHashMap<TypeId, ObjRef>,
    next_type_id: u32,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            type_objects: FxHashMap::default(),
            next_type_id: TypeId::FIRST_USER,
        }
    }

    pub fn allocate_type_id(&mut self) -> TypeId {
        let id = TypeId(self.next_type_id);
        self.next_type_id += 1;
        id
    }

    pub fn lookup(&self, tid: TypeId) -> Option<ObjRef> {
        self.type_objects.get(&tid).copied()
    }

    pub fn register(&mut self, tid: TypeId, type_obj: ObjRef) {
        self.type_objects.insert(tid, type_obj);
    }

    /// Every interned type object, for rooting.
    pub fn roots(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.type_objects.values().copied()
    }

    /// Create (or fetch) the interned type object for a built-in type.
    /// Built-in types are created exactly once per heap regardless of
    /// how many lookups race to them.
    pub fn builtin_type_object(
        &mut self,
        heap: &mut Heap<PyObject>,
        tid: TypeId,
    ) -> Result<ObjRef, opal_gc::AllocError> {
        if let Some(obj) = self.type_objects.get(&tid) {
            return Ok(*obj);
        }

        // `object` is the root of every MRO; create it first.
        let object_type = if tid == TypeId::OBJECT {
            None
        } else {
            Some(self.builtin_type_object(heap, TypeId::OBJECT)?)
        };

        let proto =
            opal_runtime::types::prototype_of(tid).expect("builtin type without a prototype");

        let (bases, mro_tail): (SmallVec<[ObjRef; 2]>, Vec<ObjRef>) = match object_type {
            None => (SmallVec::new(), Vec::new()),
            Some(obj) => (SmallVec::from_slice(&[obj]), vec![obj]),
        };

        let mut type_obj_data = PyObject::new(
            TypeId::TYPE,
            Payload::Type(TypeData {
                name: proto.name.into(),
                instance_type_id: tid,
                bases,
                mro: Vec::new(),
                flags: TypeFlags::BUILTIN,
            }),
        );

        // Built-in methods enter the class dict as callable descriptors;
        // the attribute protocol binds them on access, checking the
        // receiver inside each implementation.
        for method in proto.methods {
            let func_obj = heap.alloc(PyObject::new(
                TypeId::BUILTIN_FUNCTION,
                Payload::BuiltinFunction(BuiltinFunctionData {
                    name: intern(method.name),
                    imp: BuiltinImpl::Method(method.func),
                }),
            ))?;
            type_obj_data.set_attr(intern(method.name), Value::Object(func_obj));
        }

        let type_obj = heap.alloc_static(type_obj_data)?;
        if let Payload::Type(td) = &mut heap.get_mut(type_obj).payload {
            td.mro = std::iter::once(type_obj).chain(mro_tail).collect();
        }
        self.type_objects.insert(tid, type_obj);
        Ok(type_obj)
    }

    /// Create a new heap type (user class or exception type) with the
    /// given bases (type objects). Returns the type object; the caller
    /// populates the class dict.
    pub fn new_heap_type(
        &mut self,
        heap: &mut Heap<PyObject>,
        name: Arc<str>,
        bases: Vec<ObjRef>,
        flags: TypeFlags,
    ) -> Result<Result<ObjRef, opal_runtime::object::MroError>, opal_gc::AllocError> {
        let tid = self.allocate_type_id();

        let base_mros: Vec<Vec<ObjRef>> = bases
            .iter()
            .map(|b| {
                heap.get(*b)
                    .payload
                    .as_type()
                    .expect("class base is not a type object")
                    .mro
                    .clone()
            })
            .collect();
        let tail = match compute_c3_mro(&base_mros) {
            Ok(t) => t,
            Err(e) => return Ok(Err(e)),
        };

        let type_obj = heap.alloc(PyObject::new(
            TypeId::TYPE,
            Payload::Type(TypeData {
                name,
                instance_type_id: tid,
                bases: SmallVec::from_vec(bases),
                mro: Vec::new(),
                flags,
            }),
        ))?;
        if let Payload::Type(td) = &mut heap.get_mut(type_obj).payload {
            td.mro = std::iter::once(type_obj).chain(tail).collect();
        }
        self.type_objects.insert(tid, type_obj);
        Ok(Ok(type_obj))
    }
}
