//! Heap object representation.

mod mro;
mod prototype;
mod type_obj;

pub mod attr;

pub use mro::{compute_c3_mro, MroError};
pub use prototype::{
    BinarySlot, CallSlot, ContainsSlot, DelItemSlot, GetItemSlot, IterSlot, LenSlot, MethodDef,
    MethodSlot, NextSlot, SetItemSlot, TypePrototype,
};
pub use type_obj::{TypeData, TypeFlags, TypeId};

use crate::types::dict::DictStorage;
use crate::types::frame::FrameData;
use crate::types::function::{BoundMethodData, BuiltinFunctionData, FunctionData};
use crate::types::generator::GeneratorData;
use crate::types::iter::IterData;
use crate::types::range::RangeData;
use opal_compiler::CodeObject;
use opal_core::Value;
use opal_gc::{Trace, Tracer};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A heap entity: type identity, an attribute map, and a type-specific
/// payload.
#[derive(Debug)]
pub struct PyObject {
    pub type_id: TypeId,
    pub attrs: FxHashMap<Arc<str>, Value>,
    pub payload: Payload,
}

impl PyObject {
    pub fn new(type_id: TypeId, payload: Payload) -> Self {
        PyObject {
            type_id,
            attrs: FxHashMap::default(),
            payload,
        }
    }

    #[inline]
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.get(name).cloned()
    }

    #[inline]
    pub fn set_attr(&mut self, name: Arc<str>, value: Value) {
        self.attrs.insert(name, value);
    }
}

/// Type-specific object state.
#[derive(Debug)]
pub enum Payload {
    /// Plain instance of a user class; state lives in the attribute map.
    Instance,
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(DictStorage),
    /// A set is a dict whose values are all `None`.
    Set(DictStorage),
    Range(RangeData),
    Slice {
        start: Value,
        stop: Value,
        step: Value,
    },
    Function(FunctionData),
    BuiltinFunction(BuiltinFunctionData),
    BoundMethod(BoundMethodData),
    Cell(Option<Value>),
    Code(Arc<CodeObject>),
    Frame(FrameData),
    Generator(GeneratorData),
    Module {
        name: Arc<str>,
    },
    Type(TypeData),
    Exception {
        args: Vec<Value>,
    },
    /// Stateful iterator over a container or view.
    Iter(IterData),
}

impl Payload {
    pub fn as_type(&self) -> Option<&TypeData> {
        match self {
            Payload::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<&FrameData> {
        match self {
            Payload::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_frame_mut(&mut self) -> Option<&mut FrameData> {
        match self {
            Payload::Frame(f) => Some(f),
            _ => None,
        }
    }
}

impl Trace for PyObject {
    /// Enumerate every value and object this one owns. Each object type
    /// reports exactly its edges; the collector guarantees idempotent
    /// visits, so cyclic graphs (frames and their parents, lists holding
    /// themselves) are fine.
    fn trace(&self, tracer: &mut Tracer) {
        for value in self.attrs.values() {
            tracer.visit_value(value);
        }
        match &self.payload {
            Payload::Instance | Payload::Module { .. } | Payload::Code(_) => {}
            Payload::List(items) | Payload::Tuple(items) => tracer.visit_values(items),
            Payload::Dict(storage) | Payload::Set(storage) => storage.trace(tracer),
            Payload::Range(_) => {}
            Payload::Slice { start, stop, step } => {
                tracer.visit_value(start);
                tracer.visit_value(stop);
                tracer.visit_value(step);
            }
            Payload::Function(f) => f.trace(tracer),
            Payload::BuiltinFunction(_) => {}
            Payload::BoundMethod(m) => {
                tracer.visit_value(&m.func);
                tracer.visit_value(&m.receiver);
            }
            Payload::Cell(value) => {
                if let Some(v) = value {
                    tracer.visit_value(v);
                }
            }
            Payload::Frame(frame) => frame.trace(tracer),
            Payload::Generator(gen) => tracer.visit(gen.frame),
            Payload::Type(t) => {
                for base in &t.bases {
                    tracer.visit(*base);
                }
                for entry in &t.mro {
                    tracer.visit(*entry);
                }
            }
            Payload::Exception { args } => tracer.visit_values(args),
            Payload::Iter(iter) => iter.trace(tracer),
        }
    }
}

