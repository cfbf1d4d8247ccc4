//! The execution context seam between the object model and the VM.
//!
//! Built-in type slots need to allocate, raise exceptions and call back
//! into script code (a `sort` calling user `__lt__`, an iterator slot
//! resuming a generator). They receive the machine through the [`Ctx`]
//! trait so this crate stays independent of the interpreter loop.

use crate::object::{PyObject, TypeId};
use opal_core::{ObjRef, Value};
use opal_gc::Heap;

/// A raised exception travelling up the instruction result path. The
/// payload is the exception object itself.
#[derive(Debug, Clone, Copy)]
pub struct Raised(pub ObjRef);

/// Result type of every fallible runtime operation: a value on success,
/// an exception object on failure.
pub type PyResult<T> = Result<T, Raised>;

/// Built-in exception kinds, mapped by the VM to the interned exception
/// type objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    BaseException,
    Exception,
    TypeError,
    ValueError,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    AttributeError,
    NameError,
    UnboundLocalError,
    KeyError,
    IndexError,
    StopIteration,
    GeneratorExit,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    MemoryError,
    AssertionError,
    ImportError,
    ModuleNotFoundError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::BaseException => "BaseException",
            ExcKind::Exception => "Exception",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ArithmeticError => "ArithmeticError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::LookupError => "LookupError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::NameError => "NameError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::KeyError => "KeyError",
            ExcKind::IndexError => "IndexError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::GeneratorExit => "GeneratorExit",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::NotImplementedError => "NotImplementedError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::MemoryError => "MemoryError",
            ExcKind::AssertionError => "AssertionError",
            ExcKind::ImportError => "ImportError",
            ExcKind::ModuleNotFoundError => "ModuleNotFoundError",
        }
    }

    /// The base class in the built-in hierarchy, `None` for the root.
    pub fn base(self) -> Option<ExcKind> {
        match self {
            ExcKind::BaseException => None,
            ExcKind::Exception | ExcKind::GeneratorExit => Some(ExcKind::BaseException),
            ExcKind::ArithmeticError
            | ExcKind::LookupError
            | ExcKind::TypeError
            | ExcKind::ValueError
            | ExcKind::AttributeError
            | ExcKind::NameError
            | ExcKind::StopIteration
            | ExcKind::RuntimeError
            | ExcKind::MemoryError
            | ExcKind::AssertionError
            | ExcKind::ImportError => Some(ExcKind::Exception),
            ExcKind::ZeroDivisionError | ExcKind::OverflowError => Some(ExcKind::ArithmeticError),
            ExcKind::KeyError | ExcKind::IndexError => Some(ExcKind::LookupError),
            ExcKind::UnboundLocalError => Some(ExcKind::NameError),
            ExcKind::NotImplementedError | ExcKind::RecursionError => Some(ExcKind::RuntimeError),
            ExcKind::ModuleNotFoundError => Some(ExcKind::ImportError),
        }
    }

    /// All kinds, roots first, so the hierarchy can be installed in one
    /// pass.
    pub fn all() -> &'static [ExcKind] {
        &[
            ExcKind::BaseException,
            ExcKind::Exception,
            ExcKind::GeneratorExit,
            ExcKind::ArithmeticError,
            ExcKind::LookupError,
            ExcKind::TypeError,
            ExcKind::ValueError,
            ExcKind::AttributeError,
            ExcKind::NameError,
            ExcKind::UnboundLocalError,
            ExcKind::StopIteration,
            ExcKind::RuntimeError,
            ExcKind::NotImplementedError,
            ExcKind::RecursionError,
            ExcKind::MemoryError,
            ExcKind::AssertionError,
            ExcKind::ImportError,
            ExcKind::ModuleNotFoundError,
            ExcKind::ZeroDivisionError,
            ExcKind::OverflowError,
            ExcKind::KeyError,
            ExcKind::IndexError,
        ]
    }
}

/// Machine services available to runtime slots.
pub trait Ctx {
    fn heap(&self) -> &Heap<PyObject>;
    fn heap_mut(&mut self) -> &mut Heap<PyObject>;

    /// Allocate an object, raising MemoryError on failure.
    fn alloc(&mut self, obj: PyObject) -> PyResult<ObjRef>;

    /// Construct and record a built-in exception; the returned marker is
    /// propagated as the `Err` of the failing operation.
    fn raise(&mut self, kind: ExcKind, message: String) -> Raised;

    /// Call a callable value with positional arguments.
    fn call(&mut self, callee: Value, args: &[Value]) -> PyResult<Value>;

    /// The interned type object for a type id (built-in or user class).
    fn type_object(&mut self, type_id: TypeId) -> PyResult<ObjRef>;

    /// Whether the exception object is an instance of the built-in kind.
    fn exception_matches(&mut self, exc: ObjRef, kind: ExcKind) -> bool;

    /// Resume a suspended generator; `Ok(None)` means it is exhausted.
    fn resume_generator(&mut self, gen: ObjRef, send: Value) -> PyResult<Option<Value>>;

    /// Close a generator by injecting GeneratorExit at its suspension
    /// point. A generator that swallows the injection is a RuntimeError.
    fn close_generator(&mut self, gen: ObjRef) -> PyResult<()>;

    /// Write to the interpreter's standard output sink.
    fn write_stdout(&mut self, text: &str);
}
