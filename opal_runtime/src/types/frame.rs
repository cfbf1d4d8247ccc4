//! Execution frames as first-class heap objects.
//!
//! A frame is created per invocation and holds the register file, the
//! instruction pointer and the exception stash. Keeping frames on the
//! heap lets generators capture and resume them, lets tracebacks hold
//! them alive, and gives the collector one uniform way to see live
//! values: registers and cells are just traced edges.

use opal_compiler::CodeObject;
use opal_core::{ObjRef, Value};
use opal_gc::Tracer;
use std::sync::Arc;

/// Activation record for one call.
pub struct FrameData {
    pub code: Arc<CodeObject>,
    /// Index of the next instruction to execute.
    pub ip: u32,
    /// Register file sized from the code object. Register 0 carries
    /// return and yield values.
    pub registers: Vec<Value>,
    /// Dynamic link to the calling frame.
    pub parent: Option<ObjRef>,
    /// The module globals dict object.
    pub globals: ObjRef,
    /// The builtins module object.
    pub builtins: ObjRef,
    /// Dict-based locals for module and class-body frames.
    pub locals: Option<ObjRef>,
    /// Cell storage: own cell variables first, then captured free
    /// variables, indexed by the compiler's cell slots.
    pub cells: Vec<ObjRef>,
    /// Exceptions currently being handled, innermost last.
    pub exc_stack: Vec<ObjRef>,
    /// Keyword names announced by `KwNames` for the next call.
    pub pending_kwnames: Option<Box<[Arc<str>]>>,
}

impl FrameData {
    pub fn new(code: Arc<CodeObject>, globals: ObjRef, builtins: ObjRef) -> Self {
        let register_count = code.register_count.max(1) as usize;
        FrameData {
            code,
            ip: 0,
            registers: vec![Value::None; register_count],
            parent: None,
            globals,
            builtins,
            locals: None,
            cells: Vec::new(),
            exc_stack: Vec::new(),
            pending_kwnames: None,
        }
    }

    #[inline]
    pub fn reg(&self, index: u8) -> Value {
        self.registers[index as usize].clone()
    }

    #[inline]
    pub fn set_reg(&mut self, index: u8, value: Value) {
        self.registers[index as usize] = value;
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_values(&self.registers);
        if let Some(parent) = self.parent {
            tracer.visit(parent);
        }
        tracer.visit(self.globals);
        tracer.visit(self.builtins);
        if let Some(locals) = self.locals {
            tracer.visit(locals);
        }
        for cell in &self.cells {
            tracer.visit(*cell);
        }
        for exc in &self.exc_stack {
            tracer.visit(*exc);
        }
    }
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<frame {} at ip {}>", self.code.qualname, self.ip)
    }
}
