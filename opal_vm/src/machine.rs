//! The virtual machine.
//!
//! One `VirtualMachine` owns the heap, the interned type objects, the
//! globals and builtins namespaces, and the interpreter loop. Frames are
//! heap objects (see `opal_runtime::types::frame`); nested calls run the
//! loop recursively, so the Rust call stack mirrors the script call
//! stack and the recursion limit guards both.
//!
//! Garbage collection runs only at the top of the dispatch loop, between
//! instructions, so the object graph an instruction observes is stable
//! for its duration.

use crate::builtins;
use crate::error::OpalError;
use crate::ops::{self, Flow};
use crate::registry::TypeRegistry;
use opal_compiler::{CodeObject, Program};
use opal_core::{intern, ObjRef, Value};
use opal_gc::{GcConfig, Heap};
use opal_runtime::context::{Ctx, ExcKind, PyResult, Raised};
use opal_runtime::types::frame::FrameData;
use opal_runtime::types::function::{BuiltinFunctionData, BuiltinImpl};
use opal_runtime::types::generator::GenState;
use opal_runtime::{Payload, PyObject, TypeFlags, TypeId};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Interpreter status after the last execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Idle,
    Ok,
    Exception,
}

/// How a frame left the dispatch loop.
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value),
}

pub struct VirtualMachine {
    pub(crate) heap: Heap<PyObject>,
    pub(crate) registry: TypeRegistry,
    pub(crate) exc_types: FxHashMap<ExcKind, ObjRef>,
    /// Module globals dict object.
    pub(crate) globals: ObjRef,
    /// The builtins module object.
    pub(crate) builtins: ObjRef,
    pub(crate) modules: FxHashMap<Arc<str>, ObjRef>,
    /// Sentinel callable intercepted by the call machinery.
    pub(crate) build_class_marker: ObjRef,
    /// Sentinel for unbound locals and absent method receivers.
    pub(crate) unset: ObjRef,
    /// Preallocated MemoryError instance, returned when allocating an
    /// exception is itself impossible.
    pub(crate) memory_error: ObjRef,
    pub(crate) current_frame: Option<ObjRef>,
    pub(crate) depth: usize,
    pub(crate) recursion_limit: usize,
    pub(crate) stdout: String,
    pub(crate) status: VmStatus,
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let mut heap = Heap::new(config);
        let mut registry = TypeRegistry::new();

        let alloc = |heap: &mut Heap<PyObject>, obj| {
            heap.alloc(obj).expect("heap exhausted during interpreter bootstrap")
        };
        let alloc_static = |heap: &mut Heap<PyObject>, obj| {
            heap.alloc_static(obj)
                .expect("heap exhausted during interpreter bootstrap")
        };

        let globals = alloc(
            &mut heap,
            PyObject::new(
                TypeId::DICT,
                Payload::Dict(opal_runtime::types::dict::DictStorage::new()),
            ),
        );
        let builtins_module = alloc_static(
            &mut heap,
            PyObject::new(
                TypeId::MODULE,
                Payload::Module {
                    name: intern("builtins"),
                },
            ),
        );
        let unset = alloc_static(&mut heap, PyObject::new(TypeId::OBJECT, Payload::Instance));
        let build_class_marker = alloc_static(
            &mut heap,
            PyObject::new(
                TypeId::BUILTIN_FUNCTION,
                Payload::BuiltinFunction(BuiltinFunctionData {
                    name: intern("__build_class__"),
                    imp: BuiltinImpl::Function(builtins::build_class_stub),
                }),
            ),
        );

        // Exception hierarchy, roots first.
        let object_type = registry
            .builtin_type_object(&mut heap, TypeId::OBJECT)
            .expect("heap exhausted during interpreter bootstrap");
        let mut exc_types = FxHashMap::default();
        for &kind in ExcKind::all() {
            let base = match kind.base() {
                Some(base) => *exc_types.get(&base).expect("hierarchy is installed roots-first"),
                None => object_type,
            };
            let type_obj = registry
                .new_heap_type(
                    &mut heap,
                    intern(kind.name()),
                    vec![base],
                    TypeFlags::BUILTIN | TypeFlags::EXCEPTION,
                )
                .expect("heap exhausted during interpreter bootstrap")
                .expect("builtin exception hierarchy is consistent");
            exc_types.insert(kind, type_obj);
        }

        let memory_error_type = exc_types[&ExcKind::MemoryError];
        let memory_error_tid = heap
            .get(memory_error_type)
            .payload
            .as_type()
            .expect("exception type object")
            .instance_type_id;
        let memory_error = alloc_static(
            &mut heap,
            PyObject::new(
                memory_error_tid,
                Payload::Exception {
                    args: vec![Value::Str("out of memory".into())],
                },
            ),
        );

        let mut vm = VirtualMachine {
            heap,
            registry,
            exc_types,
            globals,
            builtins: builtins_module,
            modules: FxHashMap::default(),
            build_class_marker,
            unset,
            memory_error,
            current_frame: None,
            depth: 0,
            recursion_limit: 1000,
            stdout: String::new(),
            status: VmStatus::Idle,
        };
        builtins::install(&mut vm);
        vm.modules.insert(intern("builtins"), builtins_module);
        vm
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Compile and run an AST module in this machine's globals.
    pub fn run_module(
        &mut self,
        module: &opal_ast::Module,
        filename: &str,
    ) -> Result<Value, OpalError> {
        let code = opal_compiler::compile_module(module, filename)
            .map_err(OpalError::from_compile)?;
        self.execute(code)
    }

    /// Run a deserialized program.
    pub fn run_program(&mut self, program: &Program) -> Result<Value, OpalError> {
        self.execute(program.code.clone())
    }

    /// Execute module-level code.
    pub fn execute(&mut self, code: Arc<CodeObject>) -> Result<Value, OpalError> {
        let frame_data = FrameData::new(code, self.globals, self.builtins);
        let frame = match self.heap.alloc(PyObject::new(TypeId::FRAME, Payload::Frame(frame_data)))
        {
            Ok(f) => f,
            Err(_) => {
                self.status = VmStatus::Exception;
                return Err(self.render_error(self.memory_error));
            }
        };

        let saved = self.current_frame;
        self.frame_data_mut(frame).parent = saved;
        self.current_frame = Some(frame);
        let result = self.run_frame(frame, None);
        self.current_frame = saved;

        match result {
            Ok(FrameExit::Return(v)) | Ok(FrameExit::Yield(v)) => {
                self.status = VmStatus::Ok;
                Ok(v)
            }
            Err(raised) => {
                self.status = VmStatus::Exception;
                Err(self.render_error(raised.0))
            }
        }
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    /// Look up a module-level global by name.
    pub fn global_value(&mut self, name: &str) -> Option<Value> {
        let globals = self.globals;
        opal_runtime::protocol::dict_get(self, globals, &Value::str(name))
            .ok()
            .flatten()
    }

    /// Drain everything `print` wrote since the last call.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.stdout)
    }

    /// Adjust the call-depth limit (default 1000).
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit;
    }

    /// Force a full collection from the machine roots.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<ObjRef> = vec![self.globals, self.builtins];
        roots.extend(self.current_frame);
        roots.extend(self.registry.roots());
        roots.extend(self.exc_types.values().copied());
        roots.extend(self.modules.values().copied());
        self.heap.collect(roots)
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    // =========================================================================
    // Frame access helpers
    // =========================================================================

    #[inline]
    pub(crate) fn frame_data(&self, frame: ObjRef) -> &FrameData {
        self.heap
            .get(frame)
            .payload
            .as_frame()
            .expect("frame handle does not hold a frame")
    }

    #[inline]
    pub(crate) fn frame_data_mut(&mut self, frame: ObjRef) -> &mut FrameData {
        self.heap
            .get_mut(frame)
            .payload
            .as_frame_mut()
            .expect("frame handle does not hold a frame")
    }

    #[inline]
    pub(crate) fn reg(&self, frame: ObjRef, index: u8) -> Value {
        self.frame_data(frame).reg(index)
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, frame: ObjRef, index: u8, value: Value) {
        self.frame_data_mut(frame).set_reg(index, value);
    }

    /// Apply a relative jump. The offset is relative to the already
    /// advanced instruction pointer.
    #[inline]
    pub(crate) fn jump(&mut self, frame: ObjRef, offset: i16) {
        let data = self.frame_data_mut(frame);
        data.ip = (data.ip as i64 + offset as i64) as u32;
    }

    /// The unset sentinel as a value.
    #[inline]
    pub(crate) fn unset_value(&self) -> Value {
        Value::Object(self.unset)
    }

    #[inline]
    pub(crate) fn is_unset(&self, v: &Value) -> bool {
        matches!(v, Value::Object(r) if *r == self.unset)
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Run a frame until it returns, yields or fails. `inject` delivers
    /// an exception at the current instruction pointer (generator close).
    pub(crate) fn run_frame(
        &mut self,
        frame: ObjRef,
        inject: Option<Raised>,
    ) -> PyResult<FrameExit> {
        if let Some(raised) = inject {
            // Deliver at the resume point; handlers covering it run.
            let ip = self.frame_data(frame).ip;
            self.unwind(frame, ip, raised)?;
        }

        loop {
            // Safe point: collection never runs mid-instruction.
            if self.heap.wants_collect() {
                self.collect_garbage();
            }

            let (inst, ip) = {
                let data = self.frame_data(frame);
                if data.ip as usize >= data.code.instructions.len() {
                    // Implicit return at the end of the stream.
                    return Ok(FrameExit::Return(Value::None));
                }
                (data.code.instructions[data.ip as usize], data.ip)
            };
            self.frame_data_mut(frame).ip = ip + 1;

            match ops::exec(self, frame, inst) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => {
                    return Ok(FrameExit::Return(self.reg(frame, 0)));
                }
                Ok(Flow::Yield) => {
                    return Ok(FrameExit::Yield(self.reg(frame, 0)));
                }
                Err(raised) => {
                    self.unwind(frame, ip, raised)?;
                }
            }
        }
    }

    /// Route a raised exception to the innermost covering handler of
    /// this frame, or propagate it to the caller.
    fn unwind(&mut self, frame: ObjRef, ip: u32, raised: Raised) -> PyResult<()> {
        let entry = self.frame_data(frame).code.handler_for_pc(ip).copied();
        match entry {
            Some(entry) => {
                let data = self.frame_data_mut(frame);
                data.exc_stack.truncate(entry.depth as usize);
                data.exc_stack.push(raised.0);
                data.ip = entry.handler_pc;
                Ok(())
            }
            None => Err(raised),
        }
    }

    // =========================================================================
    // Generators
    // =========================================================================

    fn generator_parts(&self, gen: ObjRef) -> (ObjRef, GenState) {
        match &self.heap.get(gen).payload {
            Payload::Generator(g) => (g.frame, g.state),
            _ => unreachable!("resume target is not a generator"),
        }
    }

    fn set_generator_state(&mut self, gen: ObjRef, state: GenState) {
        if let Payload::Generator(g) = &mut self.heap.get_mut(gen).payload {
            g.state = state;
        }
    }

    pub(crate) fn resume(&mut self, gen: ObjRef, send: Value) -> PyResult<Option<Value>> {
        let (frame, state) = self.generator_parts(gen);
        match state {
            GenState::Done => return Ok(None),
            GenState::Running => {
                return Err(self.raise(
                    ExcKind::ValueError,
                    "generator already executing".to_string(),
                ));
            }
            GenState::Created => {
                if !send.is_none() {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        "can't send non-None value to a just-started generator".to_string(),
                    ));
                }
            }
            GenState::Suspended => {
                // The sent value becomes the result of the yield.
                self.set_reg(frame, 0, send);
            }
        }

        self.set_generator_state(gen, GenState::Running);
        let saved = self.current_frame;
        self.frame_data_mut(frame).parent = saved;
        self.current_frame = Some(frame);
        let result = self.run_frame(frame, None);
        self.current_frame = saved;

        match result {
            Ok(FrameExit::Yield(value)) => {
                self.set_generator_state(gen, GenState::Suspended);
                Ok(Some(value))
            }
            Ok(FrameExit::Return(_)) => {
                self.set_generator_state(gen, GenState::Done);
                Ok(None)
            }
            Err(raised) => {
                self.set_generator_state(gen, GenState::Done);
                Err(raised)
            }
        }
    }

    pub(crate) fn close(&mut self, gen: ObjRef) -> PyResult<()> {
        let (frame, state) = self.generator_parts(gen);
        match state {
            GenState::Done | GenState::Created => {
                self.set_generator_state(gen, GenState::Done);
                return Ok(());
            }
            GenState::Running => {
                return Err(self.raise(
                    ExcKind::ValueError,
                    "generator already executing".to_string(),
                ));
            }
            GenState::Suspended => {}
        }

        let exit_exc = match self.new_exception(ExcKind::GeneratorExit, String::new()) {
            Ok(exc) => exc,
            Err(raised) => return Err(raised),
        };

        self.set_generator_state(gen, GenState::Running);
        let saved = self.current_frame;
        self.frame_data_mut(frame).parent = saved;
        self.current_frame = Some(frame);
        let result = self.run_frame(frame, Some(Raised(exit_exc)));
        self.current_frame = saved;
        self.set_generator_state(gen, GenState::Done);

        match result {
            // Swallowing GeneratorExit and yielding again is an error.
            Ok(FrameExit::Yield(_)) => Err(self.raise(
                ExcKind::RuntimeError,
                "generator ignored GeneratorExit".to_string(),
            )),
            Ok(FrameExit::Return(_)) => Ok(()),
            Err(raised) if self.exception_matches(raised.0, ExcKind::GeneratorExit) => Ok(()),
            Err(raised) => Err(raised),
        }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Allocate a built-in exception instance.
    pub(crate) fn new_exception(&mut self, kind: ExcKind, message: String) -> PyResult<ObjRef> {
        let type_obj = self.exc_types[&kind];
        let tid = self
            .heap
            .get(type_obj)
            .payload
            .as_type()
            .expect("exception type object")
            .instance_type_id;
        let args = if message.is_empty() {
            Vec::new()
        } else {
            vec![Value::Str(message.into())]
        };
        match self
            .heap
            .alloc(PyObject::new(tid, Payload::Exception { args }))
        {
            Ok(obj) => Ok(obj),
            Err(_) => Err(Raised(self.memory_error)),
        }
    }

    /// The type object an exception instance belongs to.
    pub(crate) fn exception_type_of(&mut self, exc: ObjRef) -> Option<ObjRef> {
        let tid = self.heap.get(exc).type_id;
        self.registry.lookup(tid)
    }

    /// Render an uncaught exception for the embedder.
    fn render_error(&mut self, exc: ObjRef) -> OpalError {
        let type_name = self
            .exception_type_of(exc)
            .and_then(|t| {
                self.heap
                    .get(t)
                    .payload
                    .as_type()
                    .map(|td| td.name.to_string())
            })
            .unwrap_or_else(|| "Exception".to_string());
        let message = opal_runtime::protocol::str_value(self, &Value::Object(exc))
            .unwrap_or_default();
        OpalError::uncaught(type_name, message)
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Ctx: the runtime's view of the machine
// =============================================================================

impl Ctx for VirtualMachine {
    fn heap(&self) -> &Heap<PyObject> {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap<PyObject> {
        &mut self.heap
    }

    fn alloc(&mut self, obj: PyObject) -> PyResult<ObjRef> {
        self.heap.alloc(obj).map_err(|_| Raised(self.memory_error))
    }

    fn raise(&mut self, kind: ExcKind, message: String) -> Raised {
        match self.new_exception(kind, message) {
            Ok(exc) => Raised(exc),
            Err(raised) => raised,
        }
    }

    fn call(&mut self, callee: Value, args: &[Value]) -> PyResult<Value> {
        self.call_value(callee, args, &[])
    }

    fn type_object(&mut self, type_id: TypeId) -> PyResult<ObjRef> {
        if type_id.is_builtin() {
            return self
                .registry
                .builtin_type_object(&mut self.heap, type_id)
                .map_err(|_| Raised(self.memory_error));
        }
        Ok(self
            .registry
            .lookup(type_id)
            .expect("user type id without a registered type object"))
    }

    fn exception_matches(&mut self, exc: ObjRef, kind: ExcKind) -> bool {
        let expected = self.exc_types[&kind];
        let Some(type_obj) = self.exception_type_of(exc) else {
            return false;
        };
        match self.heap.get(type_obj).payload.as_type() {
            Some(td) => td.mro.contains(&expected),
            None => false,
        }
    }

    fn resume_generator(&mut self, gen: ObjRef, send: Value) -> PyResult<Option<Value>> {
        self.resume(gen, send)
    }

    fn close_generator(&mut self, gen: ObjRef) -> PyResult<()> {
        self.close(gen)
    }

    fn write_stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }
}
