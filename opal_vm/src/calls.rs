//! The calling convention.
//!
//! `call_value` dispatches on the callee's payload; script functions get
//! a fresh frame with arguments bound per the code object (positional
//! slots, defaults, `*args`/`**kwargs` collection, cells wired per
//! `cell2arg`, closure installed), then run the dispatch loop
//! recursively. Calling a GENERATOR-flagged function builds a generator
//! object around the prepared frame instead of running it.

use crate::machine::{FrameExit, VirtualMachine};
use opal_compiler::{CodeFlags, CodeObject, CELL_NOT_AN_ARG, FIRST_LOCAL_REGISTER};
use opal_core::{intern, ObjRef, Value};
use opal_runtime::context::{Ctx, ExcKind, PyResult, Raised};
use opal_runtime::object::attr;
use opal_runtime::protocol;
use opal_runtime::types::dict::DictStorage;
use opal_runtime::types::frame::FrameData;
use opal_runtime::types::function::FunctionData;
use opal_runtime::types::generator::GeneratorData;
use opal_runtime::{Payload, PyObject, TypeFlags, TypeId};
use std::sync::Arc;

/// Everything needed from a function object, cloned out so the heap is
/// not borrowed during the call.
struct FunctionParts {
    code: Arc<CodeObject>,
    globals: ObjRef,
    defaults: Vec<Value>,
    kw_defaults: Vec<(Arc<str>, Value)>,
    closure: Vec<ObjRef>,
    qualname: Arc<str>,
}

impl FunctionParts {
    fn from(data: &FunctionData) -> Self {
        FunctionParts {
            code: data.code.clone(),
            globals: data.globals,
            defaults: data.defaults.clone(),
            kw_defaults: data.kw_defaults.clone(),
            closure: data.closure.clone(),
            qualname: data.qualname.clone(),
        }
    }
}

impl VirtualMachine {
    /// Call any callable value with positional and keyword arguments.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
    ) -> PyResult<Value> {
        let Value::Object(r) = &callee else {
            let tname = protocol::type_name(self, &callee);
            return Err(self.raise(
                ExcKind::TypeError,
                format!("'{tname}' object is not callable"),
            ));
        };
        let r = *r;

        if r == self.build_class_marker {
            return self.build_class(args);
        }

        enum Kind {
            Function(FunctionParts),
            Builtin,
            Bound { func: Value, receiver: Value },
            Type,
            Other,
        }

        let kind = match &self.heap.get(r).payload {
            Payload::Function(data) => Kind::Function(FunctionParts::from(data)),
            Payload::BuiltinFunction(_) => Kind::Builtin,
            Payload::BoundMethod(m) => Kind::Bound {
                func: m.func.clone(),
                receiver: m.receiver.clone(),
            },
            Payload::Type(_) => Kind::Type,
            _ => Kind::Other,
        };

        match kind {
            Kind::Function(parts) => self.call_script_function(parts, args, kwargs, None),
            Kind::Builtin => {
                if !kwargs.is_empty() {
                    let name = match &self.heap.get(r).payload {
                        Payload::BuiltinFunction(d) => d.name.clone(),
                        _ => intern("builtin"),
                    };
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("{name}() takes no keyword arguments"),
                    ));
                }
                // The implementation pointer is Copy; pull it out so the
                // heap borrow ends before the call.
                let (name, imp) = match &self.heap.get(r).payload {
                    Payload::BuiltinFunction(d) => (d.name.clone(), d.imp),
                    _ => unreachable!("kind established above"),
                };
                let data = opal_runtime::types::function::BuiltinFunctionData { name, imp };
                data.invoke(self, args)
            }
            Kind::Bound { func, receiver } => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend_from_slice(args);
                self.call_value(func, &full, kwargs)
            }
            Kind::Type => self.instantiate(r, args, kwargs),
            Kind::Other => {
                if let Some(call) = protocol::lookup_special(self, &callee, "__call__")? {
                    return self.call_value(call, args, kwargs);
                }
                let tname = protocol::type_name(self, &callee);
                Err(self.raise(
                    ExcKind::TypeError,
                    format!("'{tname}' object is not callable"),
                ))
            }
        }
    }

    /// Call a compiled function: bind arguments, then either run the
    /// frame or wrap it in a generator.
    fn call_script_function(
        &mut self,
        parts: FunctionParts,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
        locals_override: Option<ObjRef>,
    ) -> PyResult<Value> {
        if self.depth >= self.recursion_limit {
            return Err(self.raise(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded".to_string(),
            ));
        }

        let mut data = FrameData::new(parts.code.clone(), parts.globals, self.builtins);
        data.locals = locals_override;
        self.bind_arguments(&parts, args, kwargs, &mut data)?;

        let is_generator = parts.code.is_generator();
        let frame = self.alloc(PyObject::new(TypeId::FRAME, Payload::Frame(data)))?;

        if is_generator {
            let gen = self.alloc(PyObject::new(
                TypeId::GENERATOR,
                Payload::Generator(GeneratorData::new(frame, parts.qualname)),
            ))?;
            return Ok(Value::Object(gen));
        }

        let saved = self.current_frame;
        self.frame_data_mut(frame).parent = saved;
        self.current_frame = Some(frame);
        self.depth += 1;
        let result = self.run_frame(frame, None);
        self.depth -= 1;
        self.current_frame = saved;

        match result? {
            FrameExit::Return(v) => Ok(v),
            FrameExit::Yield(_) => unreachable!("non-generator frame yielded"),
        }
    }

    /// Run a class body in a fresh frame whose locals dict becomes the
    /// class dict.
    fn run_class_body(&mut self, body_func: ObjRef, locals: ObjRef) -> PyResult<()> {
        let parts = match &self.heap.get(body_func).payload {
            Payload::Function(data) => FunctionParts::from(data),
            _ => {
                return Err(self.raise(
                    ExcKind::TypeError,
                    "__build_class__ body is not a function".to_string(),
                ));
            }
        };
        self.call_script_function(parts, &[], &[], Some(locals))?;
        Ok(())
    }

    // =========================================================================
    // Argument binding
    // =========================================================================

    /// Bind a call's arguments into a fresh frame, following the code
    /// object's parameter layout: positional parameters lead the local
    /// slots, keyword-only parameters follow, then `*args` and
    /// `**kwargs` collectors. Cell variables are allocated here, copying
    /// in parameters listed in `cell2arg`.
    fn bind_arguments(
        &mut self,
        parts: &FunctionParts,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
        frame: &mut FrameData,
    ) -> PyResult<()> {
        let code = &parts.code;
        let name = code.name.clone();
        let argc = code.arg_count as usize;
        let kwonly = code.kwonly_count as usize;
        let has_varargs = code.flags.contains(CodeFlags::VARARGS);
        let has_varkw = code.flags.contains(CodeFlags::VARKEYWORDS);
        let named_params = argc + kwonly;
        let param_count =
            named_params + usize::from(has_varargs) + usize::from(has_varkw);
        let vararg_slot = named_params;
        let kwarg_slot = named_params + usize::from(has_varargs);

        let mut slots: Vec<Option<Value>> = vec![None; code.varnames.len()];

        // Positional arguments fill the leading slots; the overflow goes
        // to *args or is an arity error.
        let take = args.len().min(argc);
        for (slot, value) in slots.iter_mut().zip(&args[..take]) {
            *slot = Some(value.clone());
        }
        if args.len() > argc {
            if !has_varargs {
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!(
                        "{name}() takes {argc} positional argument(s) but {} were given",
                        args.len()
                    ),
                ));
            }
            let extra: Vec<Value> = args[argc..].to_vec();
            let tuple = self.alloc(PyObject::new(TypeId::TUPLE, Payload::Tuple(extra)))?;
            slots[vararg_slot] = Some(Value::Object(tuple));
        } else if has_varargs {
            let tuple = self.alloc(PyObject::new(TypeId::TUPLE, Payload::Tuple(Vec::new())))?;
            slots[vararg_slot] = Some(Value::Object(tuple));
        }

        // Keyword arguments match named parameters; the rest goes to
        // **kwargs or is an error.
        let mut extra_kw: Vec<(Arc<str>, Value)> = Vec::new();
        for (kw_name, value) in kwargs {
            let position = code.varnames[..named_params]
                .iter()
                .position(|p| **p == **kw_name);
            match position {
                Some(i) if i < code.posonly_count as usize => {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("{name}() got positional-only argument '{kw_name}' as keyword"),
                    ));
                }
                Some(i) => {
                    if slots[i].is_some() {
                        return Err(self.raise(
                            ExcKind::TypeError,
                            format!("{name}() got multiple values for argument '{kw_name}'"),
                        ));
                    }
                    slots[i] = Some(value.clone());
                }
                None if has_varkw => extra_kw.push((kw_name.clone(), value.clone())),
                None => {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("{name}() got an unexpected keyword argument '{kw_name}'"),
                    ));
                }
            }
        }
        if has_varkw {
            let mut storage = DictStorage::new();
            for (k, v) in extra_kw {
                let key = Value::Str(k);
                let hash = key.primitive_hash().expect("string keys hash");
                storage.push(hash, key, v);
            }
            let dict = self.alloc(PyObject::new(TypeId::DICT, Payload::Dict(storage)))?;
            slots[kwarg_slot] = Some(Value::Object(dict));
        }

        // Defaults: positional defaults align with the trailing
        // positional parameters, keyword-only defaults match by name.
        let first_default = argc - parts.defaults.len().min(argc);
        for i in 0..argc {
            if slots[i].is_none() {
                if i >= first_default {
                    slots[i] = Some(parts.defaults[i - first_default].clone());
                } else {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!(
                            "{name}() missing required positional argument: '{}'",
                            code.varnames[i]
                        ),
                    ));
                }
            }
        }
        for i in argc..named_params {
            if slots[i].is_none() {
                let param = &code.varnames[i];
                match parts.kw_defaults.iter().find(|(n, _)| **n == **param) {
                    Some((_, default)) => slots[i] = Some(default.clone()),
                    None => {
                        return Err(self.raise(
                            ExcKind::TypeError,
                            format!("{name}() missing required keyword-only argument: '{param}'"),
                        ));
                    }
                }
            }
        }

        // Write the register file: parameters carry their values, other
        // named locals start unbound.
        let unset = self.unset_value();
        for (i, slot) in slots.into_iter().enumerate() {
            let register = FIRST_LOCAL_REGISTER as usize + i;
            frame.registers[register] = match slot {
                Some(value) => value,
                None if i >= param_count => unset.clone(),
                None => unreachable!("missing parameter was not defaulted"),
            };
        }

        // Cells: one box per cell variable, seeded from the parameter it
        // shadows; captured free cells follow.
        for (i, _) in code.cellvars.iter().enumerate() {
            let seed = match code.cell2arg[i] {
                CELL_NOT_AN_ARG => None,
                arg => Some(
                    frame.registers[FIRST_LOCAL_REGISTER as usize + arg as usize].clone(),
                ),
            };
            let cell = self.alloc(PyObject::new(TypeId::CELL, Payload::Cell(seed)))?;
            frame.cells.push(cell);
        }
        frame.cells.extend(parts.closure.iter().copied());
        Ok(())
    }

    // =========================================================================
    // Instantiation and class construction
    // =========================================================================

    /// Call a type object: allocate an instance and run `__init__`.
    /// User-defined `__new__` takes over allocation when present.
    fn instantiate(
        &mut self,
        type_obj: ObjRef,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
    ) -> PyResult<Value> {
        let (tid, flags) = {
            let td = self
                .heap
                .get(type_obj)
                .payload
                .as_type()
                .expect("instantiation target is a type object");
            (td.instance_type_id, td.flags)
        };

        let instance = if let Some(new_fn) = attr::type_lookup(self, type_obj, "__new__") {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(Value::Object(type_obj));
            full.extend_from_slice(args);
            self.call_value(new_fn, &full, kwargs)?
        } else {
            let payload = if flags.contains(TypeFlags::EXCEPTION) {
                Payload::Exception {
                    args: args.to_vec(),
                }
            } else {
                Payload::Instance
            };
            Value::Object(self.alloc(PyObject::new(tid, payload))?)
        };

        if let Some(init) = attr::type_lookup(self, type_obj, "__init__") {
            let bound = attr::bind_class_attr(self, init, instance.clone())?;
            self.call_value(bound, args, kwargs)?;
        }
        Ok(instance)
    }

    /// `__build_class__(body, name, *bases)`: run the class body with a
    /// dict for locals, then build the type object from it.
    pub(crate) fn build_class(&mut self, args: &[Value]) -> PyResult<Value> {
        let (Some(body), Some(name)) = (args.first(), args.get(1)) else {
            return Err(self.raise(
                ExcKind::TypeError,
                "__build_class__ needs a body and a name".to_string(),
            ));
        };
        let Value::Object(body_ref) = body else {
            return Err(self.raise(
                ExcKind::TypeError,
                "__build_class__ body is not a function".to_string(),
            ));
        };
        let Value::Str(class_name) = name else {
            return Err(self.raise(
                ExcKind::TypeError,
                "__build_class__ name is not a string".to_string(),
            ));
        };
        let class_name = class_name.clone();

        let locals = self.alloc(PyObject::new(
            TypeId::DICT,
            Payload::Dict(DictStorage::new()),
        ))?;
        self.run_class_body(*body_ref, locals)?;

        // Bases default to `object`.
        let mut base_refs: Vec<ObjRef> = Vec::new();
        for base in &args[2..] {
            match base {
                Value::Object(b) if self.heap.get(*b).payload.as_type().is_some() => {
                    base_refs.push(*b);
                }
                other => {
                    let tname = protocol::type_name(self, other);
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("class base must be a type, not '{tname}'"),
                    ));
                }
            }
        }
        if base_refs.is_empty() {
            let object_type = self.type_object(TypeId::OBJECT)?;
            base_refs.push(object_type);
        }

        let type_obj = match self
            .registry
            .new_heap_type(&mut self.heap, class_name, base_refs, TypeFlags::HEAP_TYPE)
        {
            Ok(Ok(t)) => t,
            Ok(Err(_)) => {
                return Err(self.raise(
                    ExcKind::TypeError,
                    "cannot create a consistent method resolution order".to_string(),
                ));
            }
            Err(_) => return Err(Raised(self.memory_error)),
        };

        // The class body's locals become the class dict.
        let entries: Vec<(Value, Value)> = match &self.heap.get(locals).payload {
            Payload::Dict(storage) => storage
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => unreachable!("class locals is a dict"),
        };
        for (key, value) in entries {
            if let Value::Str(attr_name) = key {
                self.heap.get_mut(type_obj).set_attr(attr_name, value);
            }
        }

        // Exception subclasses keep the exception payload.
        let inherits_exception = {
            let td = self
                .heap
                .get(type_obj)
                .payload
                .as_type()
                .expect("just created type object");
            td.mro.iter().skip(1).any(|base| {
                self.heap
                    .get(*base)
                    .payload
                    .as_type()
                    .is_some_and(|b| b.flags.contains(TypeFlags::EXCEPTION))
            })
        };
        if inherits_exception {
            if let Payload::Type(td) = &mut self.heap.get_mut(type_obj).payload {
                td.flags |= TypeFlags::EXCEPTION;
            }
        }

        Ok(Value::Object(type_obj))
    }
}
