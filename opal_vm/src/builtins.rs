//! The builtins namespace: native functions and the exception types.

use crate::machine::VirtualMachine;
use opal_core::{intern, ObjRef, Value};
use opal_runtime::context::{Ctx, ExcKind, PyResult};
use opal_runtime::protocol;
use opal_runtime::types::function::{BuiltinFn, BuiltinFunctionData, BuiltinImpl};
use opal_runtime::types::range::RangeData;
use opal_runtime::{Payload, PyObject, TypeId};

/// Populate the builtins module: functions, exception types, `object`.
pub(crate) fn install(vm: &mut VirtualMachine) {
    let functions: &[(&str, BuiltinFn)] = &[
        ("print", builtin_print),
        ("len", builtin_len),
        ("range", builtin_range),
        ("iter", builtin_iter),
        ("next", builtin_next),
        ("type", builtin_type),
        ("isinstance", builtin_isinstance),
        ("repr", builtin_repr),
        ("str", builtin_str),
        ("bool", builtin_bool),
        ("abs", builtin_abs),
        ("hash", builtin_hash),
    ];

    for &(name, func) in functions {
        let obj = vm
            .heap
            .alloc_static(PyObject::new(
                TypeId::BUILTIN_FUNCTION,
                Payload::BuiltinFunction(BuiltinFunctionData {
                    name: intern(name),
                    imp: BuiltinImpl::Function(func),
                }),
            ))
            .expect("heap exhausted during interpreter bootstrap");
        set_builtin(vm, name, Value::Object(obj));
    }

    // Exception classes are reachable as ordinary names.
    let pairs: Vec<(&'static str, ObjRef)> = vm
        .exc_types
        .iter()
        .map(|(kind, obj)| (kind.name(), *obj))
        .collect();
    for (name, obj) in pairs {
        set_builtin(vm, name, Value::Object(obj));
    }

    let object_type = vm
        .registry
        .builtin_type_object(&mut vm.heap, TypeId::OBJECT)
        .expect("heap exhausted during interpreter bootstrap");
    set_builtin(vm, "object", Value::Object(object_type));

    let marker = vm.build_class_marker;
    set_builtin(vm, "__build_class__", Value::Object(marker));
}

fn set_builtin(vm: &mut VirtualMachine, name: &str, value: Value) {
    let builtins = vm.builtins;
    vm.heap.get_mut(builtins).set_attr(intern(name), value);
}

/// Never runs: calls to `__build_class__` are intercepted by identity in
/// the call machinery.
pub(crate) fn build_class_stub(ctx: &mut dyn Ctx, _args: &[Value]) -> PyResult<Value> {
    Err(ctx.raise(
        ExcKind::RuntimeError,
        "__build_class__ invoked outside the interpreter".to_string(),
    ))
}

// =============================================================================
// Functions
// =============================================================================

fn builtin_print(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(protocol::str_value(ctx, arg)?);
    }
    let line = format!("{}\n", parts.join(" "));
    ctx.write_stdout(&line);
    Ok(Value::None)
}

fn builtin_len(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "len", args, 1)?;
    let n = protocol::len_of(ctx, &args[0])?;
    Ok(Value::int(n as i64))
}

fn builtin_range(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    let as_int = |ctx: &mut dyn Ctx, v: &Value| -> PyResult<i64> {
        v.as_i64().ok_or_else(|| {
            ctx.raise(
                ExcKind::TypeError,
                "range() arguments must be integers".to_string(),
            )
        })
    };
    let (start, stop, step) = match args.len() {
        1 => (0, as_int(ctx, &args[0])?, 1),
        2 => (as_int(ctx, &args[0])?, as_int(ctx, &args[1])?, 1),
        3 => (
            as_int(ctx, &args[0])?,
            as_int(ctx, &args[1])?,
            as_int(ctx, &args[2])?,
        ),
        n => {
            return Err(ctx.raise(
                ExcKind::TypeError,
                format!("range() takes 1 to 3 arguments but {n} were given"),
            ));
        }
    };
    if step == 0 {
        return Err(ctx.raise(
            ExcKind::ValueError,
            "range() step must not be zero".to_string(),
        ));
    }
    let obj = ctx.alloc(PyObject::new(
        TypeId::RANGE,
        Payload::Range(RangeData { start, stop, step }),
    ))?;
    Ok(Value::Object(obj))
}

fn builtin_iter(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "iter", args, 1)?;
    protocol::get_iter(ctx, &args[0])
}

fn builtin_next(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(ctx.raise(
            ExcKind::TypeError,
            format!("next() takes 1 or 2 arguments but {} were given", args.len()),
        ));
    }
    match protocol::iter_next(ctx, &args[0])? {
        Some(value) => Ok(value),
        None => match args.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(ctx.raise(ExcKind::StopIteration, String::new())),
        },
    }
}

fn builtin_type(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "type", args, 1)?;
    let tid = protocol::type_id_of(ctx, &args[0]);
    let type_obj = ctx.type_object(tid)?;
    Ok(Value::Object(type_obj))
}

fn builtin_isinstance(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "isinstance", args, 2)?;
    Ok(Value::Bool(isinstance(ctx, &args[0], &args[1])?))
}

/// MRO-based instance check; the classinfo may be a type or a tuple of
/// types.
pub(crate) fn isinstance(ctx: &mut dyn Ctx, value: &Value, classinfo: &Value) -> PyResult<bool> {
    if let Value::Object(r) = classinfo {
        match &ctx.heap().get(*r).payload {
            Payload::Type(_) => {
                let tid = protocol::type_id_of(ctx, value);
                let type_obj = ctx.type_object(tid)?;
                let mro = ctx
                    .heap()
                    .get(type_obj)
                    .payload
                    .as_type()
                    .map(|td| td.mro.clone())
                    .unwrap_or_default();
                return Ok(mro.contains(r));
            }
            Payload::Tuple(options) => {
                let options = options.clone();
                for option in &options {
                    if isinstance(ctx, value, option)? {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            _ => {}
        }
    }
    Err(ctx.raise(
        ExcKind::TypeError,
        "isinstance() arg 2 must be a type or tuple of types".to_string(),
    ))
}

fn builtin_repr(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "repr", args, 1)?;
    Ok(Value::Str(protocol::repr_value(ctx, &args[0])?.into()))
}

fn builtin_str(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    if args.is_empty() {
        return Ok(Value::Str("".into()));
    }
    expect_arity(ctx, "str", args, 1)?;
    Ok(Value::Str(protocol::str_value(ctx, &args[0])?.into()))
}

fn builtin_bool(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    if args.is_empty() {
        return Ok(Value::Bool(false));
    }
    expect_arity(ctx, "bool", args, 1)?;
    Ok(Value::Bool(protocol::truthy(ctx, &args[0])?))
}

fn builtin_abs(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "abs", args, 1)?;
    match &args[0] {
        Value::Bool(b) => Ok(Value::int(*b as i64)),
        Value::Int(i) if !i.is_negative() => Ok(args[0].clone()),
        Value::Int(_) => Ok(opal_core::negate(&args[0]).expect("numeric")),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => {
            let tname = protocol::type_name(ctx, other);
            Err(ctx.raise(
                ExcKind::TypeError,
                format!("bad operand type for abs(): '{tname}'"),
            ))
        }
    }
}

fn builtin_hash(ctx: &mut dyn Ctx, args: &[Value]) -> PyResult<Value> {
    expect_arity(ctx, "hash", args, 1)?;
    let h = protocol::value_hash(ctx, &args[0])?;
    Ok(Value::int(h as i64))
}

fn expect_arity(ctx: &mut dyn Ctx, name: &str, args: &[Value], expected: usize) -> PyResult<()> {
    if args.len() != expected {
        return Err(ctx.raise(
            ExcKind::TypeError,
            format!(
                "{name}() takes {expected} argument(s) but {} were given",
                args.len()
            ),
        ));
    }
    Ok(())
}
