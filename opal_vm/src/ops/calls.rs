//! Call-family opcodes and function construction.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::{Const, Instruction};
use opal_core::{ObjRef, Value};
use opal_runtime::context::{Ctx, ExcKind, PyResult};
use opal_runtime::object::attr;
use opal_runtime::protocol;
use opal_runtime::types::function::FunctionData;
use opal_runtime::{Payload, PyObject, TypeId};
use std::sync::Arc;

/// Split a call's argument window into positional and keyword parts
/// using the names announced by a preceding `KwNames`.
fn collect_args(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    first: u8,
    count: usize,
) -> (Vec<Value>, Vec<(Arc<str>, Value)>) {
    let values: Vec<Value> = (0..count).map(|i| vm.reg(frame, first + i as u8)).collect();
    let kwnames = vm.frame_data_mut(frame).pending_kwnames.take();
    match kwnames {
        None => (values, Vec::new()),
        Some(names) => {
            let split = values.len() - names.len();
            let mut kwargs = Vec::with_capacity(names.len());
            for (name, value) in names.iter().zip(&values[split..]) {
                kwargs.push((name.clone(), value.clone()));
            }
            (values[..split].to_vec(), kwargs)
        }
    }
}

pub(super) fn call(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let callee = vm.reg(frame, inst.b());
    let (args, kwargs) = collect_args(vm, frame, inst.b() + 1, inst.c() as usize);
    let result = vm.call_value(callee, &args, &kwargs)?;
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

pub(super) fn kw_names(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let names = {
        let data = vm.frame_data(frame);
        match &data.code.consts[inst.imm() as usize] {
            Const::Names(names) => names.clone(),
            _ => unreachable!("KwNames immediate is not a names constant"),
        }
    };
    vm.frame_data_mut(frame).pending_kwnames = Some(names);
    Ok(Flow::Continue)
}

pub(super) fn call_ex(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let callee = vm.reg(frame, inst.b());

    let args: Vec<Value> = match vm.reg(frame, inst.b() + 1) {
        Value::Object(r) => match &vm.heap.get(r).payload {
            Payload::List(items) => items.clone(),
            Payload::Tuple(items) => items.clone(),
            _ => unreachable!("CallEx argument register does not hold a sequence"),
        },
        _ => unreachable!("CallEx argument register does not hold a sequence"),
    };

    let mut kwargs: Vec<(Arc<str>, Value)> = Vec::new();
    if inst.c() & 1 != 0 {
        let dict = match vm.reg(frame, inst.b() + 2) {
            Value::Object(r) => r,
            _ => unreachable!("CallEx keyword register does not hold a dict"),
        };
        let entries: Vec<(Value, Value)> = match &vm.heap.get(dict).payload {
            Payload::Dict(storage) => storage
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => unreachable!("CallEx keyword register does not hold a dict"),
        };
        for (key, value) in entries {
            match key {
                Value::Str(name) => kwargs.push((name, value)),
                other => {
                    let tname = protocol::type_name(vm, &other);
                    return Err(vm.raise(
                        ExcKind::TypeError,
                        format!("keywords must be strings, not '{tname}'"),
                    ));
                }
            }
        }
    }

    let result = vm.call_value(callee, &args, &kwargs)?;
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

/// Resolve `obj.name` for an immediate call. When the resolved attribute
/// is a plain function on the class (no instance override), it is left
/// unbound with the receiver alongside, skipping the bound-method
/// allocation; otherwise the fully-bound attribute is paired with the
/// unset sentinel.
pub(super) fn load_method(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let name = vm.frame_data(frame).code.names[inst.imm() as usize].clone();

    let tid = protocol::type_id_of(vm, &obj);
    let type_obj = vm.type_object(tid)?;
    if let Some(class_attr) = attr::type_lookup(vm, type_obj, &name) {
        let is_plain_function = matches!(
            class_attr.as_object().map(|r| &vm.heap.get(r).payload),
            Some(Payload::Function(_)) | Some(Payload::BuiltinFunction(_))
        );
        let shadowed = obj
            .as_object()
            .is_some_and(|r| vm.heap.get(r).attrs.contains_key(&*name));
        if is_plain_function && !shadowed {
            vm.set_reg(frame, inst.a(), class_attr);
            vm.set_reg(frame, inst.a() + 1, obj);
            return Ok(Flow::Continue);
        }
    }

    let bound = attr::get_attribute(vm, &obj, &name)?;
    let unset = vm.unset_value();
    vm.set_reg(frame, inst.a(), bound);
    vm.set_reg(frame, inst.a() + 1, unset);
    Ok(Flow::Continue)
}

pub(super) fn call_method(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let method = vm.reg(frame, inst.b());
    let receiver = vm.reg(frame, inst.b() + 1);
    let (args, kwargs) = collect_args(vm, frame, inst.b() + 2, inst.c() as usize);

    let result = if vm.is_unset(&receiver) {
        vm.call_value(method, &args, &kwargs)?
    } else {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver);
        full.extend(args);
        vm.call_value(method, &full, &kwargs)?
    };
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

/// Build a function object: code from the constant pool, defaults tuple,
/// keyword-only defaults dict and closure tuple from the registers
/// following the destination.
pub(super) fn make_function(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let code = {
        let data = vm.frame_data(frame);
        match &data.code.consts[inst.imm() as usize] {
            Const::Code(code) => code.clone(),
            _ => unreachable!("MakeFunction immediate is not a code constant"),
        }
    };

    let defaults: Vec<Value> = match vm.reg(frame, inst.a() + 1) {
        Value::None => Vec::new(),
        Value::Object(r) => match &vm.heap.get(r).payload {
            Payload::Tuple(items) => items.clone(),
            _ => unreachable!("defaults register does not hold a tuple"),
        },
        _ => unreachable!("defaults register does not hold a tuple"),
    };

    let kw_defaults: Vec<(Arc<str>, Value)> = match vm.reg(frame, inst.a() + 2) {
        Value::None => Vec::new(),
        Value::Object(r) => match &vm.heap.get(r).payload {
            Payload::Dict(storage) => storage
                .iter()
                .filter_map(|(k, v)| match k {
                    Value::Str(name) => Some((name.clone(), v.clone())),
                    _ => None,
                })
                .collect(),
            _ => unreachable!("kw-defaults register does not hold a dict"),
        },
        _ => unreachable!("kw-defaults register does not hold a dict"),
    };

    let closure: Vec<ObjRef> = match vm.reg(frame, inst.a() + 3) {
        Value::None => Vec::new(),
        Value::Object(r) => match &vm.heap.get(r).payload {
            Payload::Tuple(items) => items
                .iter()
                .map(|cell| match cell {
                    Value::Object(c) => *c,
                    _ => unreachable!("closure tuple holds non-cell"),
                })
                .collect(),
            _ => unreachable!("closure register does not hold a tuple"),
        },
        _ => unreachable!("closure register does not hold a tuple"),
    };

    let globals = vm.frame_data(frame).globals;
    let qualname = code.qualname.clone();
    let function = vm.alloc(PyObject::new(
        TypeId::FUNCTION,
        Payload::Function(FunctionData {
            code,
            globals,
            defaults,
            kw_defaults,
            closure,
            qualname,
        }),
    ))?;
    vm.set_reg(frame, inst.a(), Value::Object(function));
    Ok(Flow::Continue)
}
