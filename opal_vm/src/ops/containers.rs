//! Container builder opcodes.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::{Instruction, Opcode};
use opal_core::{ObjRef, Value};
use opal_runtime::context::{Ctx, ExcKind, PyResult};
use opal_runtime::protocol;
use opal_runtime::types::dict::DictStorage;
use opal_runtime::{Payload, PyObject, TypeId};

fn read_window(vm: &VirtualMachine, frame: ObjRef, base: u8, count: usize) -> Vec<Value> {
    (0..count).map(|i| vm.reg(frame, base + i as u8)).collect()
}

pub(super) fn build(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let count = inst.c() as usize;
    let value = match inst.opcode() {
        Opcode::BuildList => {
            let items = read_window(vm, frame, inst.b(), count);
            let obj = vm.alloc(PyObject::new(TypeId::LIST, Payload::List(items)))?;
            Value::Object(obj)
        }
        Opcode::BuildTuple => {
            let items = read_window(vm, frame, inst.b(), count);
            let obj = vm.alloc(PyObject::new(TypeId::TUPLE, Payload::Tuple(items)))?;
            Value::Object(obj)
        }
        Opcode::BuildSet => {
            let items = read_window(vm, frame, inst.b(), count);
            let set = vm.alloc(PyObject::new(TypeId::SET, Payload::Set(DictStorage::new())))?;
            for item in items {
                protocol::dict_set(vm, set, item, Value::None)?;
            }
            Value::Object(set)
        }
        Opcode::BuildDict => {
            // The window holds `count` key/value pairs.
            let items = read_window(vm, frame, inst.b(), count * 2);
            let dict = vm.alloc(PyObject::new(
                TypeId::DICT,
                Payload::Dict(DictStorage::new()),
            ))?;
            for pair in items.chunks(2) {
                protocol::dict_set(vm, dict, pair[0].clone(), pair[1].clone())?;
            }
            Value::Object(dict)
        }
        Opcode::BuildString => {
            let items = read_window(vm, frame, inst.b(), count);
            let mut out = String::new();
            for item in &items {
                out.push_str(&protocol::str_value(vm, item)?);
            }
            Value::Str(out.into())
        }
        other => unreachable!("{other:?} routed to container builder"),
    };
    vm.set_reg(frame, inst.a(), value);
    Ok(Flow::Continue)
}

pub(super) fn build_slice(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let base = inst.b();
    let slice = vm.alloc(PyObject::new(
        TypeId::SLICE,
        Payload::Slice {
            start: vm.reg(frame, base),
            stop: vm.reg(frame, base + 1),
            step: vm.reg(frame, base + 2),
        },
    ))?;
    vm.set_reg(frame, inst.a(), Value::Object(slice));
    Ok(Flow::Continue)
}

fn expect_list(vm: &mut VirtualMachine, frame: ObjRef, register: u8) -> PyResult<ObjRef> {
    match vm.reg(frame, register) {
        Value::Object(r) if matches!(vm.heap.get(r).payload, Payload::List(_)) => Ok(r),
        _ => unreachable!("compiler-managed register does not hold a list"),
    }
}

pub(super) fn list_append(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let list = expect_list(vm, frame, inst.a())?;
    let item = vm.reg(frame, inst.b());
    match &mut vm.heap.get_mut(list).payload {
        Payload::List(items) => items.push(item),
        _ => unreachable!("checked by expect_list"),
    }
    Ok(Flow::Continue)
}

pub(super) fn list_extend(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let list = expect_list(vm, frame, inst.a())?;
    let iterable = vm.reg(frame, inst.b());
    let iter = protocol::get_iter(vm, &iterable)?;
    while let Some(item) = protocol::iter_next(vm, &iter)? {
        match &mut vm.heap.get_mut(list).payload {
            Payload::List(items) => items.push(item),
            _ => unreachable!("checked by expect_list"),
        }
    }
    Ok(Flow::Continue)
}

pub(super) fn set_add(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let set = match vm.reg(frame, inst.a()) {
        Value::Object(r) => r,
        _ => unreachable!("compiler-managed register does not hold a set"),
    };
    let item = vm.reg(frame, inst.b());
    protocol::dict_set(vm, set, item, Value::None)?;
    Ok(Flow::Continue)
}

pub(super) fn dict_add(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let dict = match vm.reg(frame, inst.a()) {
        Value::Object(r) => r,
        _ => unreachable!("compiler-managed register does not hold a dict"),
    };
    let key = vm.reg(frame, inst.b());
    let value = vm.reg(frame, inst.c());
    protocol::dict_set(vm, dict, key, value)?;
    Ok(Flow::Continue)
}

pub(super) fn dict_update(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let dict = match vm.reg(frame, inst.a()) {
        Value::Object(r) => r,
        _ => unreachable!("compiler-managed register does not hold a dict"),
    };
    let other = vm.reg(frame, inst.b());
    opal_runtime::types::dict::dict_update(vm, dict, &other)?;
    Ok(Flow::Continue)
}

/// Unpack an iterable into exactly `count` registers.
pub(super) fn unpack_sequence(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let count = inst.c() as usize;
    let source = vm.reg(frame, inst.a());
    let iter = protocol::get_iter(vm, &source)?;

    let mut items = Vec::with_capacity(count);
    while items.len() < count {
        match protocol::iter_next(vm, &iter)? {
            Some(item) => items.push(item),
            None => {
                return Err(vm.raise(
                    ExcKind::ValueError,
                    format!(
                        "not enough values to unpack (expected {count}, got {})",
                        items.len()
                    ),
                ));
            }
        }
    }
    if protocol::iter_next(vm, &iter)?.is_some() {
        return Err(vm.raise(
            ExcKind::ValueError,
            format!("too many values to unpack (expected {count})"),
        ));
    }

    for (i, item) in items.into_iter().enumerate() {
        vm.set_reg(frame, inst.b() + i as u8, item);
    }
    Ok(Flow::Continue)
}
