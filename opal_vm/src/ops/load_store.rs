//! Load/store opcodes: registers, globals, dict-based names, cells.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::{Const, Instruction, FIRST_LOCAL_REGISTER};
use opal_core::Value;
use opal_runtime::context::{Ctx, ExcKind, PyResult};
use opal_runtime::protocol;
use opal_runtime::{Payload, PyObject, TypeId};
use std::sync::Arc;

pub(super) fn load_const(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let constant = {
        let data = vm.frame_data(frame);
        data.code.consts[inst.imm() as usize].clone()
    };
    let value = match constant {
        Const::Value(v) => v,
        Const::Code(code) => {
            let obj = vm.alloc(PyObject::new(TypeId::CODE, Payload::Code(code)))?;
            Value::Object(obj)
        }
        Const::Names(_) => unreachable!("kwnames constant loaded as a value"),
    };
    vm.set_reg(frame, inst.a(), value);
    Ok(Flow::Continue)
}

fn local_name(vm: &VirtualMachine, frame: opal_core::ObjRef, slot: u16) -> Arc<str> {
    vm.frame_data(frame).code.varnames[slot as usize].clone()
}

pub(super) fn load_local(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let slot = inst.imm();
    let value = vm.reg(frame, FIRST_LOCAL_REGISTER + slot as u8);
    if vm.is_unset(&value) {
        let name = local_name(vm, frame, slot);
        return Err(vm.raise(
            ExcKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        ));
    }
    vm.set_reg(frame, inst.a(), value);
    Ok(Flow::Continue)
}

pub(super) fn store_local(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let value = vm.reg(frame, inst.a());
    vm.set_reg(frame, FIRST_LOCAL_REGISTER + inst.imm() as u8, value);
    Ok(Flow::Continue)
}

pub(super) fn delete_local(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let slot = inst.imm();
    let register = FIRST_LOCAL_REGISTER + slot as u8;
    let current = vm.reg(frame, register);
    if vm.is_unset(&current) {
        let name = local_name(vm, frame, slot);
        return Err(vm.raise(
            ExcKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        ));
    }
    let unset = vm.unset_value();
    vm.set_reg(frame, register, unset);
    Ok(Flow::Continue)
}

fn global_name(vm: &VirtualMachine, frame: opal_core::ObjRef, idx: u16) -> Arc<str> {
    vm.frame_data(frame).code.names[idx as usize].clone()
}

/// Module-level lookup: the globals dict, then the builtins module.
fn lookup_global(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    name: &Arc<str>,
) -> PyResult<Option<Value>> {
    let globals = vm.frame_data(frame).globals;
    if let Some(value) = protocol::dict_get(vm, globals, &Value::Str(name.clone()))? {
        return Ok(Some(value));
    }
    let builtins = vm.frame_data(frame).builtins;
    Ok(vm.heap.get(builtins).get_attr(name))
}

pub(super) fn load_global(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    match lookup_global(vm, frame, &name)? {
        Some(value) => {
            vm.set_reg(frame, inst.a(), value);
            Ok(Flow::Continue)
        }
        None => Err(vm.raise(ExcKind::NameError, format!("name '{name}' is not defined"))),
    }
}

pub(super) fn store_global(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    let value = vm.reg(frame, inst.a());
    let globals = vm.frame_data(frame).globals;
    protocol::dict_set(vm, globals, Value::Str(name), value)?;
    Ok(Flow::Continue)
}

pub(super) fn delete_global(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    let globals = vm.frame_data(frame).globals;
    match protocol::dict_remove(vm, globals, &Value::Str(name.clone()))? {
        Some(_) => Ok(Flow::Continue),
        None => Err(vm.raise(ExcKind::NameError, format!("name '{name}' is not defined"))),
    }
}

/// Dict-based name lookup for class bodies: locals, globals, builtins.
pub(super) fn load_name(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    if let Some(locals) = vm.frame_data(frame).locals {
        if let Some(value) = protocol::dict_get(vm, locals, &Value::Str(name.clone()))? {
            vm.set_reg(frame, inst.a(), value);
            return Ok(Flow::Continue);
        }
    }
    match lookup_global(vm, frame, &name)? {
        Some(value) => {
            vm.set_reg(frame, inst.a(), value);
            Ok(Flow::Continue)
        }
        None => Err(vm.raise(ExcKind::NameError, format!("name '{name}' is not defined"))),
    }
}

pub(super) fn store_name(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    let value = vm.reg(frame, inst.a());
    let target = vm
        .frame_data(frame)
        .locals
        .unwrap_or(vm.frame_data(frame).globals);
    protocol::dict_set(vm, target, Value::Str(name), value)?;
    Ok(Flow::Continue)
}

pub(super) fn delete_name(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = global_name(vm, frame, inst.imm());
    let target = vm
        .frame_data(frame)
        .locals
        .unwrap_or(vm.frame_data(frame).globals);
    match protocol::dict_remove(vm, target, &Value::Str(name.clone()))? {
        Some(_) => Ok(Flow::Continue),
        None => Err(vm.raise(ExcKind::NameError, format!("name '{name}' is not defined"))),
    }
}

fn cell_name(vm: &VirtualMachine, frame: opal_core::ObjRef, slot: u16) -> (Arc<str>, bool) {
    let code = &vm.frame_data(frame).code;
    let slot = slot as usize;
    if slot < code.cellvars.len() {
        (code.cellvars[slot].clone(), true)
    } else {
        (code.freevars[slot - code.cellvars.len()].clone(), false)
    }
}

pub(super) fn load_deref(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let cell = vm.frame_data(frame).cells[inst.imm() as usize];
    let contents = match &vm.heap.get(cell).payload {
        Payload::Cell(v) => v.clone(),
        _ => unreachable!("cell slot does not hold a cell"),
    };
    match contents {
        Some(value) => {
            vm.set_reg(frame, inst.a(), value);
            Ok(Flow::Continue)
        }
        None => {
            let (name, own) = cell_name(vm, frame, inst.imm());
            if own {
                Err(vm.raise(
                    ExcKind::UnboundLocalError,
                    format!("local variable '{name}' referenced before assignment"),
                ))
            } else {
                Err(vm.raise(
                    ExcKind::NameError,
                    format!("free variable '{name}' referenced before assignment in enclosing scope"),
                ))
            }
        }
    }
}

pub(super) fn store_deref(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let value = vm.reg(frame, inst.a());
    let cell = vm.frame_data(frame).cells[inst.imm() as usize];
    match &mut vm.heap.get_mut(cell).payload {
        Payload::Cell(v) => *v = Some(value),
        _ => unreachable!("cell slot does not hold a cell"),
    }
    Ok(Flow::Continue)
}

pub(super) fn load_closure(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let cell = vm.frame_data(frame).cells[inst.imm() as usize];
    vm.set_reg(frame, inst.a(), Value::Object(cell));
    Ok(Flow::Continue)
}

pub(super) fn jump_if(
    vm: &mut VirtualMachine,
    frame: opal_core::ObjRef,
    inst: Instruction,
    when: bool,
) -> PyResult<Flow> {
    let test = vm.reg(frame, inst.a());
    if protocol::truthy(vm, &test)? == when {
        vm.jump(frame, inst.offset());
    }
    Ok(Flow::Continue)
}
