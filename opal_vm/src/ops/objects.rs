//! Attribute, subscript and import opcodes.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::Instruction;
use opal_core::{ObjRef, Value};
use opal_runtime::context::{ExcKind, PyResult};
use opal_runtime::object::attr;
use opal_runtime::protocol;
use opal_runtime::Ctx;
use opal_runtime::Payload;
use std::sync::Arc;

fn name_at(vm: &VirtualMachine, frame: ObjRef, idx: u16) -> Arc<str> {
    vm.frame_data(frame).code.names[idx as usize].clone()
}

pub(super) fn load_attr(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let name = name_at(vm, frame, inst.imm());
    let value = attr::get_attribute(vm, &obj, &name)?;
    vm.set_reg(frame, inst.a(), value);
    Ok(Flow::Continue)
}

/// Object in `a`, value in `a + 1`.
pub(super) fn store_attr(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let value = vm.reg(frame, inst.a() + 1);
    let name = name_at(vm, frame, inst.imm());
    attr::set_attribute(vm, &obj, &name, value)?;
    Ok(Flow::Continue)
}

pub(super) fn delete_attr(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let name = name_at(vm, frame, inst.imm());
    attr::del_attribute(vm, &obj, &name)?;
    Ok(Flow::Continue)
}

pub(super) fn get_item(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.b());
    let key = vm.reg(frame, inst.c());
    let value = protocol::get_item(vm, &obj, &key)?;
    vm.set_reg(frame, inst.a(), value);
    Ok(Flow::Continue)
}

pub(super) fn set_item(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let key = vm.reg(frame, inst.b());
    let value = vm.reg(frame, inst.c());
    protocol::set_item(vm, &obj, &key, &value)?;
    Ok(Flow::Continue)
}

pub(super) fn del_item(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let obj = vm.reg(frame, inst.a());
    let key = vm.reg(frame, inst.b());
    protocol::del_item(vm, &obj, &key)?;
    Ok(Flow::Continue)
}

pub(super) fn import(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let name = name_at(vm, frame, inst.imm());
    match vm.modules.get(&name).copied() {
        Some(module) => {
            vm.set_reg(frame, inst.a(), Value::Object(module));
            Ok(Flow::Continue)
        }
        None => Err(vm.raise(
            ExcKind::ModuleNotFoundError,
            format!("No module named '{name}'"),
        )),
    }
}

/// Module in `a`, replaced by the imported attribute.
pub(super) fn import_from(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let module = vm.reg(frame, inst.a());
    let name = name_at(vm, frame, inst.imm());
    let Some(r) = module.as_object() else {
        return Err(vm.raise(ExcKind::ImportError, "import source is not a module".to_string()));
    };
    match vm.heap.get(r).get_attr(&name) {
        Some(value) => {
            vm.set_reg(frame, inst.a(), value);
            Ok(Flow::Continue)
        }
        None => {
            let module_name = match &vm.heap.get(r).payload {
                Payload::Module { name } => name.to_string(),
                _ => "<module>".to_string(),
            };
            Err(vm.raise(
                ExcKind::ImportError,
                format!("cannot import name '{name}' from '{module_name}'"),
            ))
        }
    }
}

/// Dump a module's public names into the current globals.
pub(super) fn import_star(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let module = vm.reg(frame, inst.a());
    let Some(r) = module.as_object() else {
        return Err(vm.raise(ExcKind::ImportError, "import source is not a module".to_string()));
    };
    let entries: Vec<(Arc<str>, Value)> = vm
        .heap
        .get(r)
        .attrs
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let globals = vm.frame_data(frame).globals;
    for (name, value) in entries {
        protocol::dict_set(vm, globals, Value::Str(name), value)?;
    }
    Ok(Flow::Continue)
}
