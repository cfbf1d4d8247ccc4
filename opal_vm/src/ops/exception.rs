//! Exception opcodes: raising, handler matching, stash management.
//!
//! The unwinder (in the dispatch loop) pushes the in-flight exception
//! onto the frame's stash stack before jumping to a handler, so the
//! opcodes here only inspect and pop that stack.

use super::Flow;
use crate::builtins::isinstance;
use crate::machine::VirtualMachine;
use opal_compiler::Instruction;
use opal_core::{ObjRef, Value};
use opal_runtime::context::{Ctx, ExcKind, PyResult, Raised};
use opal_runtime::protocol;
use opal_runtime::{Payload, TypeFlags};

/// `raise expr`: the operand is an exception instance or an exception
/// type (instantiated with no arguments).
pub(super) fn raise_value(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let value = vm.reg(frame, inst.a());
    let exc = exception_from_value(vm, value)?;
    Err(Raised(exc))
}

pub(super) fn exception_from_value(vm: &mut VirtualMachine, value: Value) -> PyResult<ObjRef> {
    if let Value::Object(r) = &value {
        match &vm.heap.get(*r).payload {
            Payload::Exception { .. } => return Ok(*r),
            Payload::Type(td) if td.flags.contains(TypeFlags::EXCEPTION) => {
                let instance = vm.call_value(value.clone(), &[], &[])?;
                match instance {
                    Value::Object(obj) => return Ok(obj),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    let tname = protocol::type_name(vm, &value);
    Err(vm.raise(
        ExcKind::TypeError,
        format!("exceptions must derive from BaseException, not '{tname}'"),
    ))
}

/// Bare `raise` and handler fall-through: pop the current exception and
/// propagate it onward.
pub(super) fn reraise(vm: &mut VirtualMachine, frame: ObjRef) -> PyResult<Flow> {
    match vm.frame_data_mut(frame).exc_stack.pop() {
        Some(exc) => Err(Raised(exc)),
        None => Err(vm.raise(
            ExcKind::RuntimeError,
            "no active exception to re-raise".to_string(),
        )),
    }
}

/// Skip the handler body when the stashed exception does not match the
/// expected type (MRO subclass check; tuples of types allowed).
pub(super) fn jump_if_not_match(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let expected = vm.reg(frame, inst.a());
    let Some(exc) = vm.frame_data(frame).exc_stack.last().copied() else {
        return Err(vm.raise(
            ExcKind::RuntimeError,
            "exception match outside a handler".to_string(),
        ));
    };
    if !isinstance(vm, &Value::Object(exc), &expected)? {
        vm.jump(frame, inst.offset());
    }
    Ok(Flow::Continue)
}

/// The current exception (top of the stash) for `except ... as name`.
pub(super) fn load_exception(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let Some(exc) = vm.frame_data(frame).exc_stack.last().copied() else {
        return Err(vm.raise(
            ExcKind::RuntimeError,
            "no active exception".to_string(),
        ));
    };
    vm.set_reg(frame, inst.a(), Value::Object(exc));
    Ok(Flow::Continue)
}

/// Leave a handler normally, dropping the handled exception.
pub(super) fn pop_exception(vm: &mut VirtualMachine, frame: ObjRef) -> PyResult<Flow> {
    vm.frame_data_mut(frame).exc_stack.pop();
    Ok(Flow::Continue)
}
