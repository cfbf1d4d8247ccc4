//! Iterator opcodes.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::Instruction;
use opal_core::{ObjRef, Value};
use opal_runtime::context::PyResult;
use opal_runtime::protocol;

pub(super) fn get_iter(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let iterable = vm.reg(frame, inst.b());
    let iter = protocol::get_iter(vm, &iterable)?;
    vm.set_reg(frame, inst.a(), iter);
    Ok(Flow::Continue)
}

/// Advance the loop iterator in `a`; the next element lands in `a + 1`.
/// StopIteration is consumed here and turns into the exhaustion jump.
pub(super) fn for_iter(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let iter = vm.reg(frame, inst.a());
    match protocol::iter_next(vm, &iter)? {
        Some(item) => {
            vm.set_reg(frame, inst.a() + 1, item);
        }
        None => {
            vm.jump(frame, inst.offset());
        }
    }
    Ok(Flow::Continue)
}

/// Delegate one step to a sub-iterator. The instruction re-executes at
/// the same pc on every resume until the delegate is exhausted, so the
/// suspended frame needs no extra state.
pub(super) fn yield_from(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let iter = vm.reg(frame, inst.a());
    match protocol::iter_next(vm, &iter)? {
        Some(item) => {
            vm.set_reg(frame, 0, item);
            // Point the ip back at this instruction for the next resume.
            let data = vm.frame_data_mut(frame);
            data.ip -= 1;
            Ok(Flow::Yield)
        }
        None => {
            // The delegation expression evaluates to None.
            vm.set_reg(frame, 0, Value::None);
            Ok(Flow::Continue)
        }
    }
}
