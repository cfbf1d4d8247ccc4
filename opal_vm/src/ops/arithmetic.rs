//! Arithmetic, comparison, membership and identity opcodes.
//!
//! All value behavior lives in the runtime protocol; these handlers only
//! shuttle operands between registers and dispatch.

use super::Flow;
use crate::machine::VirtualMachine;
use opal_compiler::{Instruction, Opcode};
use opal_core::{NumOp, ObjRef, Value};
use opal_runtime::context::PyResult;
use opal_runtime::protocol::{self, CmpKind, UnaryKind};

pub(super) fn binary(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let op = match inst.opcode() {
        Opcode::Add => NumOp::Add,
        Opcode::Sub => NumOp::Sub,
        Opcode::Mul => NumOp::Mul,
        Opcode::TrueDiv => NumOp::TrueDiv,
        Opcode::FloorDiv => NumOp::FloorDiv,
        Opcode::Mod => NumOp::Mod,
        Opcode::Pow => NumOp::Pow,
        Opcode::Shl => NumOp::Shl,
        Opcode::Shr => NumOp::Shr,
        Opcode::BitAnd => NumOp::BitAnd,
        Opcode::BitOr => NumOp::BitOr,
        Opcode::BitXor => NumOp::BitXor,
        other => unreachable!("{other:?} routed to binary arithmetic"),
    };
    let lhs = vm.reg(frame, inst.b());
    let rhs = vm.reg(frame, inst.c());
    let result = protocol::binary(vm, op, &lhs, &rhs)?;
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

pub(super) fn unary(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let kind = match inst.opcode() {
        Opcode::Neg => UnaryKind::Neg,
        Opcode::Pos => UnaryKind::Pos,
        Opcode::Invert => UnaryKind::Invert,
        Opcode::Not => UnaryKind::Not,
        other => unreachable!("{other:?} routed to unary arithmetic"),
    };
    let operand = vm.reg(frame, inst.b());
    let result = protocol::unary(vm, kind, &operand)?;
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

pub(super) fn compare(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let kind = match inst.opcode() {
        Opcode::Eq => CmpKind::Eq,
        Opcode::Ne => CmpKind::Ne,
        Opcode::Lt => CmpKind::Lt,
        Opcode::Le => CmpKind::Le,
        Opcode::Gt => CmpKind::Gt,
        Opcode::Ge => CmpKind::Ge,
        other => unreachable!("{other:?} routed to comparison"),
    };
    let lhs = vm.reg(frame, inst.b());
    let rhs = vm.reg(frame, inst.c());
    let result = protocol::rich_compare(vm, kind, &lhs, &rhs)?;
    vm.set_reg(frame, inst.a(), result);
    Ok(Flow::Continue)
}

pub(super) fn membership(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let needle = vm.reg(frame, inst.b());
    let container = vm.reg(frame, inst.c());
    let found = protocol::contains(vm, &container, &needle)?;
    let result = match inst.opcode() {
        Opcode::In => found,
        Opcode::NotIn => !found,
        other => unreachable!("{other:?} routed to membership"),
    };
    vm.set_reg(frame, inst.a(), Value::Bool(result));
    Ok(Flow::Continue)
}

pub(super) fn identity(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    let lhs = vm.reg(frame, inst.b());
    let rhs = vm.reg(frame, inst.c());
    let same = protocol::value_is(&lhs, &rhs);
    let result = match inst.opcode() {
        Opcode::Is => same,
        Opcode::IsNot => !same,
        other => unreachable!("{other:?} routed to identity"),
    };
    vm.set_reg(frame, inst.a(), Value::Bool(result));
    Ok(Flow::Continue)
}
