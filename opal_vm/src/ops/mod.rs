//! Opcode handlers, grouped by category.
//!
//! Every handler returns `Result<Flow, Raised>`: the success value steers
//! the dispatch loop, the error is an exception object on its way to a
//! handler. Handlers read their operands from the executing frame's
//! registers and leave results in the destination register.

mod arithmetic;
mod calls;
mod containers;
mod exception;
mod iteration;
mod load_store;
mod objects;

use crate::machine::VirtualMachine;
use opal_compiler::{Instruction, Opcode};
use opal_core::{ObjRef, Value};
use opal_runtime::context::PyResult;

/// What the dispatch loop does after an instruction.
pub(crate) enum Flow {
    Continue,
    /// Propagate register 0 to the caller.
    Return,
    /// Suspend with register 0 as the yielded value.
    Yield,
}

pub(crate) fn exec(
    vm: &mut VirtualMachine,
    frame: ObjRef,
    inst: Instruction,
) -> PyResult<Flow> {
    use Opcode::*;

    match inst.opcode() {
        Nop => Ok(Flow::Continue),

        // Loads and stores
        LoadConst => load_store::load_const(vm, frame, inst),
        LoadNone => {
            vm.set_reg(frame, inst.a(), Value::None);
            Ok(Flow::Continue)
        }
        LoadTrue => {
            vm.set_reg(frame, inst.a(), Value::Bool(true));
            Ok(Flow::Continue)
        }
        LoadFalse => {
            vm.set_reg(frame, inst.a(), Value::Bool(false));
            Ok(Flow::Continue)
        }
        Move => {
            let value = vm.reg(frame, inst.b());
            vm.set_reg(frame, inst.a(), value);
            Ok(Flow::Continue)
        }
        LoadLocal => load_store::load_local(vm, frame, inst),
        StoreLocal => load_store::store_local(vm, frame, inst),
        DeleteLocal => load_store::delete_local(vm, frame, inst),
        LoadGlobal => load_store::load_global(vm, frame, inst),
        StoreGlobal => load_store::store_global(vm, frame, inst),
        DeleteGlobal => load_store::delete_global(vm, frame, inst),
        LoadName => load_store::load_name(vm, frame, inst),
        StoreName => load_store::store_name(vm, frame, inst),
        DeleteName => load_store::delete_name(vm, frame, inst),
        LoadDeref => load_store::load_deref(vm, frame, inst),
        StoreDeref => load_store::store_deref(vm, frame, inst),
        LoadClosure => load_store::load_closure(vm, frame, inst),
        LoadBuildClass => {
            let marker = Value::Object(vm.build_class_marker);
            vm.set_reg(frame, inst.a(), marker);
            Ok(Flow::Continue)
        }

        // Arithmetic, logic, comparison
        Add | Sub | Mul | TrueDiv | FloorDiv | Mod | Pow | Shl | Shr | BitAnd | BitOr
        | BitXor => arithmetic::binary(vm, frame, inst),
        Neg | Pos | Invert | Not => arithmetic::unary(vm, frame, inst),
        Eq | Ne | Lt | Le | Gt | Ge => arithmetic::compare(vm, frame, inst),
        In | NotIn => arithmetic::membership(vm, frame, inst),
        Is | IsNot => arithmetic::identity(vm, frame, inst),

        // Control flow
        Jump => {
            vm.jump(frame, inst.offset());
            Ok(Flow::Continue)
        }
        JumpIfTrue => load_store::jump_if(vm, frame, inst, true),
        JumpIfFalse => load_store::jump_if(vm, frame, inst, false),
        Return => Ok(Flow::Return),

        // Calls
        Call => calls::call(vm, frame, inst),
        KwNames => calls::kw_names(vm, frame, inst),
        CallEx => calls::call_ex(vm, frame, inst),
        LoadMethod => calls::load_method(vm, frame, inst),
        CallMethod => calls::call_method(vm, frame, inst),
        MakeFunction => calls::make_function(vm, frame, inst),

        // Builders
        BuildList | BuildTuple | BuildSet | BuildDict | BuildString => {
            containers::build(vm, frame, inst)
        }
        BuildSlice => containers::build_slice(vm, frame, inst),
        ListAppend => containers::list_append(vm, frame, inst),
        ListExtend => containers::list_extend(vm, frame, inst),
        SetAdd => containers::set_add(vm, frame, inst),
        DictAdd => containers::dict_add(vm, frame, inst),
        DictUpdate => containers::dict_update(vm, frame, inst),
        UnpackSequence => containers::unpack_sequence(vm, frame, inst),

        // Iteration
        GetIter => iteration::get_iter(vm, frame, inst),
        ForIter => iteration::for_iter(vm, frame, inst),
        Yield => Ok(Flow::Yield),
        YieldFrom => iteration::yield_from(vm, frame, inst),

        // Exceptions
        Raise => exception::raise_value(vm, frame, inst),
        Reraise => exception::reraise(vm, frame),
        JumpIfNotExcMatch => exception::jump_if_not_match(vm, frame, inst),
        LoadException => exception::load_exception(vm, frame, inst),
        PopException => exception::pop_exception(vm, frame),

        // Imports
        Import => objects::import(vm, frame, inst),
        ImportFrom => objects::import_from(vm, frame, inst),
        ImportStar => objects::import_star(vm, frame, inst),

        // Attributes and subscripts
        LoadAttr => objects::load_attr(vm, frame, inst),
        StoreAttr => objects::store_attr(vm, frame, inst),
        DeleteAttr => objects::delete_attr(vm, frame, inst),
        GetItem => objects::get_item(vm, frame, inst),
        SetItem => objects::set_item(vm, frame, inst),
        DelItem => objects::del_item(vm, frame, inst),
    }
}
