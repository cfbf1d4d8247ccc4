//! Register-based bytecode: instruction format, code objects and the
//! emission builder.

mod builder;
mod code_object;
mod instruction;

pub use builder::{FunctionBuilder, Label};
pub use code_object::{
    disassemble, CodeFlags, CodeObject, Const, ExceptionEntry, LineTableEntry, CELL_NOT_AN_ARG,
    FIRST_LOCAL_REGISTER,
};
pub use instruction::{ConstIndex, Instruction, InstructionFormat, Opcode, Register};
