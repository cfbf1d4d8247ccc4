//! Opal compiler: AST to register-based bytecode.
//!
//! The pipeline is constant folding, scope analysis, then code
//! generation:
//!
//! ```text
//! Module (AST)
//!   └─ const_fold      literal arithmetic collapsed
//!   └─ ScopeAnalyzer   names classified: local / cell / free / global
//!   └─ Compiler        instructions, labels relocated, pools built
//!        └─ CodeObject per function, nested in constant pools
//! ```
//!
//! [`serialize`] and [`deserialize`] convert compiled programs to and
//! from a stable byte stream.

pub mod bytecode;
pub mod const_fold;
pub mod scope;
pub mod serialize;

mod compiler;
mod error;
mod exception_compiler;

pub use bytecode::{
    disassemble, CodeFlags, CodeObject, Const, ExceptionEntry, FunctionBuilder, Instruction,
    Label, Opcode, Register, CELL_NOT_AN_ARG, FIRST_LOCAL_REGISTER,
};
pub use compiler::compile_module;
pub use error::{CompileError, CompileResult};
pub use serialize::{deserialize, serialize, DecodeError, Program};
