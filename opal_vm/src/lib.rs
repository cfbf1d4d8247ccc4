//! Opal virtual machine.
//!
//! Executes register bytecode produced by `opal_compiler` against the
//! `opal_runtime` object model:
//!
//! - **Frames as heap objects**: every invocation's registers, cells and
//!   exception stash live on the GC heap, so generators capture and
//!   resume frames by reference and the collector sees live values
//!   through ordinary tracing.
//! - **Result-driven execution**: every instruction evaluates to
//!   `Result<_, Raised>`; the error side carries the exception object,
//!   and the unwinder walks the per-function exception table and then
//!   the frame chain.
//! - **Cooperative single-threaded scheduling**: nested calls run the
//!   loop recursively; `yield` suspends a frame and `__next__` resumes
//!   it.
//!
//! # Example
//!
//! ```ignore
//! use opal_ast::{Expr, Module, Stmt};
//! use opal_vm::VirtualMachine;
//!
//! let module = Module::new(vec![Stmt::assign("x", Expr::int(41))]);
//! let mut vm = VirtualMachine::new();
//! vm.run_module(&module, "demo.opal").unwrap();
//! assert_eq!(vm.global_value("x").unwrap().as_i64(), Some(41));
//! ```

mod builtins;
mod calls;
mod error;
mod machine;
mod ops;
mod registry;

pub use error::OpalError;
pub use machine::{VirtualMachine, VmStatus};
