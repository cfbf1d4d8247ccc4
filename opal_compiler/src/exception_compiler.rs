//! Exception statement compilation: try/except/finally, with, raise.
//!
//! There are no setup/teardown opcodes on the happy path. Each `try`
//! records a row in the code object's exception table; the unwinder
//! consults the table only when an exception is actually raised. Handler
//! entry pushes the exception onto the frame's stash stack, so nested
//! handlers and bare re-raises observe the right current exception.
//!
//! `finally` bodies are duplicated on every exit path (normal fallthrough,
//! exceptional re-raise, and `return`/`break`/`continue`, which splice the
//! pending finally bodies in before jumping out).

use crate::bytecode::{Instruction, Opcode, Register};
use crate::compiler::Compiler;
use crate::error::CompileResult;
use opal_ast::{ExceptHandler, Expr, Stmt, WithItem};

impl<'a> Compiler<'a> {
    pub(crate) fn compile_raise(
        &mut self,
        exc: &'a Option<Expr>,
        cause: &'a Option<Expr>,
    ) -> CompileResult<()> {
        match exc {
            Some(e) => {
                let reg = self.compile_expr(e)?;
                // Exception chaining is not modeled; the cause is still
                // evaluated for its effects.
                if let Some(c) = cause {
                    let cause_reg = self.compile_expr(c)?;
                    self.builder().free_register(cause_reg);
                }
                self.builder().emit(Instruction::op_d(Opcode::Raise, reg));
                self.builder().free_register(reg);
            }
            None => {
                self.builder().emit(Instruction::op(Opcode::Reraise));
            }
        }
        Ok(())
    }

    pub(crate) fn compile_try(
        &mut self,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
        finalbody: &'a [Stmt],
    ) -> CompileResult<()> {
        if finalbody.is_empty() {
            return self.compile_try_except(body, handlers, orelse);
        }

        let fin_depth = self.unit().handler_depth;
        let outer_start = self.builder().current_pc();

        // While compiling the protected region, early exits must run the
        // finally body on their way out.
        self.unit().finally_stack.push(finalbody);
        if handlers.is_empty() {
            self.compile_body(body)?;
        } else {
            self.compile_try_except(body, handlers, orelse)?;
        }
        self.unit().finally_stack.pop();

        let outer_end = self.builder().current_pc();
        let done = self.builder().create_label();

        // Normal completion.
        self.compile_body(finalbody)?;
        self.builder().emit_jump(done);

        // Exceptional completion: run the finally body, then re-raise.
        let fin_handler = self.builder().current_pc();
        self.unit().handler_depth += 1;
        self.compile_body(finalbody)?;
        self.builder().emit(Instruction::op(Opcode::Reraise));
        self.unit().handler_depth -= 1;

        self.builder().bind_label(done);
        self.builder()
            .add_exception_entry(outer_start, outer_end, fin_handler, fin_depth);
        Ok(())
    }

    fn compile_try_except(
        &mut self,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
    ) -> CompileResult<()> {
        let depth = self.unit().handler_depth;
        let else_label = self.builder().create_label();
        let end_label = self.builder().create_label();

        let try_start = self.builder().current_pc();
        self.compile_body(body)?;
        let try_end = self.builder().current_pc();
        self.builder().emit_jump(else_label);

        // The unwinder arrives here with the exception stashed.
        let handler_pc = self.builder().current_pc();
        self.unit().handler_depth += 1;
        for handler in handlers {
            self.builder().set_line(handler.line);
            let next_handler = self.builder().create_label();

            if let Some(typ) = &handler.typ {
                let expected = self.compile_expr(typ)?;
                self.builder()
                    .emit_jump_if_not_exc_match(expected, next_handler);
                self.builder().free_register(expected);
            }

            if let Some(name) = &handler.name {
                let exc = self.builder().alloc_register();
                self.builder()
                    .emit(Instruction::op_d(Opcode::LoadException, exc));
                self.store_name_from(name, exc);
                self.builder().free_register(exc);
            }

            self.compile_body(&handler.body)?;
            self.builder().emit(Instruction::op(Opcode::PopException));
            self.builder().emit_jump(end_label);
            self.builder().bind_label(next_handler);
        }
        // No handler matched: propagate to the next enclosing try.
        self.builder().emit(Instruction::op(Opcode::Reraise));
        self.unit().handler_depth -= 1;

        self.builder().bind_label(else_label);
        self.compile_body(orelse)?;
        self.builder().bind_label(end_label);

        self.builder()
            .add_exception_entry(try_start, try_end, handler_pc, depth);
        Ok(())
    }

    pub(crate) fn compile_with(
        &mut self,
        items: &'a [WithItem],
        body: &'a [Stmt],
    ) -> CompileResult<()> {
        let (first, rest) = items.split_first().expect("with statement without items");
        self.compile_with_item(first, rest, body)
    }

    fn compile_with_item(
        &mut self,
        item: &'a WithItem,
        rest: &'a [WithItem],
        body: &'a [Stmt],
    ) -> CompileResult<()> {
        let depth = self.unit().handler_depth;

        let mgr = self.compile_expr(&item.context)?;

        // Bind __exit__ up front so a failing body can still release the
        // manager. The run holds [callable, receiver, arg0, arg1, arg2].
        let exit_run = self.builder().alloc_register_run(5);
        self.builder().emit_move(exit_run, mgr);
        let exit_name = self.builder().add_name("__exit__");
        self.builder()
            .emit(Instruction::op_di(Opcode::LoadMethod, exit_run, exit_name));

        let enter_result = self.builder().alloc_register();
        let enter_run = self.builder().alloc_register_run(2);
        self.builder().emit_move(enter_run, mgr);
        let enter_name = self.builder().add_name("__enter__");
        self.builder()
            .emit(Instruction::op_di(Opcode::LoadMethod, enter_run, enter_name));
        self.builder()
            .emit(Instruction::op_dss(Opcode::CallMethod, enter_result, enter_run, 0));
        self.builder().free_register_run(enter_run);
        self.builder().free_register(mgr);

        if let Some(var) = &item.optional_vars {
            self.compile_store(var, enter_result)?;
        }
        self.builder().free_register(enter_result);

        let try_start = self.builder().current_pc();
        if rest.is_empty() {
            self.compile_body(body)?;
        } else {
            self.compile_with_item(&rest[0], &rest[1..], body)?;
        }
        let try_end = self.builder().current_pc();

        let end_label = self.builder().create_label();

        // Normal exit: __exit__(None, None, None), result ignored.
        for i in 2..5 {
            self.builder()
                .emit(Instruction::op_d(Opcode::LoadNone, Register(exit_run.0 + i)));
        }
        let ignored = self.builder().alloc_register();
        self.builder()
            .emit(Instruction::op_dss(Opcode::CallMethod, ignored, exit_run, 3));
        self.builder().free_register(ignored);
        self.builder().emit_jump(end_label);

        // Exceptional exit: __exit__(type(exc), exc, None); a truthy
        // result swallows the exception.
        let handler_pc = self.builder().current_pc();
        self.unit().handler_depth += 1;

        let exc = self.builder().alloc_register();
        self.builder()
            .emit(Instruction::op_d(Opcode::LoadException, exc));
        let exc_type = self.builder().alloc_register();
        let type_run = self.builder().alloc_register_run(2);
        let type_name = self.builder().add_name("type");
        self.builder()
            .emit(Instruction::op_di(Opcode::LoadGlobal, type_run, type_name));
        self.builder().emit_move(Register(type_run.0 + 1), exc);
        self.builder()
            .emit(Instruction::op_dss(Opcode::Call, exc_type, type_run, 1));
        self.builder().free_register_run(type_run);

        self.builder().emit_move(Register(exit_run.0 + 2), exc_type);
        self.builder().emit_move(Register(exit_run.0 + 3), exc);
        self.builder()
            .emit(Instruction::op_d(Opcode::LoadNone, Register(exit_run.0 + 4)));
        self.builder().free_register(exc_type);
        self.builder().free_register(exc);

        let swallow = self.builder().alloc_register();
        self.builder()
            .emit(Instruction::op_dss(Opcode::CallMethod, swallow, exit_run, 3));
        let reraise_label = self.builder().create_label();
        self.builder().emit_jump_if_false(swallow, reraise_label);
        self.builder().free_register(swallow);
        self.builder().emit(Instruction::op(Opcode::PopException));
        self.builder().emit_jump(end_label);
        self.builder().bind_label(reraise_label);
        self.builder().emit(Instruction::op(Opcode::Reraise));
        self.unit().handler_depth -= 1;

        self.builder().bind_label(end_label);
        self.builder().free_register_run(exit_run);
        self.builder()
            .add_exception_entry(try_start, try_end, handler_pc, depth);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::Opcode;
    use crate::compile_module;
    use opal_ast::{ExceptHandler, Expr, ExprKind, Module, Stmt, StmtKind};

    fn try_stmt(
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        finalbody: Vec<Stmt>,
    ) -> Stmt {
        Stmt::new(
            StmtKind::Try {
                body,
                handlers,
                orelse: Vec::new(),
                finalbody,
            },
            0,
        )
    }

    fn raise(name: &str) -> Stmt {
        Stmt::new(
            StmtKind::Raise {
                exc: Some(Expr::call(Expr::name(name), vec![Expr::str("boom")])),
                cause: None,
            },
            0,
        )
    }

    #[test]
    fn test_try_except_builds_table_row() {
        let code = compile_module(
            &Module::new(vec![try_stmt(
                vec![raise("ValueError")],
                vec![ExceptHandler {
                    typ: Some(Expr::name("ValueError")),
                    name: Some("e".to_string()),
                    body: vec![Stmt::new(StmtKind::Pass, 0)],
                    line: 0,
                }],
                Vec::new(),
            )]),
            "<test>",
        )
        .unwrap();

        assert_eq!(code.exception_table.len(), 1);
        let entry = &code.exception_table[0];
        assert_eq!(entry.depth, 0);
        assert!(entry.start_pc < entry.end_pc);
        assert!(entry.handler_pc >= entry.end_pc);

        let ops: Vec<Opcode> = code.instructions.iter().map(|i| i.opcode()).collect();
        assert!(ops.contains(&Opcode::JumpIfNotExcMatch));
        assert!(ops.contains(&Opcode::LoadException));
        assert!(ops.contains(&Opcode::PopException));
        assert!(ops.contains(&Opcode::Reraise));
    }

    #[test]
    fn test_nested_try_records_deeper_row() {
        let inner = try_stmt(
            vec![raise("ValueError")],
            vec![ExceptHandler {
                typ: Some(Expr::name("TypeError")),
                name: None,
                body: vec![Stmt::new(StmtKind::Pass, 0)],
                line: 0,
            }],
            Vec::new(),
        );
        let outer = try_stmt(
            vec![inner],
            vec![ExceptHandler {
                typ: Some(Expr::name("ValueError")),
                name: None,
                body: vec![Stmt::new(StmtKind::Pass, 0)],
                line: 0,
            }],
            Vec::new(),
        );
        let code = compile_module(&Module::new(vec![outer]), "<test>").unwrap();
        assert_eq!(code.exception_table.len(), 2);

        // The inner row starts later; that is what the unwinder keys on.
        let starts: Vec<u32> = code.exception_table.iter().map(|e| e.start_pc).collect();
        assert!(starts[0] != starts[1]);
    }

    #[test]
    fn test_finally_is_duplicated() {
        let code = compile_module(
            &Module::new(vec![try_stmt(
                vec![Stmt::assign("x", Expr::int(1))],
                Vec::new(),
                vec![Stmt::assign("done", Expr::new(ExprKind::Bool(true), 0))],
            )]),
            "<test>",
        )
        .unwrap();

        // One store for x, two for done (normal and exceptional copies).
        let stores = code
            .instructions
            .iter()
            .filter(|i| i.opcode() == Opcode::StoreGlobal)
            .count();
        assert_eq!(stores, 3);
        assert_eq!(code.exception_table.len(), 1);
    }
}
