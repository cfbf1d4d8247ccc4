//! AST to register-bytecode compiler.
//!
//! Compilation runs in two phases, mirroring the scope analyzer:
//!
//! 1. **Scope analysis** classifies every name and assigns slots.
//! 2. **Code generation** walks the AST again, emitting instructions into
//!    a [`FunctionBuilder`] per function. Nested functions compile to
//!    nested code objects stored in the enclosing constant pool.
//!
//! The generator and the analyzer visit nested scopes in identical source
//! order; each compilation unit keeps a cursor into its scope's children.

use crate::bytecode::{CodeFlags, CodeObject, Instruction, Label, Opcode, Register};
use crate::const_fold;
use crate::error::{CompileError, CompileResult};
use crate::scope::{Scope, ScopeAnalyzer, ScopeId, ScopeKind, ScopeTree, VarAccess};
use crate::FunctionBuilder;
use num_bigint::BigInt;
use opal_ast::{
    Arguments, BinOp, BoolOp, CmpOp, Comprehension, Expr, ExprKind, Keyword, Module, Stmt,
    StmtKind, UnaryOp,
};
use opal_core::{Int, Value};
use smallvec::SmallVec;
use std::sync::Arc;

/// Compile a module to its code object.
pub fn compile_module(module: &Module, filename: &str) -> CompileResult<Arc<CodeObject>> {
    let folded = const_fold::fold_module(module.clone());
    let tree = ScopeAnalyzer::analyze(&folded, "<module>")?;
    let mut compiler = Compiler::new(&tree, filename);

    compiler.push_unit(ScopeTree::root(), "<module>", CodeFlags::MODULE);
    for stmt in &folded.body {
        compiler.compile_stmt(stmt)?;
    }
    compiler.builder().emit_return_none();
    Ok(Arc::new(compiler.pop_unit()))
}

/// Break/continue context for one enclosing loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopContext {
    pub break_label: Label,
    pub continue_label: Label,
    /// Depth of the finally stack at loop entry, so break/continue run
    /// the finally bodies they jump out of.
    pub finally_depth: usize,
}

/// Per-function compilation state.
pub(crate) struct Unit<'a> {
    pub builder: FunctionBuilder,
    pub scope: ScopeId,
    /// Cursor into the scope's children; advanced once per nested scope.
    next_child: usize,
    pub loops: SmallVec<[LoopContext; 4]>,
    /// Number of handler bodies currently being compiled; recorded into
    /// exception-table rows as the expected exception-stack depth.
    pub handler_depth: u16,
    /// Enclosing `finally` bodies, innermost last.
    pub finally_stack: Vec<&'a [Stmt]>,
}

pub(crate) struct Compiler<'a> {
    tree: &'a ScopeTree,
    filename: Arc<str>,
    units: Vec<Unit<'a>>,
}

impl<'a> Compiler<'a> {
    fn new(tree: &'a ScopeTree, filename: &str) -> Self {
        Compiler {
            tree,
            filename: filename.into(),
            units: Vec::new(),
        }
    }

    // =========================================================================
    // Unit management
    // =========================================================================

    fn push_unit(&mut self, scope_id: ScopeId, name: &str, extra_flags: CodeFlags) {
        let scope = self.tree.get(scope_id);
        let mut builder = FunctionBuilder::new(name, self.filename.clone());
        builder.set_qualname(scope.qualname.clone());
        builder.set_arg_counts(scope.arg_count, scope.posonly_count, scope.kwonly_count);

        let mut flags = extra_flags;
        if scope.has_yield {
            flags |= CodeFlags::GENERATOR;
        }
        if scope.has_varargs {
            flags |= CodeFlags::VARARGS;
        }
        if scope.has_varkw {
            flags |= CodeFlags::VARKEYWORDS;
        }
        let enclosed_in_function = self
            .units
            .last()
            .is_some_and(|u| self.tree.get(u.scope).kind != ScopeKind::Module);
        if enclosed_in_function {
            flags |= CodeFlags::NESTED;
        }
        builder.add_flags(flags);

        builder.set_variables(
            scope.varnames.clone(),
            scope.cellvars.clone(),
            scope.freevars.clone(),
            scope.cell2arg.clone(),
        );
        // Parameters and named locals occupy the leading registers after
        // the reserved return register.
        builder.reserve_locals(scope.varnames.len() as u16);

        self.units.push(Unit {
            builder,
            scope: scope_id,
            next_child: 0,
            loops: SmallVec::new(),
            handler_depth: 0,
            finally_stack: Vec::new(),
        });
    }

    fn pop_unit(&mut self) -> CodeObject {
        let unit = self.units.pop().expect("unit stack underflow");
        unit.builder.finish()
    }

    pub(crate) fn unit(&mut self) -> &mut Unit<'a> {
        self.units.last_mut().expect("no active compilation unit")
    }

    pub(crate) fn builder(&mut self) -> &mut FunctionBuilder {
        &mut self.unit().builder
    }

    pub(crate) fn scope(&self) -> &Scope {
        let unit = self.units.last().expect("no active compilation unit");
        self.tree.get(unit.scope)
    }

    /// Take the next nested scope, in the analyzer's visit order.
    fn take_next_child(&mut self) -> ScopeId {
        let unit = self.units.last_mut().expect("no active compilation unit");
        let scope = self.tree.get(unit.scope);
        let child = scope.children[unit.next_child];
        unit.next_child += 1;
        child
    }

    // =========================================================================
    // Variable access
    // =========================================================================

    pub(crate) fn load_name_into(&mut self, dst: Register, name: &str) {
        match self.scope().access(name) {
            VarAccess::Register(slot) => {
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadLocal, dst, slot));
            }
            VarAccess::Cell(slot) => {
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadDeref, dst, slot));
            }
            VarAccess::Global => {
                let idx = self.builder().add_name(name);
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadGlobal, dst, idx));
            }
            VarAccess::Named => {
                let idx = self.builder().add_name(name);
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadName, dst, idx));
            }
        }
    }

    pub(crate) fn store_name_from(&mut self, name: &str, src: Register) {
        match self.scope().access(name) {
            VarAccess::Register(slot) => {
                self.builder()
                    .emit(Instruction::op_di(Opcode::StoreLocal, src, slot));
            }
            VarAccess::Cell(slot) => {
                self.builder()
                    .emit(Instruction::op_di(Opcode::StoreDeref, src, slot));
            }
            VarAccess::Global => {
                let idx = self.builder().add_name(name);
                self.builder()
                    .emit(Instruction::op_di(Opcode::StoreGlobal, src, idx));
            }
            VarAccess::Named => {
                let idx = self.builder().add_name(name);
                self.builder()
                    .emit(Instruction::op_di(Opcode::StoreName, src, idx));
            }
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub(crate) fn compile_body(&mut self, body: &'a [Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    pub(crate) fn compile_stmt(&mut self, stmt: &'a Stmt) -> CompileResult<()> {
        self.builder().set_line(stmt.line);

        match &stmt.kind {
            StmtKind::Expr(value) => {
                let reg = self.compile_expr(value)?;
                self.builder().free_register(reg);
            }

            StmtKind::Assign { targets, value } => {
                let value_reg = self.compile_expr(value)?;
                for target in targets {
                    self.compile_store(target, value_reg)?;
                }
                self.builder().free_register(value_reg);
            }

            StmtKind::AugAssign { target, op, value } => {
                let left = self.compile_expr(target)?;
                let right = self.compile_expr(value)?;
                let dst = self.builder().alloc_register();
                self.emit_binop(*op, dst, left, right);
                self.compile_store(target, dst)?;
                self.builder().free_register(left);
                self.builder().free_register(right);
                self.builder().free_register(dst);
            }

            StmtKind::Return(value) => {
                // Run the finally bodies this return jumps out of.
                let pending: Vec<&'a [Stmt]> = self.unit().finally_stack.clone();
                for fin in pending.iter().rev() {
                    self.compile_body(fin)?;
                }
                match value {
                    Some(v) => {
                        let reg = self.compile_expr(v)?;
                        self.builder().emit_return(reg);
                        self.builder().free_register(reg);
                    }
                    None => self.builder().emit_return_none(),
                }
            }

            StmtKind::Pass => {}

            StmtKind::Break => {
                let Some(ctx) = self.unit().loops.last().copied() else {
                    return Err(CompileError::new("'break' outside loop", stmt.line));
                };
                self.run_finallys_down_to(ctx.finally_depth)?;
                self.builder().emit_jump(ctx.break_label);
            }

            StmtKind::Continue => {
                let Some(ctx) = self.unit().loops.last().copied() else {
                    return Err(CompileError::new("'continue' outside loop", stmt.line));
                };
                self.run_finallys_down_to(ctx.finally_depth)?;
                self.builder().emit_jump(ctx.continue_label);
            }

            StmtKind::If { test, body, orelse } => {
                let cond = self.compile_expr(test)?;
                let else_label = self.builder().create_label();
                let end_label = self.builder().create_label();

                self.builder().emit_jump_if_false(cond, else_label);
                self.builder().free_register(cond);

                self.compile_body(body)?;
                if !orelse.is_empty() {
                    self.builder().emit_jump(end_label);
                }
                self.builder().bind_label(else_label);
                self.compile_body(orelse)?;
                if !orelse.is_empty() {
                    self.builder().bind_label(end_label);
                }
            }

            StmtKind::While { test, body, orelse } => {
                let loop_start = self.builder().create_label();
                let loop_else = self.builder().create_label();
                let loop_end = self.builder().create_label();

                let finally_depth = self.unit().finally_stack.len();
                self.unit().loops.push(LoopContext {
                    break_label: loop_end,
                    continue_label: loop_start,
                    finally_depth,
                });

                self.builder().bind_label(loop_start);
                let cond = self.compile_expr(test)?;
                self.builder().emit_jump_if_false(cond, loop_else);
                self.builder().free_register(cond);

                self.compile_body(body)?;
                self.builder().emit_jump(loop_start);

                self.builder().bind_label(loop_else);
                // The else clause runs only when the loop ends without break.
                self.compile_body(orelse)?;
                self.builder().bind_label(loop_end);

                self.unit().loops.pop();
            }

            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.compile_expr(iter)?;
                // The iterator and its next value live in an adjacent pair.
                let pair = self.builder().alloc_register_run(2);
                self.builder()
                    .emit(Instruction::op_ds(Opcode::GetIter, pair, iterable));
                self.builder().free_register(iterable);

                let loop_start = self.builder().create_label();
                let loop_else = self.builder().create_label();
                let loop_end = self.builder().create_label();

                let finally_depth = self.unit().finally_stack.len();
                self.unit().loops.push(LoopContext {
                    break_label: loop_end,
                    continue_label: loop_start,
                    finally_depth,
                });

                self.builder().bind_label(loop_start);
                self.builder().emit_for_iter(pair, loop_else);
                let item = Register(pair.0 + 1);
                self.compile_store(target, item)?;

                self.compile_body(body)?;
                self.builder().emit_jump(loop_start);

                self.builder().bind_label(loop_else);
                self.compile_body(orelse)?;
                self.builder().bind_label(loop_end);

                self.unit().loops.pop();
                self.builder().free_register_run(pair);
            }

            StmtKind::FunctionDef {
                name,
                args,
                body,
                decorators,
            } => {
                let mut func = self.compile_closure(name, args, FunctionBody::Stmts(body))?;
                func = self.apply_decorators(func, decorators)?;
                self.store_name_from(name, func);
                self.builder().free_register(func);
            }

            StmtKind::ClassDef {
                name,
                bases,
                body,
                decorators,
            } => {
                let mut class = self.compile_class(name, bases, body)?;
                class = self.apply_decorators(class, decorators)?;
                self.store_name_from(name, class);
                self.builder().free_register(class);
            }

            StmtKind::Raise { exc, cause } => self.compile_raise(exc, cause)?,

            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => self.compile_try(body, handlers, orelse, finalbody)?,

            StmtKind::With { items, body } => self.compile_with(items, body)?,

            StmtKind::Assert { test, msg } => {
                let cond = self.compile_expr(test)?;
                let end = self.builder().create_label();
                self.builder().emit_jump_if_true(cond, end);
                self.builder().free_register(cond);

                let exc = self.builder().alloc_register();
                let base = self.builder().alloc_register_run(2);
                let idx = self.builder().add_name("AssertionError");
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadGlobal, base, idx));
                let argc = match msg {
                    Some(m) => {
                        let r = self.compile_expr(m)?;
                        self.builder().emit_move(Register(base.0 + 1), r);
                        self.builder().free_register(r);
                        1
                    }
                    None => 0,
                };
                self.builder()
                    .emit(Instruction::op_dss(Opcode::Call, exc, base, argc));
                self.builder()
                    .emit(Instruction::op_d(Opcode::Raise, exc));
                self.builder().free_register_run(base);
                self.builder().free_register(exc);
                self.builder().bind_label(end);
            }

            StmtKind::Import { names } => {
                for alias in names {
                    let dst = self.builder().alloc_register();
                    let idx = self.builder().add_name(alias.name.as_str());
                    self.builder()
                        .emit(Instruction::op_di(Opcode::Import, dst, idx));
                    let bound = alias
                        .asname
                        .as_deref()
                        .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name));
                    self.store_name_from(bound, dst);
                    self.builder().free_register(dst);
                }
            }

            StmtKind::ImportFrom {
                module,
                names,
                star,
            } => {
                let module_reg = self.builder().alloc_register();
                let idx = self.builder().add_name(module.as_str());
                self.builder()
                    .emit(Instruction::op_di(Opcode::Import, module_reg, idx));

                if *star {
                    self.builder()
                        .emit(Instruction::op_d(Opcode::ImportStar, module_reg));
                } else {
                    for alias in names {
                        let value = self.builder().alloc_register();
                        self.builder().emit_move(value, module_reg);
                        let name_idx = self.builder().add_name(alias.name.as_str());
                        self.builder()
                            .emit(Instruction::op_di(Opcode::ImportFrom, value, name_idx));
                        let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                        self.store_name_from(bound, value);
                        self.builder().free_register(value);
                    }
                }
                self.builder().free_register(module_reg);
            }

            // Declarations were consumed by scope analysis.
            StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}

            StmtKind::Delete(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn run_finallys_down_to(&mut self, depth: usize) -> CompileResult<()> {
        let pending: Vec<&'a [Stmt]> = self.unit().finally_stack[depth..].to_vec();
        for fin in pending.iter().rev() {
            self.compile_body(fin)?;
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &'a Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => match self.scope().access(name) {
                VarAccess::Register(slot) => {
                    self.builder()
                        .emit(Instruction::op_i(Opcode::DeleteLocal, slot));
                }
                VarAccess::Global => {
                    let idx = self.builder().add_name(name.as_str());
                    self.builder()
                        .emit(Instruction::op_i(Opcode::DeleteGlobal, idx));
                }
                VarAccess::Named => {
                    let idx = self.builder().add_name(name.as_str());
                    self.builder()
                        .emit(Instruction::op_i(Opcode::DeleteName, idx));
                }
                VarAccess::Cell(_) => {
                    return Err(CompileError::new(
                        "cannot delete variable captured by a closure",
                        target.line,
                    ));
                }
            },
            ExprKind::Attribute { value, attr } => {
                let obj = self.compile_expr(value)?;
                let idx = self.builder().add_name(attr.as_str());
                self.builder()
                    .emit(Instruction::op_di(Opcode::DeleteAttr, obj, idx));
                self.builder().free_register(obj);
            }
            ExprKind::Subscript { value, index } => {
                let obj = self.compile_expr(value)?;
                let key = self.compile_expr(index)?;
                self.builder()
                    .emit(Instruction::op_ds(Opcode::DelItem, obj, key));
                self.builder().free_register(obj);
                self.builder().free_register(key);
            }
            _ => return Err(CompileError::new("cannot delete this target", target.line)),
        }
        Ok(())
    }

    /// Store `src` into an assignment target.
    pub(crate) fn compile_store(&mut self, target: &'a Expr, src: Register) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.store_name_from(name, src),

            ExprKind::Attribute { value, attr } => {
                // StoreAttr reads the object from `a` and the value from a+1.
                let pair = self.builder().alloc_register_run(2);
                let obj = self.compile_expr(value)?;
                self.builder().emit_move(pair, obj);
                self.builder().free_register(obj);
                self.builder().emit_move(Register(pair.0 + 1), src);
                let idx = self.builder().add_name(attr.as_str());
                self.builder()
                    .emit(Instruction::op_di(Opcode::StoreAttr, pair, idx));
                self.builder().free_register_run(pair);
            }

            ExprKind::Subscript { value, index } => {
                let obj = self.compile_expr(value)?;
                let key = self.compile_expr(index)?;
                self.builder()
                    .emit(Instruction::op_dss(Opcode::SetItem, obj, key, src.0));
                self.builder().free_register(obj);
                self.builder().free_register(key);
            }

            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                if elts.iter().any(|e| matches!(e.kind, ExprKind::Starred(_))) {
                    return Err(CompileError::new(
                        "starred assignment targets are not supported",
                        target.line,
                    ));
                }
                let count = elts.len();
                if count > u8::MAX as usize {
                    return Err(CompileError::new("too many assignment targets", target.line));
                }
                let base = self.builder().alloc_register_run(count as u16);
                self.builder().emit(Instruction::op_dss(
                    Opcode::UnpackSequence,
                    src,
                    base,
                    count as u8,
                ));
                for (i, elt) in elts.iter().enumerate() {
                    self.compile_store(elt, Register(base.0 + i as u8))?;
                }
                self.builder().free_register_run(base);
            }

            _ => {
                return Err(CompileError::new("invalid assignment target", target.line));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Compile an expression into a fresh register owned by the caller.
    pub(crate) fn compile_expr(&mut self, expr: &'a Expr) -> CompileResult<Register> {
        self.builder().set_line(expr.line);

        match &expr.kind {
            ExprKind::Name(name) => {
                let dst = self.builder().alloc_register();
                self.load_name_into(dst, name);
                Ok(dst)
            }

            ExprKind::Int(v) => self.load_value(Value::int(*v)),
            ExprKind::Float(v) => self.load_value(Value::Float(*v)),
            ExprKind::Bool(v) => self.load_value(Value::Bool(*v)),
            ExprKind::NoneLiteral => self.load_value(Value::None),
            ExprKind::Ellipsis => self.load_value(Value::Ellipsis),
            ExprKind::Str(s) => self.load_value(Value::Str(s.as_str().into())),
            ExprKind::Bytes(b) => self.load_value(Value::Bytes(b.as_slice().into())),
            ExprKind::BigInt(digits) => {
                let big: BigInt = digits.parse().map_err(|_| {
                    CompileError::new("invalid integer literal", expr.line)
                })?;
                self.load_value(Value::Int(Int::from_big(big)))
            }

            ExprKind::Tuple(elts) => self.compile_builder_op(Opcode::BuildTuple, elts, expr.line),
            ExprKind::List(elts) => self.compile_builder_op(Opcode::BuildList, elts, expr.line),
            ExprKind::Set(elts) => self.compile_builder_op(Opcode::BuildSet, elts, expr.line),

            ExprKind::Dict { keys, values } => {
                let count = keys.len();
                if count > 127 {
                    return Err(CompileError::new("dict literal too large", expr.line));
                }
                let dst = self.builder().alloc_register();
                let base = self.builder().alloc_register_run((count * 2) as u16);
                for (i, (k, v)) in keys.iter().zip(values).enumerate() {
                    self.compile_expr_into(Register(base.0 + (2 * i) as u8), k)?;
                    self.compile_expr_into(Register(base.0 + (2 * i + 1) as u8), v)?;
                }
                self.builder().emit(Instruction::op_dss(
                    Opcode::BuildDict,
                    dst,
                    base,
                    count as u8,
                ));
                self.builder().free_register_run(base);
                Ok(dst)
            }

            ExprKind::BinOp { left, op, right } => {
                let l = self.compile_expr(left)?;
                let r = self.compile_expr(right)?;
                let dst = self.builder().alloc_register();
                self.emit_binop(*op, dst, l, r);
                self.builder().free_register(l);
                self.builder().free_register(r);
                Ok(dst)
            }

            ExprKind::UnaryOp { op, operand } => {
                let src = self.compile_expr(operand)?;
                let dst = self.builder().alloc_register();
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Pos => Opcode::Pos,
                    UnaryOp::Invert => Opcode::Invert,
                    UnaryOp::Not => Opcode::Not,
                };
                self.builder().emit(Instruction::op_ds(opcode, dst, src));
                self.builder().free_register(src);
                Ok(dst)
            }

            ExprKind::BoolOp { op, values } => {
                let dst = self.builder().alloc_register();
                let end = self.builder().create_label();
                for (i, value) in values.iter().enumerate() {
                    self.compile_expr_into(dst, value)?;
                    if i + 1 < values.len() {
                        match op {
                            BoolOp::And => self.builder().emit_jump_if_false(dst, end),
                            BoolOp::Or => self.builder().emit_jump_if_true(dst, end),
                        }
                    }
                }
                self.builder().bind_label(end);
                Ok(dst)
            }

            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(left, ops, comparators),

            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.compile_call(func, args, keywords, expr.line),

            ExprKind::Attribute { value, attr } => {
                let obj = self.compile_expr(value)?;
                let dst = self.builder().alloc_register();
                self.builder().emit_move(dst, obj);
                let idx = self.builder().add_name(attr.as_str());
                self.builder()
                    .emit(Instruction::op_di(Opcode::LoadAttr, dst, idx));
                self.builder().free_register(obj);
                Ok(dst)
            }

            ExprKind::Subscript { value, index } => {
                let obj = self.compile_expr(value)?;
                let key = self.compile_expr(index)?;
                let dst = self.builder().alloc_register();
                self.builder()
                    .emit(Instruction::op_dss(Opcode::GetItem, dst, obj, key.0));
                self.builder().free_register(obj);
                self.builder().free_register(key);
                Ok(dst)
            }

            ExprKind::Slice { lower, upper, step } => {
                let dst = self.builder().alloc_register();
                let base = self.builder().alloc_register_run(3);
                for (i, part) in [lower, upper, step].into_iter().enumerate() {
                    let reg = Register(base.0 + i as u8);
                    match part {
                        Some(e) => self.compile_expr_into(reg, e)?,
                        None => self.builder().emit(Instruction::op_d(Opcode::LoadNone, reg)),
                    }
                }
                self.builder()
                    .emit(Instruction::op_dss(Opcode::BuildSlice, dst, base, 3));
                self.builder().free_register_run(base);
                Ok(dst)
            }

            ExprKind::Lambda { args, body } => {
                self.compile_closure("<lambda>", args, FunctionBody::Expr(body))
            }

            ExprKind::IfExp { test, body, orelse } => {
                let dst = self.builder().alloc_register();
                let else_label = self.builder().create_label();
                let end_label = self.builder().create_label();

                let cond = self.compile_expr(test)?;
                self.builder().emit_jump_if_false(cond, else_label);
                self.builder().free_register(cond);

                self.compile_expr_into(dst, body)?;
                self.builder().emit_jump(end_label);
                self.builder().bind_label(else_label);
                self.compile_expr_into(dst, orelse)?;
                self.builder().bind_label(end_label);
                Ok(dst)
            }

            ExprKind::Yield(value) => {
                match value {
                    Some(v) => {
                        let reg = self.compile_expr(v)?;
                        self.builder().emit_move(Register(0), reg);
                        self.builder().free_register(reg);
                    }
                    None => {
                        self.builder()
                            .emit(Instruction::op_d(Opcode::LoadNone, Register(0)));
                    }
                }
                self.builder().emit(Instruction::op(Opcode::Yield));
                // On resume the sent value is in r0.
                let dst = self.builder().alloc_register();
                self.builder().emit_move(dst, Register(0));
                Ok(dst)
            }

            ExprKind::YieldFrom(value) => {
                let iterable = self.compile_expr(value)?;
                let iter = self.builder().alloc_register();
                self.builder()
                    .emit(Instruction::op_ds(Opcode::GetIter, iter, iterable));
                self.builder().free_register(iterable);
                self.builder()
                    .emit(Instruction::op_d(Opcode::YieldFrom, iter));
                self.builder().free_register(iter);
                let dst = self.builder().alloc_register();
                self.builder().emit_move(dst, Register(0));
                Ok(dst)
            }

            ExprKind::Starred(_) => Err(CompileError::new(
                "starred expression outside call or assignment",
                expr.line,
            )),

            ExprKind::JoinedStr(parts) => {
                self.compile_builder_op(Opcode::BuildString, parts, expr.line)
            }

            ExprKind::ListComp {
                element,
                generators,
            } => self.compile_comprehension(CompKind::List, element, None, generators),

            ExprKind::SetComp {
                element,
                generators,
            } => self.compile_comprehension(CompKind::Set, element, None, generators),

            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.compile_comprehension(CompKind::Dict, key, Some(value), generators),

            ExprKind::GeneratorExp {
                element,
                generators,
            } => self.compile_comprehension(CompKind::Generator, element, None, generators),
        }
    }

    fn load_value(&mut self, value: Value) -> CompileResult<Register> {
        let dst = self.builder().alloc_register();
        self.builder().emit_load_value(dst, value);
        Ok(dst)
    }

    /// Compile an expression, then move the result into `dst`.
    pub(crate) fn compile_expr_into(&mut self, dst: Register, expr: &'a Expr) -> CompileResult<()> {
        let reg = self.compile_expr(expr)?;
        self.builder().emit_move(dst, reg);
        self.builder().free_register(reg);
        Ok(())
    }

    fn compile_builder_op(
        &mut self,
        opcode: Opcode,
        elts: &'a [Expr],
        line: u32,
    ) -> CompileResult<Register> {
        if elts.len() > u8::MAX as usize {
            return Err(CompileError::new("literal too large", line));
        }
        let dst = self.builder().alloc_register();
        let base = self.builder().alloc_register_run(elts.len() as u16);
        for (i, elt) in elts.iter().enumerate() {
            self.compile_expr_into(Register(base.0 + i as u8), elt)?;
        }
        self.builder()
            .emit(Instruction::op_dss(opcode, dst, base, elts.len() as u8));
        self.builder().free_register_run(base);
        Ok(dst)
    }

    pub(crate) fn emit_binop(&mut self, op: BinOp, dst: Register, l: Register, r: Register) {
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::TrueDiv,
            BinOp::FloorDiv => Opcode::FloorDiv,
            BinOp::Mod => Opcode::Mod,
            BinOp::Pow => Opcode::Pow,
            BinOp::LShift => Opcode::Shl,
            BinOp::RShift => Opcode::Shr,
            BinOp::BitAnd => Opcode::BitAnd,
            BinOp::BitOr => Opcode::BitOr,
            BinOp::BitXor => Opcode::BitXor,
        };
        self.builder()
            .emit(Instruction::op_dss(opcode, dst, l, r.0));
    }

    fn compile_compare(
        &mut self,
        left: &'a Expr,
        ops: &[CmpOp],
        comparators: &'a [Expr],
    ) -> CompileResult<Register> {
        let dst = self.builder().alloc_register();
        let end = self.builder().create_label();

        let mut lhs = self.compile_expr(left)?;
        for (i, (op, comparator)) in ops.iter().zip(comparators).enumerate() {
            let rhs = self.compile_expr(comparator)?;
            let opcode = match op {
                CmpOp::Eq => Opcode::Eq,
                CmpOp::NotEq => Opcode::Ne,
                CmpOp::Lt => Opcode::Lt,
                CmpOp::LtE => Opcode::Le,
                CmpOp::Gt => Opcode::Gt,
                CmpOp::GtE => Opcode::Ge,
                CmpOp::Is => Opcode::Is,
                CmpOp::IsNot => Opcode::IsNot,
                CmpOp::In => Opcode::In,
                CmpOp::NotIn => Opcode::NotIn,
            };
            self.builder()
                .emit(Instruction::op_dss(opcode, dst, lhs, rhs.0));
            self.builder().free_register(lhs);
            // Chained comparisons short-circuit on the first false link.
            if i + 1 < ops.len() {
                self.builder().emit_jump_if_false(dst, end);
            }
            lhs = rhs;
        }
        self.builder().free_register(lhs);
        self.builder().bind_label(end);
        Ok(dst)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn compile_call(
        &mut self,
        func: &'a Expr,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        line: u32,
    ) -> CompileResult<Register> {
        let has_star = args.iter().any(|a| matches!(a.kind, ExprKind::Starred(_)));
        let has_kwsplat = keywords.iter().any(|k| k.arg.is_none());
        if has_star || has_kwsplat {
            return self.compile_call_ex(func, args, keywords);
        }

        let total_args = args.len() + keywords.len();
        if total_args > 250 {
            return Err(CompileError::new("too many call arguments", line));
        }

        // Method calls resolve the attribute and receiver in one step.
        if let ExprKind::Attribute { value, attr } = &func.kind {
            let dst = self.builder().alloc_register();
            let base = self.builder().alloc_register_run(2 + total_args as u16);
            self.compile_expr_into(base, value)?;
            let name_idx = self.builder().add_name(attr.as_str());
            self.builder()
                .emit(Instruction::op_di(Opcode::LoadMethod, base, name_idx));
            for (i, arg) in args.iter().enumerate() {
                self.compile_expr_into(Register(base.0 + 2 + i as u8), arg)?;
            }
            self.emit_kwnames_and_args(keywords, base.0 + 2 + args.len() as u8)?;
            self.builder().emit(Instruction::op_dss(
                Opcode::CallMethod,
                dst,
                base,
                total_args as u8,
            ));
            self.builder().free_register_run(base);
            return Ok(dst);
        }

        let dst = self.builder().alloc_register();
        let base = self.builder().alloc_register_run(1 + total_args as u16);
        self.compile_expr_into(base, func)?;
        for (i, arg) in args.iter().enumerate() {
            self.compile_expr_into(Register(base.0 + 1 + i as u8), arg)?;
        }
        self.emit_kwnames_and_args(keywords, base.0 + 1 + args.len() as u8)?;
        self.builder()
            .emit(Instruction::op_dss(Opcode::Call, dst, base, total_args as u8));
        self.builder().free_register_run(base);
        Ok(dst)
    }

    /// Evaluate keyword values into the trailing argument window and
    /// announce their names for the following call.
    fn emit_kwnames_and_args(
        &mut self,
        keywords: &'a [Keyword],
        first_reg: u8,
    ) -> CompileResult<()> {
        if keywords.is_empty() {
            return Ok(());
        }
        let mut names = Vec::with_capacity(keywords.len());
        for (i, kw) in keywords.iter().enumerate() {
            let name = kw.arg.as_ref().expect("splat handled by CallEx path");
            names.push(opal_core::intern(name));
            self.compile_expr_into(Register(first_reg + i as u8), &kw.value)?;
        }
        let idx = self.builder().add_names_const(names);
        self.builder()
            .emit(Instruction::op_i(Opcode::KwNames, idx.0));
        Ok(())
    }

    /// General call with `*args` / `**kwargs`: build an argument list and
    /// keyword dict, then `CallEx`.
    fn compile_call_ex(
        &mut self,
        func: &'a Expr,
        args: &'a [Expr],
        keywords: &'a [Keyword],
    ) -> CompileResult<Register> {
        let dst = self.builder().alloc_register();
        let base = self.builder().alloc_register_run(3);
        self.compile_expr_into(base, func)?;

        let arg_list = Register(base.0 + 1);
        self.builder()
            .emit(Instruction::op_dss(Opcode::BuildList, arg_list, arg_list, 0));
        for arg in args {
            match &arg.kind {
                ExprKind::Starred(inner) => {
                    let items = self.compile_expr(inner)?;
                    self.builder()
                        .emit(Instruction::op_ds(Opcode::ListExtend, arg_list, items));
                    self.builder().free_register(items);
                }
                _ => {
                    let item = self.compile_expr(arg)?;
                    self.builder()
                        .emit(Instruction::op_ds(Opcode::ListAppend, arg_list, item));
                    self.builder().free_register(item);
                }
            }
        }

        let kw_dict = Register(base.0 + 2);
        let has_kwargs = !keywords.is_empty();
        if has_kwargs {
            self.builder()
                .emit(Instruction::op_dss(Opcode::BuildDict, kw_dict, kw_dict, 0));
            for kw in keywords {
                match &kw.arg {
                    Some(name) => {
                        let key = self.load_value(Value::Str(name.as_str().into()))?;
                        let value = self.compile_expr(&kw.value)?;
                        self.builder()
                            .emit(Instruction::op_dss(Opcode::DictAdd, kw_dict, key, value.0));
                        self.builder().free_register(key);
                        self.builder().free_register(value);
                    }
                    None => {
                        let other = self.compile_expr(&kw.value)?;
                        self.builder()
                            .emit(Instruction::op_ds(Opcode::DictUpdate, kw_dict, other));
                        self.builder().free_register(other);
                    }
                }
            }
        }

        self.builder().emit(Instruction::op_dss(
            Opcode::CallEx,
            dst,
            base,
            has_kwargs as u8,
        ));
        self.builder().free_register_run(base);
        Ok(dst)
    }

    fn apply_decorators(
        &mut self,
        mut target: Register,
        decorators: &'a [Expr],
    ) -> CompileResult<Register> {
        for dec in decorators.iter().rev() {
            let dst = self.builder().alloc_register();
            let base = self.builder().alloc_register_run(2);
            self.compile_expr_into(base, dec)?;
            self.builder().emit_move(Register(base.0 + 1), target);
            self.builder()
                .emit(Instruction::op_dss(Opcode::Call, dst, base, 1));
            self.builder().free_register_run(base);
            self.builder().free_register(target);
            target = dst;
        }
        Ok(target)
    }

    // =========================================================================
    // Functions, classes, comprehensions
    // =========================================================================

    fn compile_function_code(
        &mut self,
        scope_id: ScopeId,
        name: &str,
        body: FunctionBody<'a>,
    ) -> CompileResult<Arc<CodeObject>> {
        self.push_unit(scope_id, name, CodeFlags::NONE);
        match body {
            FunctionBody::Stmts(stmts) => {
                self.compile_body(stmts)?;
                self.builder().emit_return_none();
            }
            FunctionBody::Expr(expr) => {
                let reg = self.compile_expr(expr)?;
                self.builder().emit_return(reg);
            }
        }
        Ok(Arc::new(self.pop_unit()))
    }

    /// Compile a nested function and emit the `MakeFunction` that builds
    /// the function object in the enclosing frame.
    fn compile_closure(
        &mut self,
        name: &str,
        args: &'a Arguments,
        body: FunctionBody<'a>,
    ) -> CompileResult<Register> {
        let scope_id = self.take_next_child();
        let code = self.compile_function_code(scope_id, name, body)?;
        self.emit_make_function(scope_id, code, Some(args))
    }

    fn emit_make_function(
        &mut self,
        scope_id: ScopeId,
        code: Arc<CodeObject>,
        args: Option<&'a Arguments>,
    ) -> CompileResult<Register> {
        let out = self.builder().alloc_register();
        let base = self.builder().alloc_register_run(4);
        let defaults_reg = Register(base.0 + 1);
        let kwdefaults_reg = Register(base.0 + 2);
        let closure_reg = Register(base.0 + 3);

        // Positional defaults, evaluated now, in the enclosing frame.
        let defaults: &[Expr] = args.map_or(&[], |a| &a.defaults);
        if defaults.is_empty() {
            self.builder()
                .emit(Instruction::op_d(Opcode::LoadNone, defaults_reg));
        } else {
            let run = self.builder().alloc_register_run(defaults.len() as u16);
            for (i, default) in defaults.iter().enumerate() {
                self.compile_expr_into(Register(run.0 + i as u8), default)?;
            }
            self.builder().emit(Instruction::op_dss(
                Opcode::BuildTuple,
                defaults_reg,
                run,
                defaults.len() as u8,
            ));
            self.builder().free_register_run(run);
        }

        // Keyword-only defaults as a name -> value dict.
        let kw_pairs: Vec<(&str, &'a Expr)> = args
            .map_or(&[][..], |a| &a.kwonlyargs)
            .iter()
            .zip(args.map_or(&[][..], |a| &a.kw_defaults))
            .filter_map(|(arg, d)| d.as_ref().map(|d| (arg.name.as_str(), d)))
            .collect();
        if kw_pairs.is_empty() {
            self.builder()
                .emit(Instruction::op_d(Opcode::LoadNone, kwdefaults_reg));
        } else {
            let run = self.builder().alloc_register_run((kw_pairs.len() * 2) as u16);
            for (i, (kw_name, default)) in kw_pairs.iter().enumerate() {
                let key = Register(run.0 + (2 * i) as u8);
                self.builder()
                    .emit_load_value(key, Value::Str((*kw_name).into()));
                self.compile_expr_into(Register(run.0 + (2 * i + 1) as u8), default)?;
            }
            self.builder().emit(Instruction::op_dss(
                Opcode::BuildDict,
                kwdefaults_reg,
                run,
                kw_pairs.len() as u8,
            ));
            self.builder().free_register_run(run);
        }

        // Closure: gather the cells for the child's free variables from
        // this frame's cell storage.
        let freevars = self.tree.get(scope_id).freevars.clone();
        if freevars.is_empty() {
            self.builder()
                .emit(Instruction::op_d(Opcode::LoadNone, closure_reg));
        } else {
            let run = self.builder().alloc_register_run(freevars.len() as u16);
            for (i, freevar) in freevars.iter().enumerate() {
                let slot = match self.scope().access(freevar) {
                    VarAccess::Cell(slot) => slot,
                    _ => {
                        return Err(CompileError::new(
                            format!("free variable '{freevar}' has no enclosing cell"),
                            0,
                        ));
                    }
                };
                self.builder().emit(Instruction::op_di(
                    Opcode::LoadClosure,
                    Register(run.0 + i as u8),
                    slot,
                ));
            }
            self.builder().emit(Instruction::op_dss(
                Opcode::BuildTuple,
                closure_reg,
                run,
                freevars.len() as u8,
            ));
            self.builder().free_register_run(run);
        }

        let code_idx = self.builder().add_code_const(code);
        self.builder()
            .emit(Instruction::op_di(Opcode::MakeFunction, base, code_idx.0));
        self.builder().emit_move(out, base);
        self.builder().free_register_run(base);
        Ok(out)
    }

    fn compile_class(
        &mut self,
        name: &str,
        bases: &'a [Expr],
        body: &'a [Stmt],
    ) -> CompileResult<Register> {
        let scope_id = self.take_next_child();

        // The class body compiles to a function whose locals dict becomes
        // the class dict.
        self.push_unit(scope_id, name, CodeFlags::CLASS_BODY);
        self.compile_body(body)?;
        self.builder().emit_return_none();
        let code = Arc::new(self.pop_unit());

        let body_func = self.emit_make_function(scope_id, code, None)?;

        let dst = self.builder().alloc_register();
        let argc = 2 + bases.len();
        let base = self.builder().alloc_register_run(1 + argc as u16);
        self.builder()
            .emit(Instruction::op_d(Opcode::LoadBuildClass, base));
        self.builder().emit_move(Register(base.0 + 1), body_func);
        self.builder().free_register(body_func);
        self.builder()
            .emit_load_value(Register(base.0 + 2), Value::Str(name.into()));
        for (i, b) in bases.iter().enumerate() {
            self.compile_expr_into(Register(base.0 + 3 + i as u8), b)?;
        }
        self.builder()
            .emit(Instruction::op_dss(Opcode::Call, dst, base, argc as u8));
        self.builder().free_register_run(base);
        Ok(dst)
    }

    fn compile_comprehension(
        &mut self,
        kind: CompKind,
        element: &'a Expr,
        dict_value: Option<&'a Expr>,
        generators: &'a [Comprehension],
    ) -> CompileResult<Register> {
        let scope_id = self.take_next_child();
        let name = match kind {
            CompKind::List => "<listcomp>",
            CompKind::Set => "<setcomp>",
            CompKind::Dict => "<dictcomp>",
            CompKind::Generator => "<genexpr>",
        };

        // Compile the comprehension body as a one-parameter function: the
        // hidden `.0` argument carries the outermost iterable.
        self.push_unit(scope_id, name, CodeFlags::NONE);
        let result = match kind {
            CompKind::Generator => None,
            CompKind::List | CompKind::Set | CompKind::Dict => {
                let r = self.builder().alloc_register();
                let opcode = match kind {
                    CompKind::List => Opcode::BuildList,
                    CompKind::Set => Opcode::BuildSet,
                    _ => Opcode::BuildDict,
                };
                self.builder().emit(Instruction::op_dss(opcode, r, r, 0));
                Some(r)
            }
        };
        self.compile_comp_loops(kind, result, element, dict_value, generators, 0)?;
        match result {
            Some(r) => self.builder().emit_return(r),
            None => self.builder().emit_return_none(),
        }
        let code = Arc::new(self.pop_unit());

        let func = self.emit_make_function(scope_id, code, None)?;

        // Call it with the outermost iterable, evaluated here.
        let dst = self.builder().alloc_register();
        let base = self.builder().alloc_register_run(2);
        self.builder().emit_move(base, func);
        self.builder().free_register(func);
        self.compile_expr_into(Register(base.0 + 1), &generators[0].iter)?;
        self.builder()
            .emit(Instruction::op_dss(Opcode::Call, dst, base, 1));
        self.builder().free_register_run(base);
        Ok(dst)
    }

    fn compile_comp_loops(
        &mut self,
        kind: CompKind,
        result: Option<Register>,
        element: &'a Expr,
        dict_value: Option<&'a Expr>,
        generators: &'a [Comprehension],
        index: usize,
    ) -> CompileResult<()> {
        if index == generators.len() {
            return self.compile_comp_element(kind, result, element, dict_value);
        }
        let gen = &generators[index];

        let iterable = if index == 0 {
            // The hidden parameter `.0`.
            let r = self.builder().alloc_register();
            self.builder()
                .emit(Instruction::op_di(Opcode::LoadLocal, r, 0));
            r
        } else {
            self.compile_expr(&gen.iter)?
        };

        let pair = self.builder().alloc_register_run(2);
        self.builder()
            .emit(Instruction::op_ds(Opcode::GetIter, pair, iterable));
        self.builder().free_register(iterable);

        let loop_start = self.builder().create_label();
        let loop_end = self.builder().create_label();
        self.builder().bind_label(loop_start);
        self.builder().emit_for_iter(pair, loop_end);
        self.compile_store(&gen.target, Register(pair.0 + 1))?;

        for cond in &gen.ifs {
            let test = self.compile_expr(cond)?;
            self.builder().emit_jump_if_false(test, loop_start);
            self.builder().free_register(test);
        }

        self.compile_comp_loops(kind, result, element, dict_value, generators, index + 1)?;

        self.builder().emit_jump(loop_start);
        self.builder().bind_label(loop_end);
        self.builder().free_register_run(pair);
        Ok(())
    }

    fn compile_comp_element(
        &mut self,
        kind: CompKind,
        result: Option<Register>,
        element: &'a Expr,
        dict_value: Option<&'a Expr>,
    ) -> CompileResult<()> {
        match kind {
            CompKind::List => {
                let item = self.compile_expr(element)?;
                let result = result.expect("list comprehension has a result register");
                self.builder()
                    .emit(Instruction::op_ds(Opcode::ListAppend, result, item));
                self.builder().free_register(item);
            }
            CompKind::Set => {
                let item = self.compile_expr(element)?;
                let result = result.expect("set comprehension has a result register");
                self.builder()
                    .emit(Instruction::op_ds(Opcode::SetAdd, result, item));
                self.builder().free_register(item);
            }
            CompKind::Dict => {
                let key = self.compile_expr(element)?;
                let value = self.compile_expr(dict_value.expect("dict comprehension value"))?;
                let result = result.expect("dict comprehension has a result register");
                self.builder()
                    .emit(Instruction::op_dss(Opcode::DictAdd, result, key, value.0));
                self.builder().free_register(key);
                self.builder().free_register(value);
            }
            CompKind::Generator => {
                let item = self.compile_expr(element)?;
                self.builder().emit_move(Register(0), item);
                self.builder().free_register(item);
                self.builder().emit(Instruction::op(Opcode::Yield));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum FunctionBody<'a> {
    Stmts(&'a [Stmt]),
    Expr(&'a Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;

    fn compile(body: Vec<Stmt>) -> Arc<CodeObject> {
        compile_module(&Module::new(body), "<test>").expect("compile error")
    }

    fn func_def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::new(
            StmtKind::FunctionDef {
                name: name.to_string(),
                args: Arguments::positional(params),
                body,
                decorators: Vec::new(),
            },
            0,
        )
    }

    #[test]
    fn test_simple_module() {
        // x = 1 + 2 folds to x = 3.
        let code = compile(vec![Stmt::assign(
            "x",
            Expr::bin(Expr::int(1), BinOp::Add, Expr::int(2)),
        )]);
        assert!(code.is_module());
        let ops: Vec<Opcode> = code.instructions.iter().map(|i| i.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadConst,
                Opcode::StoreGlobal,
                Opcode::LoadNone,
                Opcode::Return
            ]
        );
    }

    #[test]
    fn test_function_def_produces_code_const() {
        let code = compile(vec![func_def(
            "add",
            &["a", "b"],
            vec![Stmt::ret(Expr::bin(
                Expr::name("a"),
                BinOp::Add,
                Expr::name("b"),
            ))],
        )]);
        let nested: Vec<_> = code
            .consts
            .iter()
            .filter_map(|c| match c {
                crate::bytecode::Const::Code(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(nested.len(), 1);
        let add = &nested[0];
        assert_eq!(&*add.name, "add");
        assert_eq!(add.arg_count, 2);
        assert_eq!(add.varnames.len(), 2);
        assert!(!add.is_generator());
    }

    #[test]
    fn test_generator_flag() {
        let code = compile(vec![func_def(
            "gen",
            &[],
            vec![Stmt::expr(Expr::new(
                ExprKind::Yield(Some(Box::new(Expr::int(1)))),
                0,
            ))],
        )]);
        let nested = code
            .consts
            .iter()
            .find_map(|c| match c {
                crate::bytecode::Const::Code(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert!(nested.is_generator());
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let make = || {
            compile(vec![
                func_def(
                    "f",
                    &["a"],
                    vec![
                        Stmt::assign("b", Expr::bin(Expr::name("a"), BinOp::Mul, Expr::int(2))),
                        Stmt::ret(Expr::name("b")),
                    ],
                ),
                Stmt::assign("y", Expr::call(Expr::name("f"), vec![Expr::int(21)])),
            ])
        };
        let a = make();
        let b = make();
        assert_eq!(disassemble(&a), disassemble(&b));
    }

    #[test]
    fn test_closure_emits_make_function_with_cells() {
        let code = compile(vec![func_def(
            "outer",
            &[],
            vec![
                Stmt::assign("x", Expr::int(1)),
                func_def("inner", &[], vec![Stmt::ret(Expr::name("x"))]),
                Stmt::ret(Expr::name("inner")),
            ],
        )]);
        let outer = code
            .consts
            .iter()
            .find_map(|c| match c {
                crate::bytecode::Const::Code(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(outer.cellvars.len(), 1);
        let ops: Vec<Opcode> = outer.instructions.iter().map(|i| i.opcode()).collect();
        assert!(ops.contains(&Opcode::LoadClosure));
        assert!(ops.contains(&Opcode::MakeFunction));
        assert!(ops.contains(&Opcode::StoreDeref));
    }

    #[test]
    fn test_for_loop_shape() {
        let code = compile(vec![Stmt::new(
            StmtKind::For {
                target: Expr::name("i"),
                iter: Expr::call(Expr::name("range"), vec![Expr::int(3)]),
                body: vec![Stmt::expr(Expr::call(
                    Expr::name("print"),
                    vec![Expr::name("i")],
                ))],
                orelse: Vec::new(),
            },
            0,
        )]);
        let ops: Vec<Opcode> = code.instructions.iter().map(|i| i.opcode()).collect();
        assert!(ops.contains(&Opcode::GetIter));
        assert!(ops.contains(&Opcode::ForIter));
    }

    #[test]
    fn test_method_call_uses_load_method() {
        let code = compile(vec![Stmt::expr(Expr::method(
            Expr::name("xs"),
            "append",
            vec![Expr::int(1)],
        ))]);
        let ops: Vec<Opcode> = code.instructions.iter().map(|i| i.opcode()).collect();
        assert!(ops.contains(&Opcode::LoadMethod));
        assert!(ops.contains(&Opcode::CallMethod));
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        let result = compile_module(
            &Module::new(vec![Stmt::new(StmtKind::Break, 3)]),
            "<test>",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_chained_compare_short_circuits() {
        let code = compile(vec![Stmt::expr(Expr::new(
            ExprKind::Compare {
                left: Box::new(Expr::name("a")),
                ops: vec![CmpOp::Lt, CmpOp::Lt],
                comparators: vec![Expr::name("b"), Expr::name("c")],
            },
            0,
        ))]);
        let jumps = code
            .instructions
            .iter()
            .filter(|i| i.opcode() == Opcode::JumpIfFalse)
            .count();
        assert_eq!(jumps, 1);
    }

    #[test]
    fn test_class_def_emits_build_class() {
        let code = compile(vec![Stmt::new(
            StmtKind::ClassDef {
                name: "C".to_string(),
                bases: Vec::new(),
                body: vec![Stmt::new(StmtKind::Pass, 0)],
                decorators: Vec::new(),
            },
            0,
        )]);
        let ops: Vec<Opcode> = code.instructions.iter().map(|i| i.opcode()).collect();
        assert!(ops.contains(&Opcode::LoadBuildClass));
        let class_body = code
            .consts
            .iter()
            .find_map(|c| match c {
                crate::bytecode::Const::Code(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert!(class_body.is_class_body());
    }
}
