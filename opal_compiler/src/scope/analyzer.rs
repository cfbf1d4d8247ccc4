//! AST scope analysis.
//!
//! Walks the module and produces a [`ScopeTree`]: every name classified
//! as a register local, cell variable, free variable or global, with
//! slots assigned. A local is promoted to a cell variable when any nested
//! scope references it; the reference becomes a free variable in the
//! nested scope and in every scope in between, so closure wiring can pass
//! the cell down at function-creation time.
//!
//! The code generator later walks the same tree with the same child
//! cursor, so the analyzer and the generator must visit nested scopes in
//! identical source order.

use super::symbol::{BindingFlags, Scope, ScopeId, ScopeKind, ScopeTree};
use crate::error::{CompileError, CompileResult};
use opal_ast::{Arguments, Comprehension, Expr, ExprKind, Module, Stmt, StmtKind};

pub struct ScopeAnalyzer {
    tree: ScopeTree,
    stack: Vec<ScopeId>,
}

impl ScopeAnalyzer {
    /// Analyze a module, producing the classified scope tree.
    pub fn analyze(module: &Module, name: &str) -> CompileResult<ScopeTree> {
        let root = Scope::new(ScopeKind::Module, name, None);
        let mut analyzer = ScopeAnalyzer {
            tree: ScopeTree::new(root),
            stack: vec![ScopeTree::root()],
        };
        for stmt in &module.body {
            analyzer.visit_stmt(stmt)?;
        }
        analyzer.resolve_free_variables()?;
        for id in analyzer.tree.ids().collect::<Vec<_>>() {
            analyzer.tree.get_mut(id).assign_slots();
        }
        Ok(analyzer.tree)
    }

    fn current_id(&self) -> ScopeId {
        *self.stack.last().expect("scope stack underflow")
    }

    fn current(&mut self) -> &mut Scope {
        let id = self.current_id();
        self.tree.get_mut(id)
    }

    /// Create a child scope and make it current.
    ///
    /// Scope creation order is a contract with the code generator: it
    /// consumes children by cursor in emission order, which is the
    /// nested scope first and only then any enclosing-scope expressions
    /// (defaults, decorators, bases, the outermost comprehension
    /// iterable). Callers that need to visit such expressions create the
    /// scope, [`Self::leave`] it, visit, and [`Self::reenter`].
    fn enter(&mut self, kind: ScopeKind, name: &str) -> ScopeId {
        let parent = self.current_id();
        let parent_scope = self.tree.get(parent);
        let qualname = match parent_scope.kind {
            ScopeKind::Module => name.to_string(),
            ScopeKind::Class => format!("{}.{}", parent_scope.qualname, name),
            _ => format!("{}.<locals>.{}", parent_scope.qualname, name),
        };
        let mut scope = Scope::new(kind, name, Some(parent));
        scope.qualname = qualname.into();
        let id = self.tree.push(scope);
        self.tree.get_mut(parent).children.push(id);
        self.stack.push(id);
        id
    }

    fn leave(&mut self) {
        self.stack.pop();
    }

    fn reenter(&mut self, id: ScopeId) {
        self.stack.push(id);
    }

    // =========================================================================
    // Statement walk
    // =========================================================================

    fn visit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.visit_expr(e)?,

            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.bind_target(target)?;
                }
            }

            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(value)?;
                self.visit_expr(target)?;
                self.bind_target(target)?;
            }

            StmtKind::Return(value) => {
                if let Some(v) = value {
                    self.visit_expr(v)?;
                }
            }

            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}

            StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }

            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_expr(iter)?;
                self.bind_target(target)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }

            StmtKind::FunctionDef {
                name,
                args,
                body,
                decorators,
            } => {
                self.current().define(name, BindingFlags::NONE);

                let scope = self.enter(ScopeKind::Function, name);
                self.leave();
                // Defaults and decorators are evaluated in the enclosing
                // scope, in the generator's emission order.
                self.visit_defaults(args)?;
                for dec in decorators {
                    self.visit_expr(dec)?;
                }

                self.reenter(scope);
                self.declare_params(args);
                self.visit_body(body)?;
                self.leave();
            }

            StmtKind::ClassDef {
                name,
                bases,
                body,
                decorators,
            } => {
                self.current().define(name, BindingFlags::NONE);

                let scope = self.enter(ScopeKind::Class, name);
                self.leave();
                for base in bases {
                    self.visit_expr(base)?;
                }
                for dec in decorators {
                    self.visit_expr(dec)?;
                }

                self.reenter(scope);
                self.visit_body(body)?;
                self.leave();
            }

            StmtKind::Raise { exc, cause } => {
                if let Some(e) = exc {
                    self.visit_expr(e)?;
                }
                if let Some(c) = cause {
                    self.visit_expr(c)?;
                }
            }

            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_body(body)?;
                for handler in handlers {
                    if let Some(t) = &handler.typ {
                        self.visit_expr(t)?;
                    }
                    if let Some(name) = &handler.name {
                        self.current().define(name, BindingFlags::NONE);
                    }
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(orelse)?;
                self.visit_body(finalbody)?;
            }

            StmtKind::With { items, body } => {
                for item in items {
                    self.visit_expr(&item.context)?;
                    if let Some(v) = &item.optional_vars {
                        self.bind_target(v)?;
                    }
                }
                self.visit_body(body)?;
            }

            StmtKind::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(m) = msg {
                    self.visit_expr(m)?;
                }
            }

            StmtKind::Import { names } => {
                for alias in names {
                    let bound = alias.asname.as_deref().unwrap_or_else(|| {
                        alias.name.split('.').next().unwrap_or(&alias.name)
                    });
                    self.current().define(bound, BindingFlags::NONE);
                }
            }

            StmtKind::ImportFrom { names, star, .. } => {
                if !star {
                    for alias in names {
                        let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                        self.current().define(bound, BindingFlags::NONE);
                    }
                }
            }

            StmtKind::Global(names) => {
                for name in names {
                    self.current().declare(name, BindingFlags::GLOBAL_EXPLICIT);
                }
            }

            StmtKind::Nonlocal(names) => {
                if self.current_id() == ScopeTree::root() {
                    return Err(CompileError::new(
                        "nonlocal declaration at module level",
                        stmt.line,
                    ));
                }
                for name in names {
                    self.current().declare(name, BindingFlags::NONLOCAL);
                }
            }

            StmtKind::Delete(targets) => {
                for target in targets {
                    match &target.kind {
                        ExprKind::Name(name) => {
                            // `del` both references and (un)binds the name.
                            self.current().record_use(name);
                            self.current().define(name, BindingFlags::NONE);
                        }
                        _ => self.visit_expr(target)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    /// Record assignments performed by an assignment target.
    fn bind_target(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.current().define(name, BindingFlags::NONE);
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                for e in elts {
                    self.bind_target(e)?;
                }
            }
            ExprKind::Starred(inner) => self.bind_target(inner)?,
            ExprKind::Attribute { value, .. } => self.visit_expr(value)?,
            ExprKind::Subscript { value, index } => {
                self.visit_expr(value)?;
                self.visit_expr(index)?;
            }
            _ => {
                return Err(CompileError::new("invalid assignment target", target.line));
            }
        }
        Ok(())
    }

    fn declare_params(&mut self, args: &Arguments) {
        let scope = self.current();
        scope.arg_count = (args.posonlyargs.len() + args.args.len()) as u16;
        scope.posonly_count = args.posonlyargs.len() as u16;
        scope.kwonly_count = args.kwonlyargs.len() as u16;
        for arg in args.posonlyargs.iter().chain(&args.args) {
            scope.define(&arg.name, BindingFlags::PARAM);
        }
        for arg in &args.kwonlyargs {
            scope.define(&arg.name, BindingFlags::PARAM);
        }
        if let Some(vararg) = &args.vararg {
            scope.define(&vararg.name, BindingFlags::PARAM);
            scope.has_varargs = true;
        }
        if let Some(kwarg) = &args.kwarg {
            scope.define(&kwarg.name, BindingFlags::PARAM);
            scope.has_varkw = true;
        }
    }

    fn visit_defaults(&mut self, args: &Arguments) -> CompileResult<()> {
        for default in &args.defaults {
            self.visit_expr(default)?;
        }
        for default in args.kw_defaults.iter().flatten() {
            self.visit_expr(default)?;
        }
        Ok(())
    }

    // =========================================================================
    // Expression walk
    // =========================================================================

    fn visit_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Name(name) => self.current().record_use(name),

            ExprKind::Int(_)
            | ExprKind::BigInt(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Bytes(_)
            | ExprKind::Bool(_)
            | ExprKind::NoneLiteral
            | ExprKind::Ellipsis => {}

            ExprKind::Tuple(elts) | ExprKind::List(elts) | ExprKind::Set(elts) => {
                for e in elts {
                    self.visit_expr(e)?;
                }
            }

            ExprKind::Dict { keys, values } => {
                for e in keys.iter().chain(values) {
                    self.visit_expr(e)?;
                }
            }

            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }

            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand)?,

            ExprKind::BoolOp { values, .. } => {
                for v in values {
                    self.visit_expr(v)?;
                }
            }

            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left)?;
                for c in comparators {
                    self.visit_expr(c)?;
                }
            }

            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.visit_expr(func)?;
                for a in args {
                    self.visit_expr(a)?;
                }
                for k in keywords {
                    self.visit_expr(&k.value)?;
                }
            }

            ExprKind::Attribute { value, .. } => self.visit_expr(value)?,

            ExprKind::Subscript { value, index } => {
                self.visit_expr(value)?;
                self.visit_expr(index)?;
            }

            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
            }

            ExprKind::Lambda { args, body } => {
                let scope = self.enter(ScopeKind::Lambda, "<lambda>");
                self.leave();
                self.visit_defaults(args)?;
                self.reenter(scope);
                self.declare_params(args);
                self.visit_expr(body)?;
                self.leave();
            }

            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }

            ExprKind::Yield(value) => {
                self.current().has_yield = true;
                if let Some(v) = value {
                    self.visit_expr(v)?;
                }
            }

            ExprKind::YieldFrom(value) => {
                self.current().has_yield = true;
                self.visit_expr(value)?;
            }

            ExprKind::Starred(inner) => self.visit_expr(inner)?,

            ExprKind::JoinedStr(parts) => {
                for p in parts {
                    self.visit_expr(p)?;
                }
            }

            ExprKind::ListComp {
                element,
                generators,
            } => {
                self.visit_comprehension("<listcomp>", generators, |a| a.visit_expr(element), false)?;
            }

            ExprKind::SetComp {
                element,
                generators,
            } => {
                self.visit_comprehension("<setcomp>", generators, |a| a.visit_expr(element), false)?;
            }

            ExprKind::GeneratorExp {
                element,
                generators,
            } => {
                self.visit_comprehension("<genexpr>", generators, |a| a.visit_expr(element), true)?;
            }

            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                self.visit_comprehension(
                    "<dictcomp>",
                    generators,
                    |a| {
                        a.visit_expr(key)?;
                        a.visit_expr(value)
                    },
                    false,
                )?;
            }
        }
        Ok(())
    }

    /// Comprehensions get their own function scope. The outermost
    /// iterable is evaluated in the enclosing scope and passed in as the
    /// hidden `.0` parameter; everything else runs inside the new scope.
    fn visit_comprehension(
        &mut self,
        name: &str,
        generators: &[Comprehension],
        element: impl FnOnce(&mut Self) -> CompileResult<()>,
        is_generator: bool,
    ) -> CompileResult<()> {
        let (first, rest) = generators
            .split_first()
            .ok_or_else(|| CompileError::new("comprehension without generators", 0))?;

        // The scope exists before the outermost iterable is visited (the
        // generator compiles the body first), but the iterable itself is
        // resolved in the enclosing scope.
        let scope = self.enter(ScopeKind::Comprehension, name);
        self.leave();
        self.visit_expr(&first.iter)?;
        self.reenter(scope);
        {
            let scope = self.current();
            scope.define(".0", BindingFlags::PARAM);
            scope.arg_count = 1;
            scope.has_yield = is_generator;
        }
        self.bind_target(&first.target)?;
        for cond in &first.ifs {
            self.visit_expr(cond)?;
        }
        for gen in rest {
            self.visit_expr(&gen.iter)?;
            self.bind_target(&gen.target)?;
            for cond in &gen.ifs {
                self.visit_expr(cond)?;
            }
        }
        element(self)?;
        self.leave();
        Ok(())
    }

    // =========================================================================
    // Free variable resolution
    // =========================================================================

    /// Classify every unbound or nonlocal name: find its defining
    /// function scope (promoting the definition to a cell), mark the
    /// chain of intermediate scopes free, or fall back to global.
    fn resolve_free_variables(&mut self) -> CompileResult<()> {
        for id in self.tree.ids().collect::<Vec<_>>() {
            if id == ScopeTree::root() {
                continue;
            }
            let candidates: Vec<(std::sync::Arc<str>, bool)> = {
                let scope = self.tree.get(id);
                scope
                    .names_in_order()
                    .iter()
                    .filter_map(|name| {
                        let b = scope.lookup(name).expect("name listed but unbound");
                        let nonlocal = b.flags.contains(BindingFlags::NONLOCAL);
                        let unbound = b.flags.contains(BindingFlags::USE)
                            && !b.flags.contains(BindingFlags::DEF)
                            && !b.flags.contains(BindingFlags::GLOBAL_EXPLICIT)
                            && !b.is_free();
                        (nonlocal || unbound).then(|| (name.clone(), nonlocal))
                    })
                    .collect()
            };

            for (name, nonlocal) in candidates {
                self.resolve_name(id, &name, nonlocal)?;
            }
        }
        Ok(())
    }

    fn resolve_name(&mut self, scope_id: ScopeId, name: &str, nonlocal: bool) -> CompileResult<()> {
        // Walk the enclosing chain looking for a providing function scope.
        let mut provider = None;
        let mut cursor = self.tree.get(scope_id).parent;
        while let Some(id) = cursor {
            let scope = self.tree.get(id);
            match scope.kind {
                ScopeKind::Module => break,
                // Class bodies do not provide closure bindings.
                ScopeKind::Class => {}
                _ => {
                    if let Some(binding) = scope.lookup(name) {
                        if binding.is_explicit_global() {
                            break;
                        }
                        if binding.is_free() || binding.is_cell() || binding.is_local() {
                            provider = Some(id);
                            break;
                        }
                    }
                }
            }
            cursor = scope.parent;
        }

        let Some(provider) = provider else {
            if nonlocal {
                return Err(CompileError::new(
                    format!("no binding for nonlocal '{name}' found"),
                    0,
                ));
            }
            self.tree
                .get_mut(scope_id)
                .mark(name, BindingFlags::GLOBAL_IMPLICIT);
            return Ok(());
        };

        // Promote the definition to a cell (unless it is itself free, in
        // which case the true definition was promoted already).
        {
            let scope = self.tree.get_mut(provider);
            let binding = scope.lookup_mut(name).expect("provider lost binding");
            if !binding.is_free() {
                binding.flags |= BindingFlags::CELL;
            }
        }

        // Mark the using scope and every scope between it and the
        // provider as free so closure wiring can pass the cell down.
        let mut cursor = Some(scope_id);
        while let Some(id) = cursor {
            if id == provider {
                break;
            }
            self.tree.get_mut(id).mark(name, BindingFlags::FREE);
            cursor = self.tree.get(id).parent;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::VarAccess;
    use opal_ast::{Arg, BinOp};

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
    fn test_module_names_are_global() {
        let module = Module::new(vec![
            Stmt::assign("x", Expr::int(1)),
            Stmt::expr(Expr::call(Expr::name("print"), vec![Expr::name("x")])),
        ]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let root = tree.get(ScopeTree::root());
        assert_eq!(root.access("x"), VarAccess::Global);
        assert_eq!(root.access("print"), VarAccess::Global);
    }

    #[test]
    fn test_function_locals() {
        let module = Module::new(vec![func_def(
            "f",
            &["a"],
            vec![
                Stmt::assign("b", Expr::bin(Expr::name("a"), BinOp::Add, Expr::int(1))),
                Stmt::ret(Expr::name("b")),
            ],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let f = tree.get(tree.get(ScopeTree::root()).children[0]);
        assert_eq!(f.access("a"), VarAccess::Register(0));
        assert_eq!(f.access("b"), VarAccess::Register(1));
        assert_eq!(f.varnames.len(), 2);
    }

    #[test]
    fn test_closure_promotes_cell() {
        // def outer():
        //     x = 1
        //     def inner():
        //         return x
        let module = Module::new(vec![func_def(
            "outer",
            &[],
            vec![
                Stmt::assign("x", Expr::int(1)),
                func_def("inner", &[], vec![Stmt::ret(Expr::name("x"))]),
            ],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let outer = tree.get(tree.get(ScopeTree::root()).children[0]);
        let inner = tree.get(outer.children[0]);

        assert_eq!(outer.cellvars.len(), 1);
        assert_eq!(&*outer.cellvars[0], "x");
        assert_eq!(outer.access("x"), VarAccess::Cell(0));

        assert_eq!(inner.freevars.len(), 1);
        assert_eq!(inner.access("x"), VarAccess::Cell(0));
    }

    #[test]
    fn test_cell_through_intermediate_scope() {
        // def a():
        //     x = 1
        //     def b():
        //         def c():
        //             return x
        let module = Module::new(vec![func_def(
            "a",
            &[],
            vec![
                Stmt::assign("x", Expr::int(1)),
                func_def(
                    "b",
                    &[],
                    vec![func_def("c", &[], vec![Stmt::ret(Expr::name("x"))])],
                ),
            ],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let a = tree.get(tree.get(ScopeTree::root()).children[0]);
        let b = tree.get(a.children[0]);
        let c = tree.get(b.children[0]);

        assert_eq!(a.cellvars.len(), 1);
        // Pass-through scope carries x as a free variable.
        assert_eq!(b.freevars.len(), 1);
        assert_eq!(c.freevars.len(), 1);
    }

    #[test]
    fn test_param_captured_by_closure() {
        // def make(i):
        //     def get(): return i
        let module = Module::new(vec![func_def(
            "make",
            &["i"],
            vec![func_def("get", &[], vec![Stmt::ret(Expr::name("i"))])],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let make = tree.get(tree.get(ScopeTree::root()).children[0]);
        assert_eq!(make.cellvars.len(), 1);
        assert_eq!(make.cell2arg, vec![0]);
        assert_eq!(make.access("i"), VarAccess::Cell(0));
    }

    #[test]
    fn test_global_declaration_wins() {
        let module = Module::new(vec![func_def(
            "f",
            &[],
            vec![
                Stmt::new(StmtKind::Global(vec!["x".to_string()]), 0),
                Stmt::assign("x", Expr::int(2)),
            ],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let f = tree.get(tree.get(ScopeTree::root()).children[0]);
        assert_eq!(f.access("x"), VarAccess::Global);
        assert!(f.cellvars.is_empty());
    }

    #[test]
    fn test_nonlocal_without_binding_errors() {
        let module = Module::new(vec![func_def(
            "f",
            &[],
            vec![
                Stmt::new(StmtKind::Nonlocal(vec!["x".to_string()]), 0),
                Stmt::assign("x", Expr::int(2)),
            ],
        )]);
        assert!(ScopeAnalyzer::analyze(&module, "<module>").is_err());
    }

    #[test]
    fn test_generator_detection() {
        let module = Module::new(vec![func_def(
            "gen",
            &[],
            vec![Stmt::expr(Expr::new(
                ExprKind::Yield(Some(Box::new(Expr::int(1)))),
                0,
            ))],
        )]);
        let tree = ScopeAnalyzer::analyze(&module, "<module>").unwrap();
        let gen = tree.get(tree.get(ScopeTree::root()).children[0]);
        assert!(gen.has_yield);
    }
}
