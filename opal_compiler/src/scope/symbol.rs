//! Symbol table: per-scope name bindings and their classification.

use opal_core::intern;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// The kind of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
    Lambda,
    /// Comprehension or generator expression body.
    Comprehension,
}

impl ScopeKind {
    /// Whether locals live in frame registers (as opposed to a dict).
    #[inline]
    pub fn has_register_locals(self) -> bool {
        matches!(
            self,
            ScopeKind::Function | ScopeKind::Lambda | ScopeKind::Comprehension
        )
    }

    /// Whether nested scopes may capture this scope's locals. Class
    /// bodies are skipped during free-variable resolution.
    #[inline]
    pub fn provides_closure(self) -> bool {
        self.has_register_locals()
    }
}

/// Classification flags for a name binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingFlags(u16);

impl BindingFlags {
    pub const NONE: BindingFlags = BindingFlags(0);
    /// Assigned in this scope.
    pub const DEF: BindingFlags = BindingFlags(1 << 0);
    /// Referenced in this scope.
    pub const USE: BindingFlags = BindingFlags(1 << 1);
    /// Formal parameter.
    pub const PARAM: BindingFlags = BindingFlags(1 << 2);
    /// Declared `global`.
    pub const GLOBAL_EXPLICIT: BindingFlags = BindingFlags(1 << 3);
    /// Resolved to a module-level name.
    pub const GLOBAL_IMPLICIT: BindingFlags = BindingFlags(1 << 4);
    /// Declared `nonlocal`.
    pub const NONLOCAL: BindingFlags = BindingFlags(1 << 5);
    /// Captured from an enclosing scope.
    pub const FREE: BindingFlags = BindingFlags(1 << 6);
    /// Local captured by a nested scope.
    pub const CELL: BindingFlags = BindingFlags(1 << 7);

    #[inline]
    pub const fn contains(self, other: BindingFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BindingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        BindingFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BindingFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One name in one scope.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: Arc<str>,
    pub flags: BindingFlags,
    /// Register slot for register locals (parameters lead).
    pub local_slot: Option<u16>,
    /// Slot in the frame's cell storage (cells first, then frees).
    pub cell_slot: Option<u16>,
}

impl Binding {
    fn new(name: Arc<str>) -> Self {
        Binding {
            name,
            flags: BindingFlags::NONE,
            local_slot: None,
            cell_slot: None,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.flags.contains(BindingFlags::DEF)
            && !self.flags.contains(BindingFlags::GLOBAL_EXPLICIT)
            && !self.flags.contains(BindingFlags::NONLOCAL)
            && !self.flags.contains(BindingFlags::FREE)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags.contains(BindingFlags::FREE)
    }

    #[inline]
    pub fn is_cell(&self) -> bool {
        self.flags.contains(BindingFlags::CELL)
    }

    #[inline]
    pub fn is_param(&self) -> bool {
        self.flags.contains(BindingFlags::PARAM)
    }

    #[inline]
    pub fn is_explicit_global(&self) -> bool {
        self.flags.contains(BindingFlags::GLOBAL_EXPLICIT)
    }
}

/// How compiled code reaches a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAccess {
    /// Frame register (named local).
    Register(u16),
    /// Cell storage slot (cell or free variable).
    Cell(u16),
    /// Module-level name through the globals dict.
    Global,
    /// Dict-based lookup (class bodies): locals, then globals, builtins.
    Named,
}

/// Identifier of a scope within its [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(pub u32);

/// One lexical scope.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    /// Plain name (`<module>`, function or class name).
    pub name: Arc<str>,
    /// Qualified name including enclosing scopes.
    pub qualname: Arc<str>,
    pub parent: Option<ScopeId>,
    /// Nested scopes in source order; the code generator walks them with
    /// the same cursor the analyzer used.
    pub children: Vec<ScopeId>,

    bindings: FxHashMap<Arc<str>, Binding>,
    /// Insertion order of `bindings`, for deterministic slot assignment.
    order: Vec<Arc<str>>,

    pub has_yield: bool,
    pub has_varargs: bool,
    pub has_varkw: bool,
    pub arg_count: u16,
    pub posonly_count: u16,
    pub kwonly_count: u16,

    /// Register locals in slot order (parameters lead).
    pub varnames: Vec<Arc<str>>,
    /// Cell variables in slot order.
    pub cellvars: Vec<Arc<str>>,
    /// Free variables in slot order (after cells in cell storage).
    pub freevars: Vec<Arc<str>>,
    /// Parallel to `cellvars`: parameter index or `CELL_NOT_AN_ARG`.
    pub cell2arg: Vec<u16>,
}

impl Scope {
    pub fn new(kind: ScopeKind, name: impl Into<Arc<str>>, parent: Option<ScopeId>) -> Self {
        let name = name.into();
        Scope {
            kind,
            qualname: name.clone(),
            name,
            parent,
            children: Vec::new(),
            bindings: FxHashMap::default(),
            order: Vec::new(),
            has_yield: false,
            has_varargs: false,
            has_varkw: false,
            arg_count: 0,
            posonly_count: 0,
            kwonly_count: 0,
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            cell2arg: Vec::new(),
        }
    }

    fn entry(&mut self, name: &str) -> &mut Binding {
        if !self.bindings.contains_key(name) {
            let name = intern(name);
            self.order.push(name.clone());
            self.bindings.insert(name.clone(), Binding::new(name));
        }
        self.bindings.get_mut(name).expect("binding just inserted")
    }

    /// Record an assignment to `name`.
    pub fn define(&mut self, name: &str, flags: BindingFlags) {
        self.entry(name).flags |= flags | BindingFlags::DEF;
    }

    /// Record a reference to `name`.
    pub fn record_use(&mut self, name: &str) {
        self.entry(name).flags |= BindingFlags::USE;
    }

    /// Record a `global` or `nonlocal` declaration.
    pub fn declare(&mut self, name: &str, flags: BindingFlags) {
        self.entry(name).flags |= flags;
    }

    pub fn mark(&mut self, name: &str, flags: BindingFlags) {
        self.entry(name).flags |= flags;
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.bindings.get_mut(name)
    }

    /// Names in insertion order.
    pub fn names_in_order(&self) -> &[Arc<str>] {
        &self.order
    }

    /// Resolve how compiled code in this scope reaches `name`.
    pub fn access(&self, name: &str) -> VarAccess {
        if let Some(binding) = self.lookup(name) {
            if binding.is_cell() || binding.is_free() {
                if let Some(slot) = binding.cell_slot {
                    return VarAccess::Cell(slot);
                }
            }
            if binding.is_local() && !binding.is_cell() {
                if self.kind.has_register_locals() {
                    if let Some(slot) = binding.local_slot {
                        return VarAccess::Register(slot);
                    }
                }
                if self.kind == ScopeKind::Class {
                    return VarAccess::Named;
                }
                // Module-level locals are globals.
                return VarAccess::Global;
            }
        }
        if self.kind == ScopeKind::Class {
            return VarAccess::Named;
        }
        VarAccess::Global
    }

    /// Assign local/cell/free slots. Called once per scope after free
    /// variable resolution, in deterministic insertion order.
    pub fn assign_slots(&mut self) {
        debug_assert!(self.varnames.is_empty());

        // Parameters first, in declaration order.
        let params: Vec<Arc<str>> = self
            .order
            .iter()
            .filter(|n| self.bindings[*n].is_param())
            .cloned()
            .collect();
        for name in &params {
            let slot = self.varnames.len() as u16;
            self.varnames.push(name.clone());
            if let Some(b) = self.bindings.get_mut(name) {
                b.local_slot = Some(slot);
            }
        }

        if self.kind.has_register_locals() {
            let rest: Vec<Arc<str>> = self
                .order
                .iter()
                .filter(|n| {
                    let b = &self.bindings[*n];
                    b.is_local() && !b.is_param() && !b.is_cell()
                })
                .cloned()
                .collect();
            for name in rest {
                let slot = self.varnames.len() as u16;
                self.varnames.push(name.clone());
                if let Some(b) = self.bindings.get_mut(&name) {
                    b.local_slot = Some(slot);
                }
            }
        }

        // Cells, then frees, share the frame's cell storage.
        let cells: Vec<Arc<str>> = self
            .order
            .iter()
            .filter(|n| self.bindings[*n].is_cell())
            .cloned()
            .collect();
        for name in cells {
            let slot = self.cellvars.len() as u16;
            let arg = params.iter().position(|p| **p == *name);
            self.cellvars.push(name.clone());
            self.cell2arg
                .push(arg.map_or(crate::bytecode::CELL_NOT_AN_ARG, |i| i as u16));
            if let Some(b) = self.bindings.get_mut(&name) {
                b.cell_slot = Some(slot);
            }
        }
        let cell_count = self.cellvars.len() as u16;
        let frees: Vec<Arc<str>> = self
            .order
            .iter()
            .filter(|n| self.bindings[*n].is_free())
            .cloned()
            .collect();
        for name in frees {
            let slot = cell_count + self.freevars.len() as u16;
            self.freevars.push(name.clone());
            if let Some(b) = self.bindings.get_mut(&name) {
                b.cell_slot = Some(slot);
            }
        }
    }
}

/// The scope tree produced by analysis; index 0 is the module scope.
#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl ScopeTree {
    pub fn new(root: Scope) -> Self {
        ScopeTree { scopes: vec![root] }
    }

    pub const fn root() -> ScopeId {
        ScopeId(0)
    }

    pub fn push(&mut self, scope: Scope) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Ids in creation (source) order.
    pub fn ids(&self) -> impl Iterator<Item = ScopeId> {
        (0..self.scopes.len() as u32).map(ScopeId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_classification() {
        let mut scope = Scope::new(ScopeKind::Function, "f", None);
        scope.define("x", BindingFlags::PARAM);
        scope.record_use("y");

        let x = scope.lookup("x").unwrap();
        assert!(x.is_local());
        assert!(x.is_param());

        let y = scope.lookup("y").unwrap();
        assert!(!y.is_local());
        assert!(y.flags.contains(BindingFlags::USE));
    }

    #[test]
    fn test_slot_assignment_params_lead() {
        let mut scope = Scope::new(ScopeKind::Function, "f", None);
        scope.define("a", BindingFlags::PARAM);
        scope.define("b", BindingFlags::PARAM);
        scope.define("tmp", BindingFlags::NONE);
        scope.assign_slots();

        assert_eq!(scope.varnames.len(), 3);
        assert_eq!(&*scope.varnames[0], "a");
        assert_eq!(&*scope.varnames[1], "b");
        assert_eq!(scope.access("tmp"), VarAccess::Register(2));
    }

    #[test]
    fn test_cell_param_gets_cell2arg() {
        let mut scope = Scope::new(ScopeKind::Function, "f", None);
        scope.define("a", BindingFlags::PARAM);
        scope.define("b", BindingFlags::PARAM);
        scope.mark("b", BindingFlags::CELL);
        scope.assign_slots();

        assert_eq!(scope.cellvars.len(), 1);
        assert_eq!(scope.cell2arg, vec![1]);
        // Cell variables are reached through the cell, not the register.
        assert_eq!(scope.access("b"), VarAccess::Cell(0));
    }

    #[test]
    fn test_frees_follow_cells_in_storage() {
        let mut scope = Scope::new(ScopeKind::Function, "f", None);
        scope.define("c", BindingFlags::NONE);
        scope.mark("c", BindingFlags::CELL);
        scope.record_use("outer");
        scope.mark("outer", BindingFlags::FREE);
        scope.assign_slots();

        assert_eq!(scope.access("c"), VarAccess::Cell(0));
        assert_eq!(scope.access("outer"), VarAccess::Cell(1));
    }

    #[test]
    fn test_module_locals_are_global() {
        let mut scope = Scope::new(ScopeKind::Module, "<module>", None);
        scope.define("x", BindingFlags::NONE);
        scope.assign_slots();
        assert_eq!(scope.access("x"), VarAccess::Global);
        assert_eq!(scope.access("unknown"), VarAccess::Global);
    }

    #[test]
    fn test_class_scope_uses_named_access() {
        let mut scope = Scope::new(ScopeKind::Class, "C", None);
        scope.define("method", BindingFlags::NONE);
        scope.assign_slots();
        assert_eq!(scope.access("method"), VarAccess::Named);
        assert_eq!(scope.access("unknown"), VarAccess::Named);
    }
}
