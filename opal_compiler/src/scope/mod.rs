//! Scope analysis: symbol tables and the AST walker that classifies
//! every name as local, cell, free or global.

mod analyzer;
mod symbol;

pub use analyzer::ScopeAnalyzer;
pub use symbol::{Binding, BindingFlags, Scope, ScopeId, ScopeKind, ScopeTree, VarAccess};
