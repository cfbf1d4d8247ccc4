//! Constant folding over the AST.
//!
//! Runs before scope analysis and code generation. Folds arithmetic,
//! boolean and comparison operators whose operands are literals. Anything
//! that could raise at runtime (division by zero, overflowing shifts) is
//! left unfolded so the error surfaces with normal exception semantics.

use opal_ast::{BinOp, BoolOp, CmpOp, Expr, ExprKind, Module, Stmt, StmtKind, UnaryOp};

/// Fold constants throughout a module.
pub fn fold_module(mut module: Module) -> Module {
    for stmt in &mut module.body {
        fold_stmt(stmt);
    }
    module
}

fn fold_body(body: &mut [Stmt]) {
    for stmt in body {
        fold_stmt(stmt);
    }
}

fn fold_stmt(stmt: &mut Stmt) {
    match &mut stmt.kind {
        StmtKind::Expr(e) => fold_expr(e),
        StmtKind::Assign { targets, value } => {
            for t in targets {
                fold_expr(t);
            }
            fold_expr(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            fold_expr(target);
            fold_expr(value);
        }
        StmtKind::Return(value) => {
            if let Some(v) = value {
                fold_expr(v);
            }
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            fold_expr(test);
            fold_body(body);
            fold_body(orelse);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            fold_expr(target);
            fold_expr(iter);
            fold_body(body);
            fold_body(orelse);
        }
        StmtKind::FunctionDef {
            args,
            body,
            decorators,
            ..
        } => {
            for d in decorators {
                fold_expr(d);
            }
            for d in &mut args.defaults {
                fold_expr(d);
            }
            for d in args.kw_defaults.iter_mut().flatten() {
                fold_expr(d);
            }
            fold_body(body);
        }
        StmtKind::ClassDef {
            bases,
            body,
            decorators,
            ..
        } => {
            for e in decorators.iter_mut().chain(bases.iter_mut()) {
                fold_expr(e);
            }
            fold_body(body);
        }
        StmtKind::Raise { exc, cause } => {
            for e in [exc, cause].into_iter().flatten() {
                fold_expr(e);
            }
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            fold_body(body);
            for h in handlers {
                if let Some(t) = &mut h.typ {
                    fold_expr(t);
                }
                fold_body(&mut h.body);
            }
            fold_body(orelse);
            fold_body(finalbody);
        }
        StmtKind::With { items, body } => {
            for item in items {
                fold_expr(&mut item.context);
            }
            fold_body(body);
        }
        StmtKind::Assert { test, msg } => {
            fold_expr(test);
            if let Some(m) = msg {
                fold_expr(m);
            }
        }
        StmtKind::Delete(targets) => {
            for t in targets {
                fold_expr(t);
            }
        }
        StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Import { .. }
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_) => {}
    }
}

fn fold_expr(expr: &mut Expr) {
    // Fold children first, then try to collapse this node.
    match &mut expr.kind {
        ExprKind::BinOp { left, right, .. } => {
            fold_expr(left);
            fold_expr(right);
        }
        ExprKind::UnaryOp { operand, .. } => fold_expr(operand),
        ExprKind::BoolOp { values, .. } => {
            for v in values {
                fold_expr(v);
            }
        }
        ExprKind::Compare {
            left, comparators, ..
        } => {
            fold_expr(left);
            for c in comparators {
                fold_expr(c);
            }
        }
        ExprKind::Tuple(elts) | ExprKind::List(elts) | ExprKind::Set(elts) => {
            for e in elts {
                fold_expr(e);
            }
        }
        ExprKind::Dict { keys, values } => {
            for e in keys.iter_mut().chain(values.iter_mut()) {
                fold_expr(e);
            }
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            fold_expr(func);
            for a in args {
                fold_expr(a);
            }
            for k in keywords {
                fold_expr(&mut k.value);
            }
        }
        ExprKind::Attribute { value, .. } => fold_expr(value),
        ExprKind::Subscript { value, index } => {
            fold_expr(value);
            fold_expr(index);
        }
        ExprKind::IfExp { test, body, orelse } => {
            fold_expr(test);
            fold_expr(body);
            fold_expr(orelse);
        }
        ExprKind::Starred(inner) | ExprKind::YieldFrom(inner) => fold_expr(inner),
        ExprKind::Yield(Some(inner)) => fold_expr(inner),
        ExprKind::JoinedStr(parts) => {
            for p in parts {
                fold_expr(p);
            }
        }
        _ => {}
    }

    if let Some(folded) = try_fold(expr) {
        expr.kind = folded;
    }
}

fn try_fold(expr: &Expr) -> Option<ExprKind> {
    match &expr.kind {
        ExprKind::BinOp { left, op, right } => fold_binop(left, *op, right),
        ExprKind::UnaryOp { op, operand } => fold_unary(*op, operand),
        ExprKind::BoolOp { op, values } => fold_boolop(*op, values),
        ExprKind::Compare {
            left,
            ops,
            comparators,
        } if ops.len() == 1 => fold_compare(left, ops[0], &comparators[0]),
        _ => None,
    }
}

fn fold_binop(left: &Expr, op: BinOp, right: &Expr) -> Option<ExprKind> {
    use ExprKind::*;

    match (&left.kind, &right.kind) {
        (Int(a), Int(b)) => {
            let (a, b) = (*a, *b);
            let v = match op {
                opal_ast::BinOp::Add => a.checked_add(b)?,
                opal_ast::BinOp::Sub => a.checked_sub(b)?,
                opal_ast::BinOp::Mul => a.checked_mul(b)?,
                // Runtime raises on b == 0; leave those unfolded.
                opal_ast::BinOp::FloorDiv if b != 0 => {
                    let q = a.checked_div(b)?;
                    if (a % b != 0) && ((a < 0) != (b < 0)) {
                        q - 1
                    } else {
                        q
                    }
                }
                opal_ast::BinOp::Mod if b != 0 => {
                    let r = a % b;
                    if r != 0 && ((r < 0) != (b < 0)) {
                        r + b
                    } else {
                        r
                    }
                }
                opal_ast::BinOp::Div if b != 0 => return Some(Float(a as f64 / b as f64)),
                opal_ast::BinOp::Pow if (0..=62).contains(&b) => a.checked_pow(b as u32)?,
                opal_ast::BinOp::LShift if (0..64).contains(&b) => a.checked_shl(b as u32)?,
                opal_ast::BinOp::RShift if (0..64).contains(&b) => a.checked_shr(b as u32)?,
                opal_ast::BinOp::BitAnd => a & b,
                opal_ast::BinOp::BitOr => a | b,
                opal_ast::BinOp::BitXor => a ^ b,
                _ => return None,
            };
            Some(Int(v))
        }
        (Float(a), Float(b)) => fold_float(*a, op, *b),
        (Int(a), Float(b)) => fold_float(*a as f64, op, *b),
        (Float(a), Int(b)) => fold_float(*a, op, *b as f64),
        (Str(a), Str(b)) if op == opal_ast::BinOp::Add => Some(Str(format!("{a}{b}"))),
        (Str(s), Int(n)) if op == opal_ast::BinOp::Mul && (0..=1024).contains(n) => {
            Some(Str(s.repeat(*n as usize)))
        }
        _ => None,
    }
}

fn fold_float(a: f64, op: BinOp, b: f64) -> Option<ExprKind> {
    let v = match op {
        opal_ast::BinOp::Add => a + b,
        opal_ast::BinOp::Sub => a - b,
        opal_ast::BinOp::Mul => a * b,
        opal_ast::BinOp::Div if b != 0.0 => a / b,
        opal_ast::BinOp::FloorDiv if b != 0.0 => (a / b).floor(),
        opal_ast::BinOp::Mod if b != 0.0 => a - b * (a / b).floor(),
        opal_ast::BinOp::Pow => a.powf(b),
        _ => return None,
    };
    Some(ExprKind::Float(v))
}

fn fold_unary(op: UnaryOp, operand: &Expr) -> Option<ExprKind> {
    use ExprKind::*;
    match (op, &operand.kind) {
        (opal_ast::UnaryOp::Neg, Int(v)) => v.checked_neg().map(Int),
        (opal_ast::UnaryOp::Neg, Float(v)) => Some(Float(-v)),
        (opal_ast::UnaryOp::Pos, Int(v)) => Some(Int(*v)),
        (opal_ast::UnaryOp::Pos, Float(v)) => Some(Float(*v)),
        (opal_ast::UnaryOp::Invert, Int(v)) => Some(Int(!v)),
        (opal_ast::UnaryOp::Not, kind) => literal_truth(kind).map(|t| Bool(!t)),
        _ => None,
    }
}

fn fold_boolop(op: BoolOp, values: &[Expr]) -> Option<ExprKind> {
    // Only folded when every operand is a literal, so no side effects or
    // names can be skipped incorrectly.
    let truths: Option<Vec<bool>> = values.iter().map(|v| literal_truth(&v.kind)).collect();
    let truths = truths?;
    let index = match op {
        BoolOp::And => truths.iter().position(|t| !t).unwrap_or(values.len() - 1),
        BoolOp::Or => truths.iter().position(|t| *t).unwrap_or(values.len() - 1),
    };
    Some(values[index].kind.clone())
}

fn fold_compare(left: &Expr, op: CmpOp, right: &Expr) -> Option<ExprKind> {
    use ExprKind::*;
    let ordering = match (&left.kind, &right.kind) {
        (Int(a), Int(b)) => a.partial_cmp(b),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
        (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Str(a), Str(b)) => a.partial_cmp(b),
        _ => return None,
    }?;
    let result = match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::NotEq => ordering.is_ne(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::LtE => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::GtE => ordering.is_ge(),
        _ => return None,
    };
    Some(Bool(result))
}

fn literal_truth(kind: &ExprKind) -> Option<bool> {
    match kind {
        ExprKind::Bool(b) => Some(*b),
        ExprKind::Int(v) => Some(*v != 0),
        ExprKind::Float(v) => Some(*v != 0.0),
        ExprKind::Str(s) => Some(!s.is_empty()),
        ExprKind::NoneLiteral => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(e: Expr) -> ExprKind {
        let mut e = e;
        fold_expr(&mut e);
        e.kind
    }

    #[test]
    fn test_int_arithmetic() {
        let e = fold(Expr::bin(Expr::int(1), opal_ast::BinOp::Add, Expr::int(2)));
        assert!(matches!(e, ExprKind::Int(3)));
    }

    #[test]
    fn test_nested_folding() {
        // (2 * 3) + 4 -> 10
        let e = fold(Expr::bin(
            Expr::bin(Expr::int(2), opal_ast::BinOp::Mul, Expr::int(3)),
            opal_ast::BinOp::Add,
            Expr::int(4),
        ));
        assert!(matches!(e, ExprKind::Int(10)));
    }

    #[test]
    fn test_true_division_folds_to_float() {
        let e = fold(Expr::bin(Expr::int(7), opal_ast::BinOp::Div, Expr::int(2)));
        assert!(matches!(e, ExprKind::Float(f) if f == 3.5));
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let e = fold(Expr::bin(Expr::int(1), opal_ast::BinOp::Div, Expr::int(0)));
        assert!(matches!(e, ExprKind::BinOp { .. }));
    }

    #[test]
    fn test_overflow_not_folded() {
        let e = fold(Expr::bin(Expr::int(i64::MAX), opal_ast::BinOp::Add, Expr::int(1)));
        assert!(matches!(e, ExprKind::BinOp { .. }));
    }

    #[test]
    fn test_string_concat() {
        let e = fold(Expr::bin(Expr::str("ab"), opal_ast::BinOp::Add, Expr::str("cd")));
        assert!(matches!(e, ExprKind::Str(s) if s == "abcd"));
    }

    #[test]
    fn test_comparison() {
        let e = fold(Expr::cmp(Expr::int(2), CmpOp::Lt, Expr::int(3)));
        assert!(matches!(e, ExprKind::Bool(true)));
    }

    #[test]
    fn test_bool_op_literal_only() {
        let e = fold(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values: vec![Expr::int(0), Expr::int(7)],
            },
            0,
        ));
        assert!(matches!(e, ExprKind::Int(7)));

        // A name operand blocks folding.
        let e = fold(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values: vec![Expr::name("x"), Expr::int(7)],
            },
            0,
        ));
        assert!(matches!(e, ExprKind::BoolOp { .. }));
    }

    #[test]
    fn test_unary_not() {
        let e = fold(Expr::new(
            ExprKind::UnaryOp {
                op: opal_ast::UnaryOp::Not,
                operand: Box::new(Expr::int(0)),
            },
            0,
        ));
        assert!(matches!(e, ExprKind::Bool(true)));
    }
}
