//! Abstract syntax tree consumed by the Opal compiler.
//!
//! Parsing is an external concern; this crate only defines the node types
//! the code generator visits. Nodes carry a source line for diagnostics
//! and the code object's line table. The constructor helpers at the
//! bottom exist so embedders and tests can assemble trees directly.

/// A parsed module: the compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}

/// A statement with its source line (1-indexed).
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Expression evaluated for effect; result discarded.
    Expr(Expr),
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    AugAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },
    Return(Option<Expr>),
    Pass,
    Break,
    Continue,
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    FunctionDef {
        name: String,
        args: Arguments,
        body: Vec<Stmt>,
        decorators: Vec<Expr>,
    },
    ClassDef {
        name: String,
        bases: Vec<Expr>,
        body: Vec<Stmt>,
        decorators: Vec<Expr>,
    },
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Import {
        names: Vec<Alias>,
    },
    ImportFrom {
        module: String,
        names: Vec<Alias>,
        /// `from m import *`
        star: bool,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Delete(Vec<Expr>),
}

/// An expression with its source line.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Name(String),
    Int(i64),
    /// Integer literal too large for `i64`, kept as its decimal spelling.
    BigInt(String),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    NoneLiteral,
    Ellipsis,
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    Dict {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Lambda {
        args: Arguments,
        body: Box<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Starred(Box<Expr>),
    /// F-string: literal and formatted parts, concatenated in order.
    JoinedStr(Vec<Expr>),
    ListComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

/// Formal parameter list of a function or lambda.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    /// Positional-only parameters (before `/`).
    pub posonlyargs: Vec<Arg>,
    /// Regular positional-or-keyword parameters.
    pub args: Vec<Arg>,
    /// `*args` parameter.
    pub vararg: Option<Arg>,
    /// Keyword-only parameters (after `*`).
    pub kwonlyargs: Vec<Arg>,
    /// Defaults for keyword-only parameters, parallel to `kwonlyargs`.
    pub kw_defaults: Vec<Option<Expr>>,
    /// `**kwargs` parameter.
    pub kwarg: Option<Arg>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
}

/// A keyword argument at a call site; `arg: None` means `**expr`.
#[derive(Debug, Clone)]
pub struct Keyword {
    pub arg: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    /// Expected exception type expression; `None` for a bare `except:`.
    pub typ: Option<Expr>,
    /// `as` binding name.
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct WithItem {
    pub context: Expr,
    pub optional_vars: Option<Expr>,
}

/// One `for target in iter [if cond]*` clause of a comprehension.
#[derive(Debug, Clone)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

// =============================================================================
// Constructor helpers
// =============================================================================

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Expr {
        Expr { kind, line }
    }

    pub fn name(id: &str) -> Expr {
        Expr::new(ExprKind::Name(id.to_string()), 0)
    }

    pub fn int(v: i64) -> Expr {
        Expr::new(ExprKind::Int(v), 0)
    }

    pub fn float(v: f64) -> Expr {
        Expr::new(ExprKind::Float(v), 0)
    }

    pub fn str(v: &str) -> Expr {
        Expr::new(ExprKind::Str(v.to_string()), 0)
    }

    pub fn none() -> Expr {
        Expr::new(ExprKind::NoneLiteral, 0)
    }

    pub fn bin(left: Expr, op: BinOp, right: Expr) -> Expr {
        Expr::new(
            ExprKind::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            0,
        )
    }

    pub fn cmp(left: Expr, op: CmpOp, right: Expr) -> Expr {
        Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops: vec![op],
                comparators: vec![right],
            },
            0,
        )
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords: Vec::new(),
            },
            0,
        )
    }

    pub fn attr(value: Expr, attr: &str) -> Expr {
        Expr::new(
            ExprKind::Attribute {
                value: Box::new(value),
                attr: attr.to_string(),
            },
            0,
        )
    }

    pub fn subscript(value: Expr, index: Expr) -> Expr {
        Expr::new(
            ExprKind::Subscript {
                value: Box::new(value),
                index: Box::new(index),
            },
            0,
        )
    }

    /// Call a method on an object: `value.attr(args...)`.
    pub fn method(value: Expr, attr: &str, args: Vec<Expr>) -> Expr {
        Expr::call(Expr::attr(value, attr), args)
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, line: u32) -> Stmt {
        Stmt { kind, line }
    }

    pub fn expr(e: Expr) -> Stmt {
        Stmt::new(StmtKind::Expr(e), 0)
    }

    pub fn assign(target: &str, value: Expr) -> Stmt {
        Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::name(target)],
                value,
            },
            0,
        )
    }

    pub fn ret(value: Expr) -> Stmt {
        Stmt::new(StmtKind::Return(Some(value)), 0)
    }
}

impl Arguments {
    /// Positional parameters by name, no defaults.
    pub fn positional(names: &[&str]) -> Arguments {
        Arguments {
            args: names
                .iter()
                .map(|n| Arg {
                    name: n.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Module {
    pub fn new(body: Vec<Stmt>) -> Module {
        Module { body }
    }
}
