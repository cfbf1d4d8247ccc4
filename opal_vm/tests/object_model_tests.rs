//! Object model behavior through full programs: attribute lookup along
//! the MRO, descriptors, closures, generators, context managers.

use opal_ast::{
    Arg, Arguments, BinOp, CmpOp, ExceptHandler, Expr, ExprKind, Module, Stmt, StmtKind, WithItem,
};
use opal_vm::VirtualMachine;

fn run(body: Vec<Stmt>) -> VirtualMachine {
    let mut vm = VirtualMachine::new();
    let module = Module::new(body);
    if let Err(e) = vm.run_module(&module, "<test>") {
        panic!("execution failed: {e}");
    }
    vm
}

fn method_def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::FunctionDef {
            name: name.to_string(),
            args: Arguments {
                args: params
                    .iter()
                    .map(|p| Arg {
                        name: p.to_string(),
                    })
                    .collect(),
                ..Default::default()
            },
            body,
            decorators: Vec::new(),
        },
        0,
    )
}

fn class_def(name: &str, bases: &[&str], body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::ClassDef {
            name: name.to_string(),
            bases: bases.iter().map(|b| Expr::name(b)).collect(),
            body,
            decorators: Vec::new(),
        },
        0,
    )
}

fn print_stmt(value: Expr) -> Stmt {
    Stmt::expr(Expr::call(Expr::name("print"), vec![value]))
}

/// `obj.x` resolves to the most-derived class in the MRO defining `x`.
#[test]
fn attribute_lookup_walks_mro() {
    let mut vm = run(vec![
        class_def("A", &[], vec![Stmt::assign("x", Expr::int(1))]),
        class_def("B", &["A"], vec![Stmt::new(StmtKind::Pass, 0)]),
        class_def("C", &["B"], vec![Stmt::assign("x", Expr::int(3))]),
        Stmt::assign("b", Expr::call(Expr::name("B"), Vec::new())),
        Stmt::assign("c", Expr::call(Expr::name("C"), Vec::new())),
        print_stmt(Expr::attr(Expr::name("b"), "x")),
        print_stmt(Expr::attr(Expr::name("c"), "x")),
    ]);
    assert_eq!(vm.take_output(), "1\n3\n");
}

/// Diamond inheritance follows C3 order.
#[test]
fn diamond_mro_prefers_left_base() {
    let mut vm = run(vec![
        class_def("A", &[], vec![Stmt::assign("who", Expr::str("A"))]),
        class_def("B", &["A"], vec![Stmt::assign("who", Expr::str("B"))]),
        class_def("C", &["A"], vec![Stmt::assign("who", Expr::str("C"))]),
        class_def("D", &["B", "C"], vec![Stmt::new(StmtKind::Pass, 0)]),
        Stmt::assign("d", Expr::call(Expr::name("D"), Vec::new())),
        print_stmt(Expr::attr(Expr::name("d"), "who")),
    ]);
    assert_eq!(vm.take_output(), "B\n");
}

/// Methods bind their receiver; `__init__` runs at construction.
#[test]
fn methods_and_init() {
    let init = method_def(
        "__init__",
        &["self", "n"],
        vec![Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::attr(Expr::name("self"), "n")],
                value: Expr::name("n"),
            },
            0,
        )],
    );
    let double = method_def(
        "double",
        &["self"],
        vec![Stmt::ret(Expr::bin(
            Expr::attr(Expr::name("self"), "n"),
            BinOp::Mul,
            Expr::int(2),
        ))],
    );
    let mut vm = run(vec![
        class_def("Box", &[], vec![init, double]),
        Stmt::assign("b", Expr::call(Expr::name("Box"), vec![Expr::int(21)])),
        print_stmt(Expr::method(Expr::name("b"), "double", Vec::new())),
    ]);
    assert_eq!(vm.take_output(), "42\n");
}

/// Instance attributes shadow non-data class attributes (functions),
/// while data descriptors win over the instance dict.
#[test]
fn descriptor_precedence() {
    // class Desc with __get__/__set__ is a data descriptor.
    let getter = method_def(
        "__get__",
        &["self", "obj", "owner"],
        vec![Stmt::ret(Expr::int(42))],
    );
    let setter = method_def(
        "__set__",
        &["self", "obj", "value"],
        vec![Stmt::new(StmtKind::Pass, 0)],
    );
    let mut vm = run(vec![
        class_def("Desc", &[], vec![getter, setter]),
        class_def(
            "C",
            &[],
            vec![
                Stmt::assign("x", Expr::call(Expr::name("Desc"), Vec::new())),
                method_def("m", &["self"], vec![Stmt::ret(Expr::str("method"))]),
            ],
        ),
        Stmt::assign("c", Expr::call(Expr::name("C"), Vec::new())),
        // Assignment routes through Desc.__set__ and is swallowed.
        Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::attr(Expr::name("c"), "x")],
                value: Expr::int(99),
            },
            0,
        ),
        print_stmt(Expr::attr(Expr::name("c"), "x")),
        // A plain instance attribute shadows the non-data method.
        Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::attr(Expr::name("c"), "m")],
                value: Expr::str("shadowed"),
            },
            0,
        ),
        print_stmt(Expr::attr(Expr::name("c"), "m")),
    ]);
    assert_eq!(vm.take_output(), "42\nshadowed\n");
}

/// A nested function observes mutations to the enclosing variable made
/// after its creation.
#[test]
fn closure_sees_later_mutation() {
    let inner = method_def("get", &[], vec![Stmt::ret(Expr::name("x"))]);
    let outer = Stmt::new(
        StmtKind::FunctionDef {
            name: "outer".to_string(),
            args: Arguments::default(),
            body: vec![
                Stmt::assign("x", Expr::int(1)),
                inner,
                Stmt::assign("x", Expr::int(2)),
                Stmt::ret(Expr::call(Expr::name("get"), Vec::new())),
            ],
            decorators: Vec::new(),
        },
        0,
    );
    let mut vm = run(vec![
        outer,
        print_stmt(Expr::call(Expr::name("outer"), Vec::new())),
    ]);
    assert_eq!(vm.take_output(), "2\n");
}

/// `nonlocal` writes through the cell into the defining scope.
#[test]
fn nonlocal_mutates_enclosing() {
    let bump = Stmt::new(
        StmtKind::FunctionDef {
            name: "bump".to_string(),
            args: Arguments::default(),
            body: vec![
                Stmt::new(StmtKind::Nonlocal(vec!["count".to_string()]), 0),
                Stmt::new(
                    StmtKind::AugAssign {
                        target: Expr::name("count"),
                        op: BinOp::Add,
                        value: Expr::int(1),
                    },
                    0,
                ),
            ],
            decorators: Vec::new(),
        },
        0,
    );
    let counter = Stmt::new(
        StmtKind::FunctionDef {
            name: "counter".to_string(),
            args: Arguments::default(),
            body: vec![
                Stmt::assign("count", Expr::int(0)),
                bump,
                Stmt::expr(Expr::call(Expr::name("bump"), Vec::new())),
                Stmt::expr(Expr::call(Expr::name("bump"), Vec::new())),
                Stmt::ret(Expr::name("count")),
            ],
            decorators: Vec::new(),
        },
        0,
    );
    let mut vm = run(vec![
        counter,
        print_stmt(Expr::call(Expr::name("counter"), Vec::new())),
    ]);
    assert_eq!(vm.take_output(), "2\n");
}

/// `with` invokes `__exit__` on both exit paths; a truthy result
/// swallows the exception.
#[test]
fn with_statement_swallow() {
    let enter = method_def("__enter__", &["self"], vec![Stmt::ret(Expr::name("self"))]);
    let exit = method_def(
        "__exit__",
        &["self", "t", "v", "tb"],
        vec![
            Stmt::new(
                StmtKind::Assign {
                    targets: vec![Expr::attr(Expr::name("self"), "closed")],
                    value: Expr::new(ExprKind::Bool(true), 0),
                },
                0,
            ),
            Stmt::ret(Expr::new(ExprKind::Bool(true), 0)),
        ],
    );
    let with_stmt = Stmt::new(
        StmtKind::With {
            items: vec![WithItem {
                context: Expr::name("cm"),
                optional_vars: Some(Expr::name("m")),
            }],
            body: vec![Stmt::new(
                StmtKind::Raise {
                    exc: Some(Expr::call(
                        Expr::name("ValueError"),
                        vec![Expr::str("suppressed")],
                    )),
                    cause: None,
                },
                0,
            )],
        },
        0,
    );
    let mut vm = run(vec![
        class_def("CM", &[], vec![enter, exit]),
        Stmt::assign("cm", Expr::call(Expr::name("CM"), Vec::new())),
        with_stmt,
        print_stmt(Expr::attr(Expr::name("cm"), "closed")),
    ]);
    assert_eq!(vm.take_output(), "True\n");
}

/// try/finally runs the finally body on the exceptional path and
/// re-raises.
#[test]
fn finally_runs_then_reraises() {
    let mut vm = VirtualMachine::new();
    let module = Module::new(vec![Stmt::new(
        StmtKind::Try {
            body: vec![Stmt::new(
                StmtKind::Raise {
                    exc: Some(Expr::call(
                        Expr::name("ValueError"),
                        vec![Expr::str("escapes")],
                    )),
                    cause: None,
                },
                0,
            )],
            handlers: Vec::new(),
            orelse: Vec::new(),
            finalbody: vec![print_stmt(Expr::str("cleanup"))],
        },
        0,
    )]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("ValueError"));
    assert_eq!(vm.take_output(), "cleanup\n");
}

/// Exceptions propagate through frames to the innermost matching
/// handler up the call chain.
#[test]
fn exception_crosses_frames() {
    let thrower = method_def(
        "boom",
        &[],
        vec![Stmt::new(
            StmtKind::Raise {
                exc: Some(Expr::call(
                    Expr::name("KeyError"),
                    vec![Expr::str("k")],
                )),
                cause: None,
            },
            0,
        )],
    );
    let try_stmt = Stmt::new(
        StmtKind::Try {
            body: vec![Stmt::expr(Expr::call(Expr::name("boom"), Vec::new()))],
            handlers: vec![ExceptHandler {
                // LookupError catches its subclass KeyError by MRO.
                typ: Some(Expr::name("LookupError")),
                name: None,
                body: vec![print_stmt(Expr::str("caught"))],
                line: 0,
            }],
            orelse: Vec::new(),
            finalbody: Vec::new(),
        },
        0,
    );
    let mut vm = run(vec![thrower, try_stmt]);
    assert_eq!(vm.take_output(), "caught\n");
}

/// Generator close() injects GeneratorExit; swallowing it and yielding
/// again is a RuntimeError.
#[test]
fn generator_close_protocol() {
    // def well_behaved(): yield 1; yield 2
    let gen = method_def(
        "g",
        &[],
        vec![
            Stmt::expr(Expr::new(ExprKind::Yield(Some(Box::new(Expr::int(1)))), 0)),
            Stmt::expr(Expr::new(ExprKind::Yield(Some(Box::new(Expr::int(2)))), 0)),
        ],
    );
    let mut vm = run(vec![
        gen,
        Stmt::assign("it", Expr::call(Expr::name("g"), Vec::new())),
        Stmt::assign("first", Expr::call(Expr::name("next"), vec![Expr::name("it")])),
        Stmt::expr(Expr::method(Expr::name("it"), "close", Vec::new())),
    ]);
    assert_eq!(vm.global_value("first").unwrap().as_i64(), Some(1));

    // A generator that swallows GeneratorExit and keeps yielding.
    let swallow = method_def(
        "g",
        &[],
        vec![Stmt::new(
            StmtKind::While {
                test: Expr::new(ExprKind::Bool(true), 0),
                body: vec![Stmt::new(
                    StmtKind::Try {
                        body: vec![Stmt::expr(Expr::new(
                            ExprKind::Yield(Some(Box::new(Expr::int(1)))),
                            0,
                        ))],
                        handlers: vec![ExceptHandler {
                            typ: Some(Expr::name("GeneratorExit")),
                            name: None,
                            body: vec![Stmt::new(StmtKind::Pass, 0)],
                            line: 0,
                        }],
                        orelse: Vec::new(),
                        finalbody: Vec::new(),
                    },
                    0,
                )],
                orelse: Vec::new(),
            },
            0,
        )],
    );
    let mut vm = VirtualMachine::new();
    let module = Module::new(vec![
        swallow,
        Stmt::assign("it", Expr::call(Expr::name("g"), Vec::new())),
        Stmt::expr(Expr::call(Expr::name("next"), vec![Expr::name("it")])),
        Stmt::expr(Expr::method(Expr::name("it"), "close", Vec::new())),
    ]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("RuntimeError"));
}

/// User-defined `__lt__` drives `list.sort`, and rich comparison tries
/// the reflected operand.
#[test]
fn user_comparison_and_sort() {
    let init = method_def(
        "__init__",
        &["self", "rank"],
        vec![Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::attr(Expr::name("self"), "rank")],
                value: Expr::name("rank"),
            },
            0,
        )],
    );
    let lt = method_def(
        "__lt__",
        &["self", "other"],
        vec![Stmt::ret(Expr::cmp(
            Expr::attr(Expr::name("self"), "rank"),
            CmpOp::Lt,
            Expr::attr(Expr::name("other"), "rank"),
        ))],
    );
    let make = |rank: i64| Expr::call(Expr::name("Card"), vec![Expr::int(rank)]);
    let mut vm = run(vec![
        class_def("Card", &[], vec![init, lt]),
        Stmt::assign(
            "xs",
            Expr::new(ExprKind::List(vec![make(3), make(1), make(2)]), 0),
        ),
        Stmt::expr(Expr::method(Expr::name("xs"), "sort", Vec::new())),
        print_stmt(Expr::attr(
            Expr::subscript(Expr::name("xs"), Expr::int(0)),
            "rank",
        )),
        print_stmt(Expr::attr(
            Expr::subscript(Expr::name("xs"), Expr::int(2)),
            "rank",
        )),
    ]);
    assert_eq!(vm.take_output(), "1\n3\n");
}

/// dict.items() yields (key, value) tuples in insertion order.
#[test]
fn dict_items_view() {
    let for_items = Stmt::new(
        StmtKind::For {
            target: Expr::new(
                ExprKind::Tuple(vec![Expr::name("k"), Expr::name("v")]),
                0,
            ),
            iter: Expr::method(Expr::name("d"), "items", Vec::new()),
            body: vec![print_stmt(Expr::name("k")), print_stmt(Expr::name("v"))],
            orelse: Vec::new(),
        },
        0,
    );
    let mut vm = run(vec![
        Stmt::assign(
            "d",
            Expr::new(
                ExprKind::Dict {
                    keys: vec![Expr::str("a"), Expr::str("b")],
                    values: vec![Expr::int(1), Expr::int(2)],
                },
                0,
            ),
        ),
        for_items,
    ]);
    assert_eq!(vm.take_output(), "a\n1\nb\n2\n");
}

/// Negative indices wrap; out-of-range subscripts raise IndexError.
#[test]
fn list_indexing_rules() {
    let mut vm = run(vec![
        Stmt::assign(
            "xs",
            Expr::new(
                ExprKind::List(vec![Expr::int(10), Expr::int(20), Expr::int(30)]),
                0,
            ),
        ),
        Stmt::assign("last", Expr::subscript(Expr::name("xs"), Expr::int(-1))),
    ]);
    assert_eq!(vm.global_value("last").unwrap().as_i64(), Some(30));

    let mut vm = VirtualMachine::new();
    let module = Module::new(vec![
        Stmt::assign("xs", Expr::new(ExprKind::List(vec![Expr::int(1)]), 0)),
        Stmt::expr(Expr::subscript(Expr::name("xs"), Expr::int(5))),
    ]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("IndexError"));
}

/// Slicing a list produces a fresh list.
#[test]
fn list_slicing() {
    let slice = Expr::new(
        ExprKind::Slice {
            lower: Some(Box::new(Expr::int(1))),
            upper: Some(Box::new(Expr::int(3))),
            step: None,
        },
        0,
    );
    let mut vm = run(vec![
        Stmt::assign(
            "xs",
            Expr::new(
                ExprKind::List(vec![
                    Expr::int(0),
                    Expr::int(1),
                    Expr::int(2),
                    Expr::int(3),
                ]),
                0,
            ),
        ),
        Stmt::assign("ys", Expr::subscript(Expr::name("xs"), slice)),
        print_stmt(Expr::name("ys")),
    ]);
    assert_eq!(vm.take_output(), "[1, 2]\n");
}
