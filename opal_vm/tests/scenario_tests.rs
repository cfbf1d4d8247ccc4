//! End-to-end interpreter scenarios: compile an AST, run it, observe
//! globals and output.

use opal_ast::{
    Arg, Arguments, BinOp, CmpOp, Comprehension, ExceptHandler, Expr, ExprKind, Module, Stmt,
    StmtKind,
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

fn func_def(name: &str, args: Arguments, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::FunctionDef {
            name: name.to_string(),
            args,
            body,
            decorators: Vec::new(),
        },
        0,
    )
}

fn print_stmt(value: Expr) -> Stmt {
    Stmt::expr(Expr::call(Expr::name("print"), vec![value]))
}

fn assert_stmt(test: Expr) -> Stmt {
    Stmt::new(
        StmtKind::Assert {
            test,
            msg: None,
        },
        0,
    )
}

fn for_stmt(target: &str, iter: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::For {
            target: Expr::name(target),
            iter,
            body,
            orelse: Vec::new(),
        },
        0,
    )
}

/// S1: `x = 1 + 2; assert x == 3`.
#[test]
fn s1_constant_arithmetic() {
    let mut vm = run(vec![
        Stmt::assign("x", Expr::bin(Expr::int(1), BinOp::Add, Expr::int(2))),
        assert_stmt(Expr::cmp(Expr::name("x"), CmpOp::Eq, Expr::int(3))),
    ]);
    assert_eq!(vm.global_value("x").unwrap().as_i64(), Some(3));
    assert_eq!(vm.status(), opal_vm::VmStatus::Ok);
}

/// S2: `def f(a, b=10): return a + b` then `print(f(5))`.
#[test]
fn s2_default_arguments() {
    let args = Arguments {
        args: vec![
            Arg {
                name: "a".to_string(),
            },
            Arg {
                name: "b".to_string(),
            },
        ],
        defaults: vec![Expr::int(10)],
        ..Default::default()
    };
    let mut vm = run(vec![
        func_def(
            "f",
            args,
            vec![Stmt::ret(Expr::bin(
                Expr::name("a"),
                BinOp::Add,
                Expr::name("b"),
            ))],
        ),
        print_stmt(Expr::call(Expr::name("f"), vec![Expr::int(5)])),
    ]);
    assert_eq!(vm.take_output(), "15\n");
}

/// S3: closures capture the variable, not the value.
///
/// ```text
/// def make():
///     xs = []
///     for i in range(3):
///         xs.append(lambda: i)
///     return xs
/// print([g() for g in make()])
/// ```
#[test]
fn s3_closures_capture_cells() {
    let lambda = Expr::new(
        ExprKind::Lambda {
            args: Arguments::default(),
            body: Box::new(Expr::name("i")),
        },
        0,
    );
    let make = func_def(
        "make",
        Arguments::default(),
        vec![
            Stmt::assign("xs", Expr::new(ExprKind::List(Vec::new()), 0)),
            for_stmt(
                "i",
                Expr::call(Expr::name("range"), vec![Expr::int(3)]),
                vec![Stmt::expr(Expr::method(
                    Expr::name("xs"),
                    "append",
                    vec![lambda],
                ))],
            ),
            Stmt::ret(Expr::name("xs")),
        ],
    );
    let listcomp = Expr::new(
        ExprKind::ListComp {
            element: Box::new(Expr::call(Expr::name("g"), Vec::new())),
            generators: vec![Comprehension {
                target: Expr::name("g"),
                iter: Expr::call(Expr::name("make"), Vec::new()),
                ifs: Vec::new(),
            }],
        },
        0,
    );
    let mut vm = run(vec![make, print_stmt(listcomp)]);
    assert_eq!(vm.take_output(), "[2, 2, 2]\n");
}

/// S4: handler matching by type, skipping non-matching handlers.
#[test]
fn s4_exception_dispatch() {
    let raise = Stmt::new(
        StmtKind::Raise {
            exc: Some(Expr::call(
                Expr::name("ValueError"),
                vec![Expr::str("v")],
            )),
            cause: None,
        },
        0,
    );
    let try_stmt = Stmt::new(
        StmtKind::Try {
            body: vec![raise],
            handlers: vec![
                ExceptHandler {
                    typ: Some(Expr::name("TypeError")),
                    name: None,
                    body: vec![print_stmt(Expr::str("T"))],
                    line: 0,
                },
                ExceptHandler {
                    typ: Some(Expr::name("ValueError")),
                    name: Some("e".to_string()),
                    body: vec![print_stmt(Expr::name("e"))],
                    line: 0,
                },
            ],
            orelse: Vec::new(),
            finalbody: Vec::new(),
        },
        0,
    );
    let mut vm = run(vec![try_stmt]);
    assert_eq!(vm.take_output(), "v\n");
}

/// S5: generators suspend and resume across a for loop.
#[test]
fn s5_generator_iteration() {
    let yield_stmt = |v: i64| {
        Stmt::expr(Expr::new(
            ExprKind::Yield(Some(Box::new(Expr::int(v)))),
            0,
        ))
    };
    let mut vm = run(vec![
        func_def(
            "gen",
            Arguments::default(),
            vec![yield_stmt(1), yield_stmt(2)],
        ),
        for_stmt(
            "x",
            Expr::call(Expr::name("gen"), Vec::new()),
            vec![print_stmt(Expr::name("x"))],
        ),
    ]);
    assert_eq!(vm.take_output(), "1\n2\n");
}

/// S6: a large dict survives a forced collection.
#[test]
fn s6_dict_survives_collection() {
    let mut vm = run(vec![
        Stmt::assign(
            "d",
            Expr::new(
                ExprKind::Dict {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
                0,
            ),
        ),
        for_stmt(
            "i",
            Expr::call(Expr::name("range"), vec![Expr::int(1000)]),
            vec![Stmt::new(
                StmtKind::Assign {
                    targets: vec![Expr::subscript(Expr::name("d"), Expr::name("i"))],
                    value: Expr::name("i"),
                },
                0,
            )],
        ),
        assert_stmt(Expr::cmp(
            Expr::call(Expr::name("len"), vec![Expr::name("d")]),
            CmpOp::Eq,
            Expr::int(1000),
        )),
        assert_stmt(Expr::cmp(
            Expr::subscript(Expr::name("d"), Expr::int(500)),
            CmpOp::Eq,
            Expr::int(500),
        )),
    ]);

    vm.collect_garbage();

    let d = vm.global_value("d").unwrap();
    let d_ref = d.as_object().unwrap();
    let v = opal_runtime::protocol::dict_get(&mut vm, d_ref, &opal_core::Value::int(500))
        .unwrap()
        .unwrap();
    assert_eq!(v.as_i64(), Some(500));

    let len = opal_runtime::protocol::dict_len(&vm, d_ref);
    assert_eq!(len, 1000);
}

/// Arithmetic identities across the tower: `(a // b) * b + a % b == a`
/// and int/float equality.
#[test]
fn arithmetic_identities() {
    let mut body = Vec::new();
    for (a, b) in [(17, 5), (-17, 5), (17, -5), (-17, -5)] {
        let floordiv = Expr::bin(Expr::int(a), BinOp::FloorDiv, Expr::int(b));
        let remainder = Expr::bin(Expr::int(a), BinOp::Mod, Expr::int(b));
        let rebuilt = Expr::bin(
            Expr::bin(floordiv, BinOp::Mul, Expr::int(b)),
            BinOp::Add,
            remainder,
        );
        body.push(assert_stmt(Expr::cmp(rebuilt, CmpOp::Eq, Expr::int(a))));
    }
    body.push(assert_stmt(Expr::cmp(
        Expr::float(2.0),
        CmpOp::Eq,
        Expr::int(2),
    )));
    run(body);
}

/// Iterator protocol: exhausted iterators raise StopIteration from
/// `next` forever.
#[test]
fn iterator_exhaustion() {
    let make_iter = Stmt::assign(
        "it",
        Expr::call(
            Expr::name("iter"),
            vec![Expr::new(ExprKind::List(vec![Expr::int(7)]), 0)],
        ),
    );
    let next_of = |dst: &str| {
        Stmt::assign(
            dst,
            Expr::call(
                Expr::name("next"),
                vec![Expr::name("it"), Expr::str("done")],
            ),
        )
    };
    let mut vm = run(vec![
        make_iter,
        next_of("a"),
        next_of("b"),
        next_of("c"),
    ]);
    assert_eq!(vm.global_value("a").unwrap().as_i64(), Some(7));
    assert_eq!(
        vm.global_value("b").unwrap().as_str().map(|s| s.to_string()),
        Some("done".to_string())
    );
    assert_eq!(
        vm.global_value("c").unwrap().as_str().map(|s| s.to_string()),
        Some("done".to_string())
    );

    // Without a default, exhaustion surfaces as StopIteration.
    let mut vm = VirtualMachine::new();
    let module = Module::new(vec![
        Stmt::assign(
            "it",
            Expr::call(
                Expr::name("iter"),
                vec![Expr::new(ExprKind::List(Vec::new()), 0)],
            ),
        ),
        Stmt::expr(Expr::call(Expr::name("next"), vec![Expr::name("it")])),
    ]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("StopIteration"));
}

/// An uncaught exception becomes the program result with status
/// EXCEPTION.
#[test]
fn uncaught_exception_is_final_result() {
    let mut vm = VirtualMachine::new();
    let module = Module::new(vec![Stmt::new(
        StmtKind::Raise {
            exc: Some(Expr::call(
                Expr::name("RuntimeError"),
                vec![Expr::str("boom")],
            )),
            cause: None,
        },
        0,
    )]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("RuntimeError"));
    assert_eq!(vm.status(), opal_vm::VmStatus::Exception);
    assert!(err.to_string().contains("boom"));
}

/// Serialization round-trip: the deserialized program runs identically.
#[test]
fn serialized_program_runs_identically() {
    let module = Module::new(vec![
        func_def(
            "triple",
            Arguments::positional(&["n"]),
            vec![Stmt::ret(Expr::bin(
                Expr::name("n"),
                BinOp::Mul,
                Expr::int(3),
            ))],
        ),
        print_stmt(Expr::call(Expr::name("triple"), vec![Expr::int(14)])),
    ]);
    let code = opal_compiler::compile_module(&module, "<test>").unwrap();
    let program = opal_compiler::Program::new(code);

    let mut direct = VirtualMachine::new();
    direct.run_program(&program).unwrap();

    let bytes = opal_compiler::serialize(&program);
    let decoded = opal_compiler::deserialize(&bytes).unwrap();
    let mut roundtripped = VirtualMachine::new();
    roundtripped.run_program(&decoded).unwrap();

    assert_eq!(direct.take_output(), roundtripped.take_output());
}

/// Recursion depth limit surfaces as RecursionError.
#[test]
fn recursion_limit() {
    let mut vm = VirtualMachine::new();
    vm.set_recursion_limit(64);
    let module = Module::new(vec![
        func_def(
            "f",
            Arguments::default(),
            vec![Stmt::ret(Expr::call(Expr::name("f"), Vec::new()))],
        ),
        Stmt::expr(Expr::call(Expr::name("f"), Vec::new())),
    ]);
    let err = vm.run_module(&module, "<test>").unwrap_err();
    assert_eq!(err.exception_type(), Some("RecursionError"));
}

/// While/else, break and chained comparison all cooperate.
#[test]
fn while_loop_with_break() {
    let body = vec![
        Stmt::assign("n", Expr::int(0)),
        Stmt::new(
            StmtKind::While {
                test: Expr::cmp(Expr::name("n"), CmpOp::Lt, Expr::int(10)),
                body: vec![
                    Stmt::new(
                        StmtKind::If {
                            test: Expr::cmp(Expr::name("n"), CmpOp::Eq, Expr::int(4)),
                            body: vec![Stmt::new(StmtKind::Break, 0)],
                            orelse: Vec::new(),
                        },
                        0,
                    ),
                    Stmt::new(
                        StmtKind::AugAssign {
                            target: Expr::name("n"),
                            op: BinOp::Add,
                            value: Expr::int(1),
                        },
                        0,
                    ),
                ],
                orelse: vec![Stmt::assign("finished", Expr::new(ExprKind::Bool(true), 0))],
            },
            0,
        ),
    ];
    let mut vm = run(body);
    assert_eq!(vm.global_value("n").unwrap().as_i64(), Some(4));
    // break skips the else clause.
    assert!(vm.global_value("finished").is_none());
}
