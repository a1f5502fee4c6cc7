// Integration tests for the Rill engine.
//
// These tests drive the whole pipeline - expression tree -> code generator
// -> program image -> VM - and check the observable results. Tests cover:
// - Closures and shared upvalue cells
// - Sequences (generators) and the enumerator protocol
// - Prototype-based objects and meta-methods
// - Tail calls, try/catch/finally, and error propagation
// - The cooperative async scheduler
// - Bytecode round-trips and pool accounting

use rill::ast::{BinaryOp, Expr, ExprKind, FunctionDecl, Stmt, StmtKind, SwitchCase, UnaryOp};
use rill::bytecode;
use rill::compiler::Compiler;
use rill::errors::{ErrorKind, ScriptError, SourceLocation};
use rill::scheduler::TaskWaker;
use rill::value::Value;
use rill::vm::VM;
use std::sync::{Arc, Mutex};

// --- tree-building helpers (the parser is external to the engine) ---

fn loc() -> SourceLocation {
    SourceLocation::new(1, 1)
}

fn expr(kind: ExprKind) -> Expr {
    Expr::new(kind, loc())
}

fn n(value: f64) -> Expr {
    expr(ExprKind::Number(value))
}

fn s(value: &str) -> Expr {
    expr(ExprKind::Str(value.to_string()))
}

fn ident(name: &str) -> Expr {
    expr(ExprKind::Identifier(name.to_string()))
}

fn bin(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    expr(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) })
}

fn un(op: UnaryOp, operand: Expr) -> Expr {
    expr(ExprKind::Unary { op, operand: Box::new(operand) })
}

fn tern(condition: Expr, then_value: Expr, else_value: Expr) -> Expr {
    expr(ExprKind::Ternary {
        condition: Box::new(condition),
        then_value: Box::new(then_value),
        else_value: Box::new(else_value),
    })
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call { callee: Box::new(callee), args })
}

fn mcall(receiver: Expr, method: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::MethodCall {
        receiver: Box::new(receiver),
        method: method.to_string(),
        args,
    })
}

fn field(object: Expr, name: &str) -> Expr {
    expr(ExprKind::Field { object: Box::new(object), name: name.to_string() })
}

fn index(object: Expr, at: Expr) -> Expr {
    expr(ExprKind::Index { object: Box::new(object), index: Box::new(at) })
}

fn array(elements: Vec<Expr>) -> Expr {
    expr(ExprKind::ArrayLiteral(elements))
}

fn object(fields: Vec<(&str, Expr)>) -> Expr {
    expr(ExprKind::ObjectLiteral(
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    ))
}

fn lambda(params: Vec<&str>, body: Vec<Stmt>) -> Expr {
    expr(ExprKind::Function(FunctionDecl {
        name: None,
        params: params.into_iter().map(str::to_string).collect(),
        var_arg: false,
        body,
        is_sequence: false,
    }))
}

fn arrow(params: Vec<&str>, value: Expr) -> Expr {
    lambda(params, vec![ret(value)])
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt::new(kind, loc())
}

fn expr_stmt(e: Expr) -> Stmt {
    stmt(StmtKind::Expr(e))
}

fn var(name: &str, value: Expr) -> Stmt {
    stmt(StmtKind::VarDecl { name: name.to_string(), value: Some(value) })
}

fn assign(target: Expr, value: Expr) -> Stmt {
    stmt(StmtKind::Assign { target, value })
}

fn ret(value: Expr) -> Stmt {
    stmt(StmtKind::Return(Some(value)))
}

fn func_decl(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::FuncDecl(FunctionDecl {
        name: Some(name.to_string()),
        params: params.into_iter().map(str::to_string).collect(),
        var_arg: false,
        body,
        is_sequence: false,
    }))
}

fn seq_decl(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::FuncDecl(FunctionDecl {
        name: Some(name.to_string()),
        params: params.into_iter().map(str::to_string).collect(),
        var_arg: false,
        body,
        is_sequence: true,
    }))
}

fn yield_stmt(value: Expr) -> Stmt {
    expr_stmt(expr(ExprKind::Yield(Box::new(value))))
}

fn run(stmts: Vec<Stmt>) -> Value {
    let image = Compiler::new().compile(stmts).expect("program compiles");
    VM::new().execute(image).expect("program executes")
}

fn run_in(vm: &mut VM, stmts: Vec<Stmt>) -> Result<Value, ScriptError> {
    let image = Compiler::new().compile(stmts)?;
    vm.execute(image)
}

fn array_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(arr) => arr.lock().unwrap().elements.clone(),
        other => panic!("expected an array result, got {:?}", other),
    }
}

// --- values and operators ---

#[test]
fn test_free_identifier_resolves_to_global() {
    let mut vm = VM::new();
    vm.set_global("x", Value::Number(7.0)).unwrap();
    let result = run_in(&mut vm, vec![ret(ident("x"))]).unwrap();
    assert_eq!(result, Value::Number(7.0));
}

#[test]
fn test_undefined_equality() {
    let result = run(vec![ret(array(vec![
        bin(BinaryOp::Eq, expr(ExprKind::Undefined), expr(ExprKind::Undefined)),
        bin(BinaryOp::Eq, expr(ExprKind::Undefined), expr(ExprKind::Null)),
        bin(BinaryOp::Eq, expr(ExprKind::Undefined), n(0.0)),
    ]))]);
    assert_eq!(
        array_values(&result),
        vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)]
    );
}

#[test]
fn test_string_concatenation_coerces_numbers() {
    let mut vm = VM::new();
    vm.set_global("x", Value::Number(1.0)).unwrap();
    // "a" + x and x + ".5" - not foldable, exercises the VM's Add
    let result = run_in(
        &mut vm,
        vec![ret(array(vec![
            bin(BinaryOp::Add, s("a"), ident("x")),
            bin(BinaryOp::Add, ident("x"), s("b")),
            bin(BinaryOp::Add, n(2.5), s("!")),
        ]))],
    )
    .unwrap();
    let values = array_values(&result);
    assert_eq!(values[0], Value::str_ref("a1"));
    assert_eq!(values[1], Value::str_ref("1b"));
    assert_eq!(values[2], Value::str_ref("2.5!"));
}

#[test]
fn test_bitwise_coerces_through_int32() {
    let stmts = vec![
        var("a", n(5.0)),
        var("b", n(-8.0)),
        ret(array(vec![
            bin(BinaryOp::BitAnd, ident("a"), n(3.0)),
            bin(BinaryOp::BitOr, ident("a"), n(3.0)),
            bin(BinaryOp::BitXor, ident("a"), n(3.0)),
            bin(BinaryOp::BitLShift, n(1.0), n(4.0)),
            bin(BinaryOp::BitRShift, ident("b"), n(1.0)),
            un(UnaryOp::BitNot, ident("a")),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![
            Value::Number(1.0),
            Value::Number(7.0),
            Value::Number(6.0),
            Value::Number(16.0),
            Value::Number(-4.0),
            Value::Number(-6.0),
        ]
    );
}

#[test]
fn test_short_circuit_keeps_deciding_value() {
    let mut vm = VM::new();
    vm.set_global("nothing", Value::Null).unwrap();
    let result = run_in(
        &mut vm,
        vec![ret(array(vec![
            bin(BinaryOp::Or, ident("nothing"), s("fallback")),
            bin(BinaryOp::And, ident("nothing"), s("unreached")),
        ]))],
    )
    .unwrap();
    let values = array_values(&result);
    assert_eq!(values[0], Value::str_ref("fallback"));
    assert_eq!(values[1], Value::Null);
}

#[test]
fn test_membership_in_and_not_in() {
    let stmts = vec![
        var("o", object(vec![("a", n(1.0))])),
        var("xs", array(vec![n(1.0), n(2.0)])),
        ret(array(vec![
            bin(BinaryOp::In, s("a"), ident("o")),
            bin(BinaryOp::In, s("b"), ident("o")),
            bin(BinaryOp::In, n(2.0), ident("xs")),
            bin(BinaryOp::NotIn, n(3.0), ident("xs")),
            bin(BinaryOp::In, s("ell"), s("hello")),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(true),
        ]
    );
}

#[test]
fn test_array_write_past_end_extends() {
    let stmts = vec![
        var("xs", array(vec![])),
        assign(index(ident("xs"), n(3.0)), n(9.0)),
        ret(array(vec![
            field(ident("xs"), "length"),
            index(ident("xs"), n(0.0)),
            index(ident("xs"), n(3.0)),
            index(ident("xs"), n(10.0)),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![
            Value::Number(4.0),
            Value::Undefined,
            Value::Number(9.0),
            Value::Undefined,
        ]
    );
}

#[test]
fn test_string_indexing_and_length() {
    let stmts = vec![
        var("t", s("abc")),
        ret(array(vec![
            index(ident("t"), n(1.0)),
            index(ident("t"), n(9.0)),
            field(ident("t"), "length"),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::str_ref("b"), Value::Undefined, Value::Number(3.0)]
    );
}

#[test]
fn test_slice_expression() {
    let stmts = vec![
        var("xs", array(vec![n(0.0), n(1.0), n(2.0), n(3.0), n(4.0)])),
        ret(expr(ExprKind::Slice {
            object: Box::new(ident("xs")),
            start: Some(Box::new(n(1.0))),
            end: Some(Box::new(n(4.0))),
            step: None,
        })),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
    );
}

// --- closures and upvalue cells ---

#[test]
fn test_closures_share_upvalue_cells() {
    // var x = 0; set(5) through one closure is observed by the other
    let stmts = vec![
        var("x", n(0.0)),
        var("set", lambda(vec!["v"], vec![assign(ident("x"), ident("v"))])),
        var("get", arrow(vec![], ident("x"))),
        expr_stmt(call(ident("set"), vec![n(5.0)])),
        ret(call(ident("get"), vec![])),
    ];
    assert_eq!(run(stmts), Value::Number(5.0));
}

#[test]
fn test_for_loop_closures_share_one_cell() {
    // var fs=[]; for (var i=0; i<3; i=i+1) { fs.add(fun()->i); }
    // Every closure sees the final value of the single shared cell.
    let stmts = vec![
        var("fs", array(vec![])),
        stmt(StmtKind::For {
            init: Some(Box::new(var("i", n(0.0)))),
            condition: Some(bin(BinaryOp::Lt, ident("i"), n(3.0))),
            update: Some(Box::new(assign(
                ident("i"),
                bin(BinaryOp::Add, ident("i"), n(1.0)),
            ))),
            body: vec![expr_stmt(mcall(
                ident("fs"),
                "add",
                vec![arrow(vec![], ident("i"))],
            ))],
        }),
        ret(array(vec![
            call(index(ident("fs"), n(0.0)), vec![]),
            call(index(ident("fs"), n(1.0)), vec![]),
            call(index(ident("fs"), n(2.0)), vec![]),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(3.0), Value::Number(3.0), Value::Number(3.0)]
    );
}

#[test]
fn test_foreach_closures_get_fresh_bindings() {
    // foreach gives the loop variable a fresh binding per iteration, so the
    // captured values differ.
    let stmts = vec![
        var("fs", array(vec![])),
        var("src", array(vec![n(10.0), n(20.0), n(30.0)])),
        stmt(StmtKind::Foreach {
            name: "v".to_string(),
            iterable: ident("src"),
            body: vec![expr_stmt(mcall(
                ident("fs"),
                "add",
                vec![arrow(vec![], ident("v"))],
            ))],
        }),
        ret(array(vec![
            call(index(ident("fs"), n(0.0)), vec![]),
            call(index(ident("fs"), n(1.0)), vec![]),
            call(index(ident("fs"), n(2.0)), vec![]),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(10.0), Value::Number(20.0), Value::Number(30.0)]
    );
}

#[test]
fn test_transitive_capture_shares_identity() {
    // The innermost function mutates a variable two functions up; the
    // owner observes the write.
    let stmts = vec![
        var("x", n(1.0)),
        var(
            "mk",
            lambda(
                vec![],
                vec![ret(lambda(vec![], vec![assign(ident("x"), n(42.0))]))],
            ),
        ),
        expr_stmt(call(call(ident("mk"), vec![]), vec![])),
        ret(ident("x")),
    ];
    assert_eq!(run(stmts), Value::Number(42.0));
}

// --- functions, calls, varargs, tail calls ---

#[test]
fn test_missing_arguments_read_as_undefined() {
    let stmts = vec![
        func_decl("f", vec!["a", "b"], vec![ret(bin(BinaryOp::Eq, ident("b"), expr(ExprKind::Undefined)))]),
        ret(call(ident("f"), vec![n(1.0)])),
    ];
    assert_eq!(run(stmts), Value::Bool(true));
}

#[test]
fn test_varargs_collects_trailing_arguments() {
    let decl = FunctionDecl {
        name: Some("f".to_string()),
        params: vec!["first".to_string(), "rest".to_string()],
        var_arg: true,
        body: vec![ret(array(vec![
            ident("first"),
            field(ident("rest"), "length"),
            index(ident("rest"), n(0.0)),
            index(ident("rest"), n(1.0)),
        ]))],
        is_sequence: false,
    };
    let stmts = vec![
        stmt(StmtKind::FuncDecl(decl)),
        ret(call(ident("f"), vec![n(1.0), n(2.0), n(3.0)])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]
    );
}

#[test]
fn test_tail_recursion_completes_without_stack_growth() {
    // fun f(n, acc) -> n == 0 ? acc : f(n - 1, acc + n), n = 100000, with a
    // call-depth limit far below the iteration count
    let body = vec![ret(tern(
        bin(BinaryOp::Eq, ident("n"), n(0.0)),
        ident("acc"),
        call(
            ident("f"),
            vec![
                bin(BinaryOp::Sub, ident("n"), n(1.0)),
                bin(BinaryOp::Add, ident("acc"), ident("n")),
            ],
        ),
    ))];
    let stmts = vec![
        func_decl("f", vec!["n", "acc"], body),
        ret(call(ident("f"), vec![n(100000.0), n(0.0)])),
    ];
    let image = Compiler::new().compile(stmts).unwrap();
    let mut vm = VM::new();
    vm.set_max_call_depth(64);
    let result = vm.execute(image).unwrap();
    assert_eq!(result, Value::Number(5000050000.0));
}

#[test]
fn test_instance_call_passes_receiver_first() {
    let stmts = vec![
        var(
            "counter",
            object(vec![
                ("total", n(0.0)),
                (
                    "bump",
                    lambda(
                        vec!["self", "amount"],
                        vec![
                            assign(
                                field(ident("self"), "total"),
                                bin(BinaryOp::Add, field(ident("self"), "total"), ident("amount")),
                            ),
                            ret(field(ident("self"), "total")),
                        ],
                    ),
                ),
            ]),
        ),
        expr_stmt(mcall(ident("counter"), "bump", vec![n(5.0)])),
        expr_stmt(mcall(ident("counter"), "bump", vec![n(7.0)])),
        ret(field(ident("counter"), "total")),
    ];
    assert_eq!(run(stmts), Value::Number(12.0));
}

// --- prototype objects and meta-methods ---

#[test]
fn test_prototype_lookup_and_shadowing() {
    // var a = {x:1}; var b = {}; b.setPrototype(a); b.x reads through the
    // chain; writing b.x shadows without touching a.x
    let stmts = vec![
        var("a", object(vec![("x", n(1.0))])),
        var("b", object(vec![])),
        expr_stmt(mcall(ident("b"), "setPrototype", vec![ident("a")])),
        var("before", field(ident("b"), "x")),
        assign(field(ident("b"), "x"), n(2.0)),
        ret(array(vec![
            ident("before"),
            field(ident("b"), "x"),
            field(ident("a"), "x"),
        ])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(1.0)]
    );
}

#[test]
fn test_missing_field_reads_as_undefined() {
    let stmts = vec![
        var("o", object(vec![])),
        ret(bin(BinaryOp::Eq, field(ident("o"), "ghost"), expr(ExprKind::Undefined))),
    ];
    assert_eq!(run(stmts), Value::Bool(true));
}

#[test]
fn test_meta_method_add_dispatches_through_prototype() {
    let proto = object(vec![(
        "__add",
        lambda(
            vec!["a", "b"],
            vec![ret(bin(BinaryOp::Add, field(ident("a"), "v"), field(ident("b"), "v")))],
        ),
    )]);
    let stmts = vec![
        var("proto", proto),
        var("p", object(vec![("v", n(1.0))])),
        var("q", object(vec![("v", n(2.0))])),
        expr_stmt(mcall(ident("p"), "setPrototype", vec![ident("proto")])),
        expr_stmt(mcall(ident("q"), "setPrototype", vec![ident("proto")])),
        ret(bin(BinaryOp::Add, ident("p"), ident("q"))),
    ];
    assert_eq!(run(stmts), Value::Number(3.0));
}

#[test]
fn test_meta_method_eq_overrides_identity() {
    let proto = object(vec![(
        "__eq",
        lambda(
            vec!["a", "b"],
            vec![ret(bin(BinaryOp::Eq, field(ident("a"), "v"), field(ident("b"), "v")))],
        ),
    )]);
    let stmts = vec![
        var("proto", proto),
        var("p", object(vec![("v", n(1.0))])),
        var("q", object(vec![("v", n(1.0))])),
        expr_stmt(mcall(ident("p"), "setPrototype", vec![ident("proto")])),
        ret(bin(BinaryOp::Eq, ident("p"), ident("q"))),
    ];
    assert_eq!(run(stmts), Value::Bool(true));
}

#[test]
fn test_meta_call_makes_objects_callable() {
    let stmts = vec![
        var(
            "adder",
            object(vec![
                ("base", n(10.0)),
                (
                    "__call",
                    lambda(
                        vec!["self", "amount"],
                        vec![ret(bin(
                            BinaryOp::Add,
                            field(ident("self"), "base"),
                            ident("amount"),
                        ))],
                    ),
                ),
            ]),
        ),
        ret(call(ident("adder"), vec![n(5.0)])),
    ];
    assert_eq!(run(stmts), Value::Number(15.0));
}

#[test]
fn test_ordering_incompatible_tags_is_type_error() {
    let image = Compiler::new()
        .compile(vec![ret(bin(BinaryOp::Lt, s("a"), n(1.0)))])
        .unwrap();
    let err = VM::new().execute(image).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
}

#[test]
fn test_locked_object_rejects_new_keys() {
    let stmts = vec![
        var("o", object(vec![("a", n(1.0))])),
        expr_stmt(mcall(ident("o"), "lock", vec![])),
        var("caught", s("")),
        stmt(StmtKind::TryCatch {
            try_body: vec![assign(field(ident("o"), "b"), n(2.0))],
            catch_name: Some("e".to_string()),
            catch_body: Some(vec![assign(ident("caught"), ident("e"))]),
            finally_body: None,
        }),
        // Updating an existing key still works
        assign(field(ident("o"), "a"), n(3.0)),
        ret(array(vec![ident("caught"), field(ident("o"), "a")])),
    ];
    let values = array_values(&run(stmts));
    assert_eq!(values[0], Value::str_ref("cannot add a key to a locked object"));
    assert_eq!(values[1], Value::Number(3.0));
}

// --- control flow ---

#[test]
fn test_do_while_with_continue_and_break() {
    let stmts = vec![
        var("i", n(0.0)),
        var("log", array(vec![])),
        stmt(StmtKind::DoWhile {
            body: vec![
                assign(ident("i"), bin(BinaryOp::Add, ident("i"), n(1.0))),
                stmt(StmtKind::If {
                    condition: bin(BinaryOp::Eq, ident("i"), n(2.0)),
                    then_branch: vec![stmt(StmtKind::Continue)],
                    else_branch: None,
                }),
                stmt(StmtKind::If {
                    condition: bin(BinaryOp::Gt, ident("i"), n(4.0)),
                    then_branch: vec![stmt(StmtKind::Break)],
                    else_branch: None,
                }),
                expr_stmt(mcall(ident("log"), "add", vec![ident("i")])),
            ],
            condition: bin(BinaryOp::Lt, ident("i"), n(10.0)),
        }),
        ret(ident("log")),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(1.0), Value::Number(3.0), Value::Number(4.0)]
    );
}

fn switch_program(cases: Vec<SwitchCase>, subject: f64) -> Vec<Stmt> {
    vec![
        func_decl(
            "pick",
            vec!["x"],
            vec![
                stmt(StmtKind::Switch {
                    subject: ident("x"),
                    cases,
                    default: Some(vec![ret(s("other"))]),
                }),
                ret(s("unreachable")),
            ],
        ),
        ret(call(ident("pick"), vec![n(subject)])),
    ]
}

#[test]
fn test_dense_switch_dispatch() {
    let cases = || {
        vec![
            SwitchCase { values: vec![n(1.0)], body: vec![ret(s("one"))] },
            SwitchCase { values: vec![n(2.0), n(3.0)], body: vec![ret(s("two-or-three"))] },
        ]
    };
    assert_eq!(run(switch_program(cases(), 1.0)), Value::str_ref("one"));
    assert_eq!(run(switch_program(cases(), 3.0)), Value::str_ref("two-or-three"));
    assert_eq!(run(switch_program(cases(), 9.0)), Value::str_ref("other"));
    assert_eq!(run(switch_program(cases(), 2.5)), Value::str_ref("other"));
}

#[test]
fn test_sparse_switch_dispatch() {
    let cases = || {
        vec![
            SwitchCase { values: vec![s("a")], body: vec![ret(s("letter"))] },
            SwitchCase { values: vec![n(1000000.0)], body: vec![ret(s("big"))] },
        ]
    };
    assert_eq!(run(switch_program(cases(), 1000000.0)), Value::str_ref("big"));
    assert_eq!(run(switch_program(cases(), 5.0)), Value::str_ref("other"));
}

// --- error handling ---

#[test]
fn test_try_catch_binds_error_value() {
    // try { error("x") } catch (e) { e } evaluates to "x"
    let stmts = vec![
        var("result", expr(ExprKind::Undefined)),
        stmt(StmtKind::TryCatch {
            try_body: vec![expr_stmt(call(ident("error"), vec![s("x")]))],
            catch_name: Some("e".to_string()),
            catch_body: Some(vec![assign(ident("result"), ident("e"))]),
            finally_body: None,
        }),
        ret(ident("result")),
    ];
    assert_eq!(run(stmts), Value::str_ref("x"));
}

#[test]
fn test_uncaught_error_surfaces_to_embedder() {
    let image = Compiler::new()
        .compile(vec![expr_stmt(call(ident("error"), vec![s("boom")]))])
        .unwrap();
    let err = VM::new().execute(image).unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert_eq!(err.message, "boom");
}

#[test]
fn test_finally_runs_then_rethrows() {
    let stmts = vec![
        var("log", array(vec![])),
        stmt(StmtKind::TryCatch {
            try_body: vec![stmt(StmtKind::TryCatch {
                try_body: vec![expr_stmt(call(ident("error"), vec![s("x")]))],
                catch_name: None,
                catch_body: None,
                finally_body: Some(vec![expr_stmt(mcall(ident("log"), "add", vec![s("fin")]))]),
            })],
            catch_name: Some("e".to_string()),
            catch_body: Some(vec![expr_stmt(mcall(ident("log"), "add", vec![ident("e")]))]),
            finally_body: None,
        }),
        ret(ident("log")),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::str_ref("fin"), Value::str_ref("x")]
    );
}

#[test]
fn test_finally_runs_on_return_path() {
    let stmts = vec![
        var("log", array(vec![])),
        var(
            "f",
            lambda(
                vec![],
                vec![stmt(StmtKind::TryCatch {
                    try_body: vec![ret(n(1.0))],
                    catch_name: None,
                    catch_body: None,
                    finally_body: Some(vec![expr_stmt(mcall(
                        ident("log"),
                        "add",
                        vec![s("fin")],
                    ))]),
                })],
            ),
        ),
        var("r", call(ident("f"), vec![])),
        ret(array(vec![ident("r"), field(ident("log"), "length")])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(1.0), Value::Number(1.0)]
    );
}

#[test]
fn test_catch_in_caller_catches_callee_error() {
    let stmts = vec![
        func_decl("fail", vec![], vec![expr_stmt(call(ident("error"), vec![s("deep")]))]),
        var("caught", s("")),
        stmt(StmtKind::TryCatch {
            try_body: vec![expr_stmt(call(ident("fail"), vec![]))],
            catch_name: Some("e".to_string()),
            catch_body: Some(vec![assign(ident("caught"), ident("e"))]),
            finally_body: None,
        }),
        ret(ident("caught")),
    ];
    assert_eq!(run(stmts), Value::str_ref("deep"));
}

// --- sequences ---

#[test]
fn test_sequence_yields_then_completes() {
    // seq s() { yield 1; yield 2; } produces (true,1),(true,2),(false,_)
    // and stays exhausted
    let stmts = vec![
        seq_decl("s", vec![], vec![yield_stmt(n(1.0)), yield_stmt(n(2.0))]),
        var("e", call(ident("s"), vec![])),
        var("log", array(vec![])),
        expr_stmt(mcall(ident("log"), "add", vec![mcall(ident("e"), "moveNext", vec![])])),
        expr_stmt(mcall(ident("log"), "add", vec![field(ident("e"), "current")])),
        expr_stmt(mcall(ident("log"), "add", vec![mcall(ident("e"), "moveNext", vec![])])),
        expr_stmt(mcall(ident("log"), "add", vec![field(ident("e"), "current")])),
        expr_stmt(mcall(ident("log"), "add", vec![mcall(ident("e"), "moveNext", vec![])])),
        expr_stmt(mcall(ident("log"), "add", vec![field(ident("e"), "current")])),
        expr_stmt(mcall(ident("log"), "add", vec![mcall(ident("e"), "moveNext", vec![])])),
        ret(ident("log")),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![
            Value::Bool(true),
            Value::Number(1.0),
            Value::Bool(true),
            Value::Number(2.0),
            Value::Bool(false),
            Value::Undefined,
            Value::Bool(false),
        ]
    );
}

#[test]
fn test_sequence_get_enumerator_returns_itself() {
    let stmts = vec![
        seq_decl("s", vec![], vec![yield_stmt(n(1.0))]),
        var("e", call(ident("s"), vec![])),
        ret(bin(BinaryOp::Eq, ident("e"), mcall(ident("e"), "getEnumerator", vec![]))),
    ];
    assert_eq!(run(stmts), Value::Bool(true));
}

#[test]
fn test_foreach_drives_a_sequence() {
    let stmts = vec![
        seq_decl(
            "s",
            vec![],
            vec![yield_stmt(n(1.0)), yield_stmt(n(2.0)), yield_stmt(n(3.0))],
        ),
        var("total", n(0.0)),
        stmt(StmtKind::Foreach {
            name: "v".to_string(),
            iterable: call(ident("s"), vec![]),
            body: vec![assign(ident("total"), bin(BinaryOp::Add, ident("total"), ident("v")))],
        }),
        ret(ident("total")),
    ];
    assert_eq!(run(stmts), Value::Number(6.0));
}

#[test]
fn test_sequence_arguments_bind_on_first_resume() {
    let stmts = vec![
        seq_decl(
            "countdown",
            vec!["from"],
            vec![
                yield_stmt(ident("from")),
                yield_stmt(bin(BinaryOp::Sub, ident("from"), n(1.0))),
            ],
        ),
        var("e", call(ident("countdown"), vec![n(5.0)])),
        expr_stmt(mcall(ident("e"), "moveNext", vec![])),
        var("first", field(ident("e"), "current")),
        expr_stmt(mcall(ident("e"), "moveNext", vec![])),
        ret(array(vec![ident("first"), field(ident("e"), "current")])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::Number(5.0), Value::Number(4.0)]
    );
}

#[test]
fn test_sequence_error_marks_it_exhausted() {
    let stmts = vec![
        seq_decl(
            "bad",
            vec![],
            vec![
                yield_stmt(n(1.0)),
                expr_stmt(call(ident("error"), vec![s("mid")])),
                yield_stmt(n(2.0)),
            ],
        ),
        var("e", call(ident("bad"), vec![])),
        expr_stmt(mcall(ident("e"), "moveNext", vec![])),
        var("caught", s("")),
        stmt(StmtKind::TryCatch {
            try_body: vec![expr_stmt(mcall(ident("e"), "moveNext", vec![]))],
            catch_name: Some("err".to_string()),
            catch_body: Some(vec![assign(ident("caught"), ident("err"))]),
            finally_body: None,
        }),
        // An errored sequence reports exhaustion from then on
        ret(array(vec![ident("caught"), mcall(ident("e"), "moveNext", vec![])])),
    ];
    assert_eq!(
        array_values(&run(stmts)),
        vec![Value::str_ref("mid"), Value::Bool(false)]
    );
}

#[test]
fn test_sequence_buffers_return_to_pool() {
    let stmts = vec![
        seq_decl("s", vec![], vec![yield_stmt(n(1.0)), yield_stmt(n(2.0))]),
        var("total", n(0.0)),
        stmt(StmtKind::Foreach {
            name: "v".to_string(),
            iterable: call(ident("s"), vec![]),
            body: vec![assign(ident("total"), bin(BinaryOp::Add, ident("total"), ident("v")))],
        }),
        ret(ident("total")),
    ];
    let image = Compiler::new().compile(stmts).unwrap();
    let mut vm = VM::new();
    vm.execute(image).unwrap();
    let stats = vm.pool_stats();
    assert_eq!(stats.rented, stats.returned);
}

// --- async scheduler ---

#[test]
fn test_two_tasks_interleave_fifo_and_complete() {
    let task_body = |name: &str| {
        vec![
            expr_stmt(mcall(ident("log"), "add", vec![s(&format!("{}-1", name))])),
            yield_stmt(n(0.0)),
            expr_stmt(mcall(ident("log"), "add", vec![s(&format!("{}-2", name))])),
            yield_stmt(n(0.0)),
            expr_stmt(mcall(ident("log"), "add", vec![s(&format!("{}-3", name))])),
            yield_stmt(n(0.0)),
        ]
    };
    let stmts = vec![
        var("log", array(vec![])),
        stmt(StmtKind::FuncDecl(FunctionDecl {
            name: Some("ta".to_string()),
            params: vec![],
            var_arg: false,
            body: task_body("a"),
            is_sequence: true,
        })),
        stmt(StmtKind::FuncDecl(FunctionDecl {
            name: Some("tb".to_string()),
            params: vec![],
            var_arg: false,
            body: task_body("b"),
            is_sequence: true,
        })),
        expr_stmt(call(ident("start"), vec![ident("ta")])),
        expr_stmt(call(ident("start"), vec![ident("tb")])),
        expr_stmt(call(ident("runToCompletion"), vec![])),
        ret(ident("log")),
    ];
    let mut vm = VM::new();
    let result = run_in(&mut vm, stmts).unwrap();
    let log: Vec<String> = array_values(&result)
        .iter()
        .map(|v| format!("{}", v))
        .collect();
    assert_eq!(log, vec!["a-1", "b-1", "a-2", "b-2", "a-3", "b-3"]);
    assert_eq!(vm.scheduler.active_tasks(), 0);
    assert_eq!(vm.scheduler.queued_errors(), 0);
}

#[test]
fn test_task_error_surfaces_on_run_not_start() {
    let stmts = vec![
        seq_decl(
            "boom",
            vec![],
            vec![expr_stmt(call(ident("error"), vec![s("kaput")])), yield_stmt(n(0.0))],
        ),
        expr_stmt(call(ident("start"), vec![ident("boom")])),
        ret(s("started")),
    ];
    let mut vm = VM::new();
    // start() alone does not execute the task, so the program completes
    let result = run_in(&mut vm, stmts).unwrap();
    assert_eq!(result, Value::str_ref("started"));
    assert_eq!(vm.scheduler.active_tasks(), 1);

    // The next pump runs the task, collects its failure, and raises the
    // oldest queued error with the cause chained
    let err = vm.run_scheduler_once().unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert_eq!(err.cause.as_ref().unwrap().message, "kaput");
    assert_eq!(vm.scheduler.active_tasks(), 0);
}

#[test]
fn test_await_shaped_host_completion() {
    // A host native parks the current task by returning the scheduler's
    // pending sentinel; completing the waker resumes the task with the
    // result value on a later pump.
    let waker_slot: Arc<Mutex<Option<TaskWaker>>> = Arc::new(Mutex::new(None));
    let mut vm = VM::new();
    {
        let waker_slot = waker_slot.clone();
        vm.register_native("io_read", move |vm, _args| {
            *waker_slot.lock().unwrap() = vm.scheduler.current_waker();
            Ok(vm.scheduler.pending_value())
        });
    }

    let stmts = vec![
        seq_decl(
            "task",
            vec![],
            vec![
                var(
                    "v",
                    expr(ExprKind::Yield(Box::new(call(ident("io_read"), vec![])))),
                ),
                assign(
                    field(expr(ExprKind::Global), "answer"),
                    ident("v"),
                ),
            ],
        ),
        expr_stmt(call(ident("start"), vec![ident("task")])),
        ret(call(ident("run"), vec![])),
    ];
    // The first pump parks the task on the pending sentinel
    let still_active = run_in(&mut vm, stmts).unwrap();
    assert_eq!(still_active, Value::Bool(true));
    let waker = waker_slot.lock().unwrap().take().expect("waker captured");

    // Host completion enqueues the continuation; the next pump finishes it
    waker.complete(Value::Number(99.0));
    let remaining = vm.run_scheduler_once().unwrap();
    assert!(!remaining);
    assert_eq!(vm.get_global("answer").unwrap(), Value::Number(99.0));
}

#[test]
fn test_host_injected_error_acts_as_timeout() {
    let waker_slot: Arc<Mutex<Option<TaskWaker>>> = Arc::new(Mutex::new(None));
    let mut vm = VM::new();
    {
        let waker_slot = waker_slot.clone();
        vm.register_native("io_read", move |vm, _args| {
            *waker_slot.lock().unwrap() = vm.scheduler.current_waker();
            Ok(vm.scheduler.pending_value())
        });
    }

    let stmts = vec![
        seq_decl(
            "task",
            vec![],
            vec![yield_stmt(call(ident("io_read"), vec![]))],
        ),
        expr_stmt(call(ident("start"), vec![ident("task")])),
        ret(call(ident("run"), vec![])),
    ];
    assert_eq!(run_in(&mut vm, stmts).unwrap(), Value::Bool(true));

    let waker = waker_slot.lock().unwrap().take().expect("waker captured");
    waker.fail(ScriptError::runtime_error("operation timed out".to_string()));
    let err = vm.run_scheduler_once().unwrap_err();
    assert_eq!(err.cause.as_ref().unwrap().message, "operation timed out");
    assert_eq!(vm.scheduler.active_tasks(), 0);
}

// --- modules, globals, embedding ---

#[test]
fn test_export_then_import_through_global_object() {
    let mut vm = VM::new();
    let first = vec![stmt(StmtKind::Export {
        decl: Box::new(var("answer", n(41.0))),
    })];
    run_in(&mut vm, first).unwrap();
    assert_eq!(vm.get_global("answer").unwrap(), Value::Number(41.0));

    let second = vec![
        stmt(StmtKind::Import { name: "answer".to_string() }),
        ret(bin(BinaryOp::Add, ident("answer"), n(1.0))),
    ];
    assert_eq!(run_in(&mut vm, second).unwrap(), Value::Number(42.0));
}

#[test]
fn test_global_writes_persist_across_programs() {
    let mut vm = VM::new();
    run_in(&mut vm, vec![assign(field(expr(ExprKind::Global), "n"), n(10.0))]).unwrap();
    let result = run_in(&mut vm, vec![ret(ident("n"))]).unwrap();
    assert_eq!(result, Value::Number(10.0));
}

#[test]
fn test_host_invokes_compiled_function() {
    let mut vm = VM::new();
    let stmts = vec![stmt(StmtKind::Export {
        decl: Box::new(func_decl(
            "triple",
            vec!["x"],
            vec![ret(bin(BinaryOp::Mul, ident("x"), n(3.0)))],
        )),
    })];
    run_in(&mut vm, stmts).unwrap();
    let triple = vm.get_global("triple").unwrap();
    let result = vm.call_value(triple, vec![Value::Number(14.0)]).unwrap();
    assert_eq!(result, Value::Number(42.0));
}

// --- program image and determinism ---

fn sample_program() -> Vec<Stmt> {
    vec![
        var("total", n(0.0)),
        stmt(StmtKind::For {
            init: Some(Box::new(var("i", n(0.0)))),
            condition: Some(bin(BinaryOp::Lt, ident("i"), n(10.0))),
            update: Some(Box::new(assign(
                ident("i"),
                bin(BinaryOp::Add, ident("i"), n(1.0)),
            ))),
            body: vec![assign(ident("total"), bin(BinaryOp::Add, ident("total"), ident("i")))],
        }),
        ret(ident("total")),
    ]
}

#[test]
fn test_bytecode_decode_encode_round_trip() {
    let image = Compiler::new().compile(sample_program()).unwrap();
    let decoded = bytecode::decode(&image.bytecode).unwrap();
    let bare: Vec<_> = decoded.into_iter().map(|(_, i)| i).collect();
    assert_eq!(bytecode::encode(&bare).unwrap(), image.bytecode);
}

#[test]
fn test_compilation_is_deterministic() {
    let a = Compiler::new().compile(sample_program()).unwrap();
    let b = Compiler::new().compile(sample_program()).unwrap();
    assert_eq!(a.bytecode, b.bytecode);
    assert_eq!(a.numbers, b.numbers);
    assert_eq!(a.strings, b.strings);
}

#[test]
fn test_image_survives_binary_round_trip_and_still_runs() {
    let image = Compiler::new().compile(sample_program()).unwrap();
    let bytes = image.save_to_bytes();
    let reloaded = Arc::new(rill::program::ProgramImage::load_from_bytes(&bytes).unwrap());
    let result = VM::new().execute(reloaded).unwrap();
    assert_eq!(result, Value::Number(45.0));
}

#[test]
fn test_execution_is_deterministic() {
    let run_once = || {
        let image = Compiler::new().compile(sample_program()).unwrap();
        VM::new().execute(image).unwrap()
    };
    assert_eq!(run_once(), run_once());
}

#[test]
fn test_error_carries_source_location_from_debug_info() {
    let mut bad = call(ident("error"), vec![s("here")]);
    bad.location = SourceLocation::new(12, 3);
    let mut failing = expr_stmt(bad);
    failing.location = SourceLocation::new(12, 1);
    let image = Compiler::new().compile(vec![failing]).unwrap();
    let err = VM::new().execute(image).unwrap_err();
    assert_eq!(err.location.line, 12);
}
