//! End-to-end tests: contract trees compiled and run through the `Vm` facade.

use std::cell::Cell;
use std::rc::Rc;

use bvm::lang::node::{BinaryOp, Case, Entry, Node, NodeKind, VarDef};
use bvm::lang::types::Type;
use bvm::lang::value::Value;
use bvm::runtime::host::{HostFunc, HostReturn};
use bvm::runtime::runtime_error::RuntimeError;
use bvm::runtime::vm_bc::{Outcome, VmConfig};
use bvm::{Vm, VmSettings};
use proptest::prelude::*;

use BinaryOp::{Add, AddAssign, And, Div, DivAssign, Gt, Lt, Mod, Mul, NotEq, Or, Sub};

// ============================================================
// Helper functions
// ============================================================

const GAS: i64 = 100_000;

fn arr_int() -> Type {
    Type::array_of(Type::INT).unwrap()
}

fn contract(name: &str, statements: Vec<Node>) -> Node {
    Node::contract(name, false, Vec::new(), statements)
}

fn run_in(vm: &mut Vm, statements: Vec<Node>, gas: i64) -> Outcome {
    let index = vm.load(&contract("Test", statements)).unwrap();
    vm.run(index, &[], gas)
}

fn run(statements: Vec<Node>) -> Outcome {
    run_in(&mut Vm::new(VmSettings::default()), statements, GAS)
}

fn run_ok(statements: Vec<Node>) -> String {
    let outcome = run(statements);
    assert_eq!(outcome.error, None, "execution should succeed");
    outcome.result
}

fn run_err(statements: Vec<Node>) -> RuntimeError {
    let outcome = run(statements);
    assert_eq!(outcome.result, "");
    outcome.error.expect("execution should fail")
}

fn bin(op: BinaryOp, left: Node, right: Node) -> Node {
    Node::binary(op, left, right)
}

fn ret(expr: Node) -> Node {
    Node::ret(Some(expr))
}

fn add_assign(name: &str, value: Node) -> Node {
    bin(AddAssign, Node::var(name), value)
}

fn for_in(value: &str, index: Option<&str>, collection: Node, body: Vec<Node>) -> Node {
    Node::with_kind(NodeKind::For {
        value: value.to_string(),
        index: index.map(str::to_string),
        collection: Box::new(collection),
        body: Box::new(Node::block(body)),
    })
}

fn for_range(var: &str, from: i64, to: i64, body: Vec<Node>) -> Node {
    Node::with_kind(NodeKind::ForRange {
        var: var.to_string(),
        from: Box::new(Node::int(from)),
        to: Box::new(Node::int(to)),
        body: Box::new(Node::block(body)),
    })
}

fn fib_func() -> Node {
    Node::func(
        "fib",
        vec![VarDef::param("n", Type::INT)],
        Some(Type::INT),
        vec![
            Node::if_else(
                bin(Lt, Node::var("n"), Node::int(2)),
                vec![ret(Node::var("n"))],
                None,
            ),
            ret(bin(
                Add,
                Node::call("fib", vec![bin(Sub, Node::var("n"), Node::int(1))]),
                Node::call("fib", vec![bin(Sub, Node::var("n"), Node::int(2))]),
            )),
        ],
    )
}

// ============================================================
// Expressions
// ============================================================

#[test]
fn arithmetic_result_and_gas() {
    let outcome = run(vec![ret(bin(
        Add,
        Node::int(2),
        bin(Mul, Node::int(3), Node::int(4)),
    ))]);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.result, "14");
    assert!(outcome.gas_used > 0);
}

#[test]
fn builtin_gas_is_charged() {
    // DATA, PUSHSTR, EMBEDFUNC (+5), RETURN
    let outcome = run(vec![ret(Node::call("Len", vec![Node::str("abc")]))]);
    assert_eq!(outcome.result, "3");
    assert_eq!(outcome.gas_used, 9);
}

#[test]
fn float_money_and_strings() {
    assert_eq!(run_ok(vec![ret(bin(Add, Node::float(1.5), Node::float(2.25)))]), "3.75");
    assert_eq!(
        run_ok(vec![ret(bin(
            Div,
            Node::call("money", vec![Node::int(10)]),
            Node::call("money", vec![Node::int(4)]),
        ))]),
        "2.5"
    );
    assert_eq!(
        run_ok(vec![ret(bin(
            BinaryOp::Eq,
            bin(Add, Node::str("a"), Node::str("b")),
            Node::str("ab"),
        ))]),
        "true"
    );
    assert_eq!(
        run_ok(vec![ret(bin(NotEq, Node::int(1), Node::int(1)))]),
        "false"
    );
}

#[test]
fn division_by_zero_for_every_numeric_type() {
    assert_eq!(
        run_err(vec![ret(bin(Mod, Node::int(1), Node::int(0)))]),
        RuntimeError::DivideByZero
    );
    assert_eq!(
        run_err(vec![ret(bin(Div, Node::float(1.0), Node::float(0.0)))]),
        RuntimeError::DivideByZero
    );
    assert_eq!(
        run_err(vec![
            Node::declare("m", Type::MONEY, Some(Node::call("money", vec![Node::int(10)]))),
            bin(DivAssign, Node::var("m"), Node::call("money", vec![Node::int(0)])),
        ]),
        RuntimeError::DivideByZero
    );
}

#[test]
fn short_circuit_skips_right_operand() {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let touch = HostFunc::new("Touch", Vec::new(), Some(Type::BOOL), move |_| {
        counter.set(counter.get() + 1);
        Ok(HostReturn::new(Value::Bool(true), 1))
    });
    let mut vm = Vm::new(VmSettings {
        funcs: vec![touch],
        ..VmSettings::default()
    });

    let outcome = run_in(
        &mut vm,
        vec![ret(bin(And, Node::boolean(false), Node::call("Touch", Vec::new())))],
        GAS,
    );
    assert_eq!(outcome.result, "false");
    assert_eq!(calls.get(), 0);

    let outcome = run_in(
        &mut vm,
        vec![ret(bin(Or, Node::boolean(true), Node::call("Touch", Vec::new())))],
        GAS,
    );
    assert_eq!(outcome.result, "true");
    assert_eq!(calls.get(), 0);

    let outcome = run_in(
        &mut vm,
        vec![ret(bin(And, Node::boolean(true), Node::call("Touch", Vec::new())))],
        GAS,
    );
    assert_eq!(outcome.result, "true");
    assert_eq!(calls.get(), 1);
}

#[test]
fn host_function_errors_surface() {
    let fail = HostFunc::new("Fail", Vec::new(), None, |_| Err("denied".into()));
    let mut vm = Vm::new(VmSettings {
        funcs: vec![fail],
        ..VmSettings::default()
    });
    let outcome = run_in(&mut vm, vec![Node::call("Fail", Vec::new())], GAS);
    assert_eq!(
        outcome.error,
        Some(RuntimeError::HostFunction {
            name: "Fail".into(),
            message: "denied".into(),
        })
    );
}

#[test]
fn host_function_result_must_match_declaration() {
    let wrong = HostFunc::new("Wrong", Vec::new(), Some(Type::INT), |_| {
        Ok(HostReturn::new(Value::Str("seven".into()), 1))
    });
    let missing = HostFunc::new("Missing", Vec::new(), Some(Type::INT), |_| {
        Ok(HostReturn::void(1))
    });
    let mut vm = Vm::new(VmSettings {
        funcs: vec![wrong, missing],
        ..VmSettings::default()
    });
    let outcome = run_in(&mut vm, vec![ret(Node::call("Wrong", Vec::new()))], GAS);
    assert_eq!(outcome.error, Some(RuntimeError::InvalidReturnType("Wrong".into())));
    assert_eq!(outcome.result, "");
    let outcome = run_in(&mut vm, vec![ret(Node::call("Missing", Vec::new()))], GAS);
    assert_eq!(outcome.error, Some(RuntimeError::InvalidReturnType("Missing".into())));
}

#[test]
fn object_literals() {
    let object = Node::with_kind(NodeKind::Object(vec![
        Entry::new("a", Node::int(1)),
        Entry::new("b", Node::str("x")),
    ]));
    assert_eq!(
        run_ok(vec![
            Node::declare("o", Type::OBJECT, Some(object)),
            ret(Node::var("o")),
        ]),
        r#"{"a":"1","b":"x"}"#
    );
}

// ============================================================
// Control flow
// ============================================================

#[test]
fn infinite_loop_runs_out_of_gas() {
    let outcome = run_in(
        &mut Vm::new(VmSettings::default()),
        vec![Node::while_loop(Node::boolean(true), Vec::new())],
        1000,
    );
    assert_eq!(outcome.error, Some(RuntimeError::OutOfGas));
    assert_eq!(outcome.result, "");
    // the failing instruction is counted before the limit check
    assert_eq!(outcome.gas_used, 1001);
}

#[test]
fn while_with_block_locals_and_break() {
    let result = run_ok(vec![
        Node::declare("i", Type::INT, None),
        Node::while_loop(
            bin(Lt, Node::var("i"), Node::int(10)),
            vec![
                Node::declare("j", Type::INT, Some(bin(Mul, Node::var("i"), Node::int(2)))),
                add_assign("i", Node::int(1)),
                Node::if_else(bin(Gt, Node::var("j"), Node::int(6)), vec![Node::brk()], None),
            ],
        ),
        ret(Node::var("i")),
    ]);
    assert_eq!(result, "5");
}

#[test]
fn for_over_array_with_index() {
    let result = run_ok(vec![
        Node::declare("s", Type::INT, None),
        for_in(
            "v",
            Some("i"),
            Node::array(vec![Node::int(10), Node::int(20), Node::int(30)]),
            vec![add_assign("s", bin(Mul, Node::var("v"), Node::var("i")))],
        ),
        ret(Node::var("s")),
    ]);
    assert_eq!(result, "80");
}

#[test]
fn for_over_map_in_key_order() {
    let result = run_ok(vec![
        Node::declare("out", Type::STR, None),
        for_in(
            "v",
            Some("k"),
            Node::map(vec![("b", Node::str("2")), ("a", Node::str("1"))]),
            vec![add_assign("out", bin(Add, Node::var("k"), Node::var("v")))],
        ),
        ret(Node::var("out")),
    ]);
    assert_eq!(result, "a1b2");
}

#[test]
fn for_range_with_continue_and_break() {
    let result = run_ok(vec![
        Node::declare("s", Type::INT, None),
        for_range(
            "i",
            1,
            10,
            vec![
                Node::if_else(bin(BinaryOp::Eq, Node::var("i"), Node::int(3)), vec![Node::cont()], None),
                Node::if_else(bin(Gt, Node::var("i"), Node::int(5)), vec![Node::brk()], None),
                add_assign("s", Node::var("i")),
            ],
        ),
        ret(Node::var("s")),
    ]);
    assert_eq!(result, "12");

    let inclusive = run_ok(vec![
        Node::declare("s", Type::INT, None),
        for_range("i", 1, 4, vec![add_assign("s", Node::var("i"))]),
        ret(Node::var("s")),
    ]);
    assert_eq!(inclusive, "10");
}

#[test]
fn switch_cases_and_default() {
    let switch = |x: i64| {
        Node::with_kind(NodeKind::Switch {
            subject: Box::new(Node::int(x)),
            cases: vec![
                Case {
                    values: vec![Node::int(1), Node::int(2)],
                    body: Node::block(vec![Node::assign("r", Node::str("low"))]),
                },
                Case {
                    values: vec![Node::int(3)],
                    body: Node::block(vec![Node::assign("r", Node::str("three"))]),
                },
            ],
            default: Some(Box::new(Node::block(vec![Node::assign("r", Node::str("other"))]))),
        })
    };
    for (x, expected) in [(1, "low"), (2, "low"), (3, "three"), (9, "other")] {
        let result = run_ok(vec![
            Node::declare("r", Type::STR, None),
            switch(x),
            ret(Node::var("r")),
        ]);
        assert_eq!(result, expected, "switch({})", x);
    }
}

#[test]
fn question_expression() {
    let result = run_ok(vec![ret(bin(
        Add,
        Node::int(1),
        Node::question(Node::boolean(false), Node::int(10), Node::int(20)),
    ))]);
    assert_eq!(result, "21");
}

// ============================================================
// Functions
// ============================================================

#[test]
fn recursive_function() {
    let result = run_ok(vec![fib_func(), ret(Node::call("fib", vec![Node::int(10)]))]);
    assert_eq!(result, "55");
}

#[test]
fn function_called_mid_expression_keeps_operands() {
    let result = run_ok(vec![
        fib_func(),
        ret(bin(Add, Node::int(100), Node::call("fib", vec![Node::int(6)]))),
    ]);
    assert_eq!(result, "108");
}

#[test]
fn function_reads_outer_variables() {
    let result = run_ok(vec![
        Node::declare("base", Type::INT, Some(Node::int(40))),
        Node::func(
            "plus",
            vec![VarDef::param("n", Type::INT)],
            Some(Type::INT),
            vec![
                Node::declare("local", Type::INT, Some(Node::var("n"))),
                ret(bin(Add, Node::var("base"), Node::var("local"))),
            ],
        ),
        Node::declare("x", Type::INT, Some(Node::int(7))),
        ret(bin(Add, Node::call("plus", vec![Node::int(2)]), Node::var("x"))),
    ]);
    assert_eq!(result, "49");
}

#[test]
fn unbounded_recursion_hits_call_depth() {
    let mut vm = Vm::new(VmSettings {
        config: VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        },
        ..VmSettings::default()
    });
    let forever = Node::func(
        "f",
        vec![VarDef::param("n", Type::INT)],
        Some(Type::INT),
        vec![ret(Node::call("f", vec![bin(Add, Node::var("n"), Node::int(1))]))],
    );
    let outcome = run_in(
        &mut vm,
        vec![forever, ret(Node::call("f", vec![Node::int(0)]))],
        GAS,
    );
    assert_eq!(outcome.error, Some(RuntimeError::CallDepthExceeded(50)));
}

// ============================================================
// Containers
// ============================================================

#[test]
fn assignment_copies_containers() {
    let result = run_ok(vec![
        Node::declare("a", arr_int(), Some(Node::array(vec![Node::int(1)]))),
        Node::declare("b", arr_int(), Some(Node::var("a"))),
        Node::assign_index("b", vec![Node::int(0)], Node::int(5)),
        ret(bin(
            Add,
            Node::call("str", vec![Node::index("a", vec![Node::int(0)])]),
            Node::call("str", vec![Node::index("b", vec![Node::int(0)])]),
        )),
    ]);
    assert_eq!(result, "15");
}

#[test]
fn array_append_and_len() {
    let result = run_ok(vec![
        Node::declare("a", arr_int(), None),
        add_assign("a", Node::int(4)),
        add_assign("a", Node::int(5)),
        ret(Node::call("Len", vec![Node::var("a")])),
    ]);
    assert_eq!(result, "2");
}

#[test]
fn index_out_of_range() {
    let err = run_err(vec![
        Node::declare(
            "a",
            arr_int(),
            Some(Node::array(vec![Node::int(1), Node::int(2)])),
        ),
        Node::assign_index("a", vec![Node::int(5)], Node::int(3)),
    ]);
    assert_eq!(err, RuntimeError::IndexOutOfRange { index: 5, len: 2 });
}

#[test]
fn missing_map_key() {
    let err = run_err(vec![
        Node::declare("m", Type::map_of(Type::INT).unwrap(), None),
        ret(Node::index("m", vec![Node::str("x")])),
    ]);
    assert_eq!(err, RuntimeError::KeyNotFound("x".into()));
}

#[test]
fn map_entry_insert() {
    let result = run_ok(vec![
        Node::declare("m", Type::map_of(Type::INT).unwrap(), None),
        Node::assign_index("m", vec![Node::str("k")], Node::int(3)),
        bin(
            AddAssign,
            Node::index("m", vec![Node::str("k")]),
            Node::int(4),
        ),
        ret(Node::index("m", vec![Node::str("k")])),
    ]);
    assert_eq!(result, "7");
}

// ============================================================
// Contracts
// ============================================================

#[test]
fn contract_call_isolates_heap() {
    let mut vm = Vm::new(VmSettings::default());
    let inner = Node::contract(
        "Inner",
        false,
        vec![VarDef::param("a", arr_int())],
        vec![
            Node::assign_index("a", vec![Node::int(0)], Node::int(99)),
            ret(Node::call("str", vec![Node::index("a", vec![Node::int(0)])])),
        ],
    );
    vm.load(&inner).unwrap();

    let outer = contract(
        "Outer",
        vec![
            Node::declare(
                "xs",
                arr_int(),
                Some(Node::array(vec![Node::int(1), Node::int(2)])),
            ),
            Node::declare(
                "r",
                Type::STR,
                Some(Node::call_contract("Inner", vec![("a", Node::var("xs"))])),
            ),
            ret(bin(
                Add,
                Node::var("r"),
                Node::call("str", vec![Node::index("xs", vec![Node::int(0)])]),
            )),
        ],
    );
    let index = vm.load(&outer).unwrap();
    let outcome = vm.run(index, &[], GAS);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.result, "991");
    assert_eq!(vm.heap().objects_len(), 0);
    assert_eq!(vm.heap().strings_len(), 0);
}

#[test]
fn contract_call_accepts_empty_array_argument() {
    let mut vm = Vm::new(VmSettings::default());
    let count = Node::contract(
        "Count",
        false,
        vec![VarDef::param("a", arr_int())],
        vec![ret(Node::call(
            "str",
            vec![Node::call("Len", vec![Node::var("a")])],
        ))],
    );
    vm.load(&count).unwrap();
    let index = vm
        .load(&contract(
            "Caller",
            vec![ret(Node::call_contract(
                "Count",
                vec![("a", Node::array(Vec::new()))],
            ))],
        ))
        .unwrap();
    let outcome = vm.run(index, &[], GAS);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.result, "0");
}

#[test]
fn contract_call_charges_callee_gas() {
    let mut vm = Vm::new(VmSettings::default());
    vm.load(&contract("Spin", vec![Node::while_loop(Node::boolean(true), Vec::new())]))
        .unwrap();
    let index = vm
        .load(&contract("Caller", vec![ret(Node::call_contract("Spin", Vec::new()))]))
        .unwrap();
    let outcome = vm.run(index, &[], 500);
    assert_eq!(outcome.error, Some(RuntimeError::OutOfGas));
    assert_eq!(outcome.gas_used, 501);
}

#[test]
fn artifact_roundtrip_runs_identically() {
    let mut vm = Vm::new(VmSettings::default());
    let ast = Node::contract(
        "Fib",
        false,
        vec![VarDef::param("n", Type::INT)],
        vec![fib_func(), ret(Node::call("fib", vec![Node::var("n")]))],
    );
    vm.load(&ast).unwrap();
    let expected = vm.call("Fib", &[("n", Value::Int(8))], GAS).unwrap();
    assert_eq!(expected.result, "21");

    let bytes = vm.artifact("Fib").unwrap();
    let mut fresh = Vm::new(VmSettings::default());
    fresh.load_artifact(&bytes).unwrap();
    let outcome = fresh.call("Fib", &[("n", Value::Int(8))], GAS).unwrap();
    assert_eq!(outcome, expected);
}

// ============================================================
// Properties
// ============================================================

proptest! {
    /// Integer division and remainder match wrapping native semantics and
    /// fail only on a zero divisor.
    #[test]
    fn integer_div_mod_match_native(a in any::<i64>(), b in prop_oneof![Just(0i64), any::<i64>()]) {
        for (op, native) in [
            (Div, a.checked_div(b).or_else(|| (b != 0).then(|| a.wrapping_div(b)))),
            (Mod, a.checked_rem(b).or_else(|| (b != 0).then(|| a.wrapping_rem(b)))),
        ] {
            let outcome = run(vec![ret(bin(op, Node::int(a), Node::int(b)))]);
            match native {
                Some(n) => {
                    prop_assert_eq!(outcome.error, None);
                    prop_assert_eq!(outcome.result, n.to_string());
                }
                None => prop_assert_eq!(outcome.error, Some(RuntimeError::DivideByZero)),
            }
        }
    }
}
