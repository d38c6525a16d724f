//! Test branch, loop and condition lowering.
//!
//! These tests verify that branches and loops build without register conflicts at their join
//! points, that short-circuit conditions become jump sequences, and that loops containing a
//! call keep their carried values in non-volatile registers.

mod common;

use common::machine::execute;
use common::*;
use unitlower::core::{Condition, Operation};
use unitlower::tree::{BinaryOperator, Comparison};
use unitlower::{
    lower_function, Format, Function, LoweredFunction, LoweringError, Node, NodeKind,
    TargetConfiguration, Variable,
};

fn conditional_jumps(lowered: &LoweredFunction) -> usize {
    count(lowered, |operation| {
        matches!(operation, Operation::Jump { condition: Some(_), .. })
    })
}

fn unconditional_jumps(lowered: &LoweredFunction) -> usize {
    count(lowered, |operation| {
        matches!(operation, Operation::Jump { condition: None, .. })
    })
}

fn compares(lowered: &LoweredFunction) -> usize {
    count(lowered, |operation| matches!(operation, Operation::Compare { .. }))
}

/// `if (a < b) { m = b } else { m = a } return m`
fn max() -> Function {
    let mut function = returning_i64("max");
    let a = function.declare(Variable::parameter("a", Format::I64));
    let b = function.declare(Variable::parameter("b", Format::I64));
    let m = function.declare(Variable::local("m", Format::I64));
    function.body = vec![
        if_then(
            less(var(a), var(b)),
            vec![assign(m, var(b))],
            Some(vec![assign(m, var(a))]),
        ),
        Node::ret(Some(var(m))),
    ];
    function
}

/// `total = 0; i = 0; while (i < n) { <body>; total = total + i; i = i + 1 } return total`
fn counted_loop(name: &str, body: impl FnOnce(&mut Function) -> Vec<Node>) -> Function {
    let mut function = returning_i64(name);
    let n = function.declare(Variable::parameter("n", Format::I64));
    let total = function.declare(Variable::local("total", Format::I64));
    let i = function.declare(Variable::local("i", Format::I64));
    let mut statements = body(&mut function);
    statements.push(assign(total, binary(BinaryOperator::Add, var(total), var(i))));
    statements.push(assign(i, binary(BinaryOperator::Add, var(i), int(1))));
    function.body = vec![
        assign(total, int(0)),
        assign(i, int(0)),
        while_loop(less(var(i), var(n)), statements),
        Node::ret(Some(var(total))),
    ];
    function
}

#[test]
fn test_if_else_builds_single_inverted_jump() {
    let lowered = build(&max(), TargetConfiguration::x64_linux());

    assert_eq!(compares(&lowered), 1);
    assert_eq!(conditional_jumps(&lowered), 1);
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Jump { condition: Some(Condition::GreaterOrEqual), .. }
    )));
    // Jump over the else path.
    assert_eq!(unconditional_jumps(&lowered), 1);
    assert!(matches!(lowered.operations().last(), Some(Operation::Return)));
}

#[test]
fn test_if_else_on_arm64() {
    let lowered = build(&max(), TargetConfiguration::arm64_linux());
    assert_eq!(compares(&lowered), 1);
    assert_eq!(conditional_jumps(&lowered), 1);
}

#[test]
fn test_if_without_else() {
    let mut function = returning_i64("clamp");
    let a = function.declare(Variable::parameter("a", Format::I64));
    function.body = vec![
        if_then(less(var(a), int(0)), vec![assign(a, int(0))], None),
        Node::ret(Some(var(a))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(conditional_jumps(&lowered), 1);
    assert_eq!(unconditional_jumps(&lowered), 0);
}

#[test]
fn test_counted_loop() {
    let function = counted_loop("sum", |_| Vec::new());
    let lowered = build(&function, TargetConfiguration::x64_linux());

    // Entry check and back-edge check.
    assert_eq!(compares(&lowered), 2);
    assert_eq!(conditional_jumps(&lowered), 2);
    assert!(lowered.saved_registers.is_empty());
    assert_eq!(lowered.statistics.spills, 0);
}

#[test]
fn test_loop_with_call_uses_non_volatile_registers() {
    let callee = signature("observe", &[Format::I64], None);
    let function = counted_loop("observed_sum", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![call(&callee, vec![var(i)])]
    });
    let config = TargetConfiguration::x64_linux();
    let lowered = build(&function, config);

    assert_eq!(count(&lowered, is_call), 1);
    assert!(!lowered.saved_registers.is_empty());
    let volatile = config.volatile_registers();
    assert!(lowered
        .saved_registers
        .iter()
        .all(|reg| !volatile.contains(*reg)));
}

#[test]
fn test_stop_inside_branch() {
    let function = counted_loop("sum_until_five", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![if_then(
            Node::compare(Comparison::Equal, var(i), int(5)),
            vec![Node::new(NodeKind::Stop)],
            None,
        )]
    });
    let lowered = build(&function, TargetConfiguration::x64_linux());

    // Loop entry, the branch and the back-edge.
    assert_eq!(compares(&lowered), 3);
    assert!(unconditional_jumps(&lowered) >= 1);
}

#[test]
fn test_continue_inside_branch() {
    let function = counted_loop("sum_odd", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![if_then(
            Node::compare(
                Comparison::Equal,
                binary(BinaryOperator::BitwiseAnd, var(i), int(1)),
                int(0),
            ),
            vec![
                assign(i, binary(BinaryOperator::Add, var(i), int(1))),
                Node::new(NodeKind::Continue),
            ],
            None,
        )]
    });
    let lowered = build(&function, TargetConfiguration::arm64_linux());
    assert_eq!(compares(&lowered), 3);
}

#[test]
fn test_stop_outside_loop_is_unsupported() {
    init_logging();
    let mut function = Function::new("stray_stop");
    function.body = vec![Node::new(NodeKind::Stop)];

    let result = lower_function(&function, TargetConfiguration::x64_linux());
    assert!(matches!(result, Err(LoweringError::UnsupportedConstruct { .. })));
}

#[test]
fn test_and_condition_short_circuits() {
    let mut function = returning_i64("both");
    let a = function.declare(Variable::parameter("a", Format::I64));
    let b = function.declare(Variable::parameter("b", Format::I64));
    function.body = vec![
        if_then(
            Node::new(NodeKind::And(
                Box::new(less(var(a), var(b))),
                Box::new(Node::compare(Comparison::NotEqual, var(b), int(0))),
            )),
            vec![assign(a, var(b))],
            None,
        ),
        Node::ret(Some(var(a))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(compares(&lowered), 2);
    // Both comparisons jump to the skip label; neither needs a jump over a jump.
    assert_eq!(conditional_jumps(&lowered), 2);
    assert_eq!(unconditional_jumps(&lowered), 0);
}

#[test]
fn test_or_condition_short_circuits() {
    let mut function = returning_i64("either");
    let a = function.declare(Variable::parameter("a", Format::I64));
    let b = function.declare(Variable::parameter("b", Format::I64));
    function.body = vec![
        if_then(
            Node::new(NodeKind::Or(
                Box::new(less(var(a), int(0))),
                Box::new(less(var(b), int(0))),
            )),
            vec![assign(a, int(0))],
            None,
        ),
        Node::ret(Some(var(a))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(compares(&lowered), 2);
    assert_eq!(conditional_jumps(&lowered), 2);
}

#[test]
fn test_not_inverts_condition() {
    let mut function = returning_i64("negated");
    let a = function.declare(Variable::parameter("a", Format::I64));
    function.body = vec![
        if_then(
            Node::new(NodeKind::Not(Box::new(less(var(a), int(10))))),
            vec![assign(a, int(10))],
            None,
        ),
        Node::ret(Some(var(a))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Jump { condition: Some(Condition::Less), .. }
    )));
}

#[test]
fn test_unsigned_comparison_uses_unsigned_condition() {
    let mut function = Function::new("below");
    function.returns = Some(unitlower::tree::ValueType::Scalar(Format::U64));
    let a = function.declare(Variable::parameter("a", Format::U64));
    let b = function.declare(Variable::parameter("b", Format::U64));
    function.body = vec![
        if_then(less(var(a), var(b)), vec![assign(a, var(b))], None),
        Node::ret(Some(var(a))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Jump { condition: Some(Condition::AboveOrEqual), .. }
    )));
}

#[test]
fn test_nested_loops() {
    let mut function = returning_i64("grid");
    let n = function.declare(Variable::parameter("n", Format::I64));
    let total = function.declare(Variable::local("total", Format::I64));
    let i = function.declare(Variable::local("i", Format::I64));
    let j = function.declare(Variable::local("j", Format::I64));
    function.body = vec![
        assign(total, int(0)),
        assign(i, int(0)),
        while_loop(
            less(var(i), var(n)),
            vec![
                assign(j, int(0)),
                while_loop(
                    less(var(j), var(i)),
                    vec![
                        assign(total, binary(BinaryOperator::Add, var(total), var(j))),
                        assign(j, binary(BinaryOperator::Add, var(j), int(1))),
                    ],
                ),
                assign(i, binary(BinaryOperator::Add, var(i), int(1))),
            ],
        ),
        Node::ret(Some(var(total))),
    ];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(compares(&lowered), 4);
    assert_eq!(conditional_jumps(&lowered), 4);
}

/// `i = 0; while (i < n) { i = i + 1 } if (i < 3) { i = 3 } return i`
fn loop_then_branch() -> Function {
    let mut function = returning_i64("loop_then_branch");
    let n = function.declare(Variable::parameter("n", Format::I64));
    let i = function.declare(Variable::local("i", Format::I64));
    function.body = vec![
        assign(i, int(0)),
        while_loop(
            less(var(i), var(n)),
            vec![assign(i, binary(BinaryOperator::Add, var(i), int(1)))],
        ),
        if_then(less(var(i), int(3)), vec![assign(i, int(3))], None),
        Node::ret(Some(var(i))),
    ];
    function
}

#[test]
fn test_labels_are_defined_once_and_targeted() {
    let stop = counted_loop("stop_at_five", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![if_then(
            Node::compare(Comparison::Equal, var(i), int(5)),
            vec![Node::new(NodeKind::Stop)],
            None,
        )]
    });
    let skip = counted_loop("skip_three", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![if_then(
            Node::compare(Comparison::Equal, var(i), int(3)),
            vec![
                assign(i, binary(BinaryOperator::Add, var(i), int(1))),
                Node::new(NodeKind::Continue),
            ],
            None,
        )]
    });
    let plain = counted_loop("plain", |_| Vec::new());

    for config in [TargetConfiguration::x64_linux(), TargetConfiguration::arm64_linux()] {
        for function in [&loop_then_branch(), &max(), &stop, &skip, &plain] {
            assert_labels_well_formed(&build(function, config));
        }
    }
}

/// `a = 0; b = 1; i = 0; while (i < n) { t = a + b; a = b; b = t; i = i + 1 } return a`
fn fibonacci() -> Function {
    let mut function = returning_i64("fibonacci");
    let n = function.declare(Variable::parameter("n", Format::I64));
    let a = function.declare(Variable::local("a", Format::I64));
    let b = function.declare(Variable::local("b", Format::I64));
    let i = function.declare(Variable::local("i", Format::I64));
    let t = function.declare(Variable::local("t", Format::I64));
    function.body = vec![
        assign(a, int(0)),
        assign(b, int(1)),
        assign(i, int(0)),
        while_loop(
            less(var(i), var(n)),
            vec![
                assign(t, binary(BinaryOperator::Add, var(a), var(b))),
                assign(a, var(b)),
                assign(b, var(t)),
                assign(i, binary(BinaryOperator::Add, var(i), int(1))),
            ],
        ),
        Node::ret(Some(var(a))),
    ];
    function
}

fn fibonacci_of(n: i64) -> i64 {
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

#[test]
fn test_loop_carried_swap_executes() {
    for config in [
        TargetConfiguration::x64_linux(),
        TargetConfiguration::x64_windows(),
        TargetConfiguration::arm64_linux(),
    ] {
        let lowered = build(&fibonacci(), config);
        for n in 0..12 {
            let result = execute(&lowered, &config, &[n], |name, _| panic!("unexpected call to {name}"));
            assert_eq!(result, fibonacci_of(n), "fibonacci({n}) on {config:?}");
        }
    }
}

#[test]
fn test_unset_variable_is_not_materialized() {
    let lowered = build(&fibonacci(), TargetConfiguration::x64_linux());
    // `a` and `i` start at zero; `t` is written before it is read and needs no initial value.
    assert_eq!(
        count(&lowered, |operation| matches!(operation, Operation::Clear { .. })),
        2
    );

    // Between the increment of `i` and the back-edge check only `a`, `b` and `i` move back
    // into their header registers.
    let operations: Vec<&Operation> = lowered.operations().collect();
    let increment = operations
        .iter()
        .rposition(|operation| matches!(operation, Operation::Arithmetic { .. }))
        .expect("loop increment");
    let back_edge = operations
        .iter()
        .rposition(|operation| matches!(operation, Operation::Compare { .. }))
        .expect("back-edge check");
    let moves = operations[increment..back_edge]
        .iter()
        .filter(|operation| matches!(operation, Operation::Move { .. }))
        .count();
    assert_eq!(moves, 3);
}

#[test]
fn test_loop_header_survives_calls() {
    let callee = signature("observe", &[Format::I64], None);
    let function = counted_loop("observed_sum", |function| {
        let i = unitlower::VariableId(function.variables.len() as u32 - 1);
        vec![call(&callee, vec![var(i)])]
    });

    for config in [
        TargetConfiguration::x64_linux(),
        TargetConfiguration::x64_windows(),
        TargetConfiguration::arm64_linux(),
    ] {
        let lowered = build(&function, config);
        let mut observed = Vec::new();
        let result = execute(&lowered, &config, &[6], |name, argument| {
            assert_eq!(name, "observe");
            observed.push(argument);
            -1
        });
        assert_eq!(result, 15, "on {config:?}");
        assert_eq!(observed, vec![0, 1, 2, 3, 4, 5], "on {config:?}");
    }
}

/// `v_k = x + k` for `count` locals, each incremented `n` times in a loop, then summed.
fn crowded_loop(count: usize) -> Function {
    let mut function = returning_i64("crowded_loop");
    let x = function.declare(Variable::parameter("x", Format::I64));
    let n = function.declare(Variable::parameter("n", Format::I64));
    let locals: Vec<_> = (0..count)
        .map(|k| function.declare(Variable::local(&format!("v{k}"), Format::I64)))
        .collect();
    let i = function.declare(Variable::local("i", Format::I64));
    let total = function.declare(Variable::local("total", Format::I64));

    let mut body: Vec<Node> = locals
        .iter()
        .enumerate()
        .map(|(k, &local)| assign(local, binary(BinaryOperator::Add, var(x), int(k as i64))))
        .collect();
    let mut increments: Vec<Node> = locals
        .iter()
        .map(|&local| assign(local, binary(BinaryOperator::Add, var(local), int(1))))
        .collect();
    increments.push(assign(i, binary(BinaryOperator::Add, var(i), int(1))));
    body.push(assign(i, int(0)));
    body.push(while_loop(less(var(i), var(n)), increments));
    body.push(assign(total, var(locals[0])));
    for &local in &locals[1..] {
        body.push(assign(total, binary(BinaryOperator::Add, var(total), var(local))));
    }
    body.push(Node::ret(Some(var(total))));
    function.body = body;
    function
}

#[test]
fn test_loop_header_survives_spills() {
    let locals = 16;
    let function = crowded_loop(locals);
    let expected = |x: i64, n: i64| {
        let locals = locals as i64;
        locals * (x + n) + locals * (locals - 1) / 2
    };

    let config = TargetConfiguration::x64_linux();
    let lowered = build(&function, config);
    assert!(lowered.statistics.spills > 0);
    for (x, n) in [(0, 0), (10, 1), (-4, 7)] {
        assert_eq!(execute(&lowered, &config, &[x, n], |_, _| 0), expected(x, n));
    }

    let config = TargetConfiguration::arm64_linux();
    let lowered = build(&function, config);
    assert_eq!(execute(&lowered, &config, &[3, 5], |_, _| 0), expected(3, 5));
}
