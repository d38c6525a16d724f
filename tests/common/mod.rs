//! Builders and inspection helpers shared by the integration tests.

#![allow(dead_code)]

pub mod machine;

use unitlower::core::{ArithmeticOperator, Constant, Location, Operation};
use unitlower::tree::{BinaryOperator, Comparison, Signature, ValueType};
use unitlower::{
    lower_function, Format, Function, LoweredFunction, Node, NodeKind, TargetConfiguration,
    VariableId,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn var(id: VariableId) -> Node {
    Node::variable(id)
}

pub fn int(value: i64) -> Node {
    Node::integer(value, Format::I64)
}

pub fn binary(operator: BinaryOperator, left: Node, right: Node) -> Node {
    Node::binary(operator, left, right, Format::I64)
}

pub fn assign(id: VariableId, value: Node) -> Node {
    Node::assign(var(id), value)
}

pub fn less(left: Node, right: Node) -> Node {
    Node::compare(Comparison::Less, left, right)
}

pub fn if_then(condition: Node, body: Vec<Node>, otherwise: Option<Vec<Node>>) -> Node {
    Node::new(NodeKind::If {
        condition: Box::new(condition),
        body,
        otherwise,
    })
}

pub fn while_loop(condition: Node, body: Vec<Node>) -> Node {
    Node::new(NodeKind::Loop {
        initialization: Vec::new(),
        condition: Some(Box::new(condition)),
        action: Vec::new(),
        body,
    })
}

pub fn call(signature: &Signature, arguments: Vec<Node>) -> Node {
    Node::new(NodeKind::Call {
        signature: signature.clone(),
        receiver: None,
        arguments,
    })
}

/// Callee taking `parameters` and returning one value of `returns`.
pub fn signature(name: &str, parameters: &[Format], returns: Option<Format>) -> Signature {
    Signature {
        name: name.to_string(),
        parameters: parameters.iter().map(|f| ValueType::Scalar(*f)).collect(),
        returns: returns.map(ValueType::Scalar),
        has_self: false,
    }
}

pub fn returning_i64(name: &str) -> Function {
    let mut function = Function::new(name);
    function.returns = Some(ValueType::Scalar(Format::I64));
    function
}

/// Lower and build, printing the listing for failing-test diagnostics.
pub fn build(function: &Function, config: TargetConfiguration) -> LoweredFunction {
    init_logging();
    let lowered = lower_function(function, config)
        .unwrap_or_else(|error| panic!("{} failed to lower: {error}", function.name));
    println!("{}", lowered.render(&config));
    lowered
}

pub fn count(lowered: &LoweredFunction, predicate: impl Fn(&Operation) -> bool) -> usize {
    lowered.operations().filter(|operation| predicate(operation)).count()
}

pub fn arithmetic_count(lowered: &LoweredFunction, operator: ArithmeticOperator) -> usize {
    count(lowered, |operation| {
        matches!(operation, Operation::Arithmetic { operator: o, .. } if *o == operator)
    })
}

/// Shift (or other arithmetic) by an immediate.
pub fn has_immediate_op(lowered: &LoweredFunction, operator: ArithmeticOperator, amount: i64) -> bool {
    lowered.operations().any(|operation| {
        matches!(
            operation,
            Operation::Arithmetic { operator: o, second: Location::Constant(Constant::Integer(v)), .. }
                if *o == operator && *v == amount
        )
    })
}

pub fn is_divide(operation: &Operation) -> bool {
    matches!(operation, Operation::Divide { .. })
}

pub fn is_call(operation: &Operation) -> bool {
    matches!(operation, Operation::Call { .. })
}

/// Every label is defined once and targeted by at least one jump.
pub fn assert_labels_well_formed(lowered: &LoweredFunction) {
    let mut defined = Vec::new();
    for operation in lowered.operations() {
        if let Operation::Label(label) = operation {
            assert!(!defined.contains(label), "{label} defined twice in {}", lowered.name);
            defined.push(*label);
        }
    }
    for label in &defined {
        assert!(
            lowered.operations().any(|operation| matches!(
                operation,
                Operation::Jump { label: target, .. } if target == label
            )),
            "{label} is never targeted in {}",
            lowered.name
        );
    }
    for operation in lowered.operations() {
        if let Operation::Jump { label, .. } = operation {
            assert!(defined.contains(label), "{label} is targeted but never defined");
        }
    }
}
