//! Test call lowering across the supported calling conventions.
//!
//! These tests verify argument placement in registers and on the stack, the Windows shadow
//! space, hidden struct-return pointers, decimal arguments and that values live across a call
//! survive it in non-volatile registers.

mod common;

use common::*;
use unitlower::core::{Constant, Location, Operation, StackBase, StackSlot};
use unitlower::tree::{BinaryOperator, Signature, ValueType};
use unitlower::{
    arm64, lower_function, x64, AsmReg, Format, Function, LoweredFunction, LoweringError, Node,
    NodeKind, TargetConfiguration, Variable,
};

fn moves_into(lowered: &LoweredFunction, destination: Location) -> usize {
    count(lowered, |operation| {
        matches!(operation, Operation::Move { destination: d, .. } if *d == destination)
    })
}

/// Source of the only move into `destination`.
fn source_of(lowered: &LoweredFunction, destination: Location) -> Option<Location> {
    let sources: Vec<Location> = lowered
        .operations()
        .filter_map(|operation| match operation {
            Operation::Move {
                destination: d,
                source,
                ..
            } if *d == destination => Some(*source),
            _ => None,
        })
        .collect();
    match sources.as_slice() {
        [source] => Some(*source),
        _ => None,
    }
}

fn constant(value: i64) -> Location {
    Location::Constant(Constant::Integer(value))
}

fn outgoing(offset: i32) -> Location {
    Location::Stack(StackSlot {
        base: StackBase::Outgoing,
        offset,
    })
}

/// `return callee(1, 2, ..., arguments)`
fn call_with_constants(arguments: i64) -> Function {
    let formats = vec![Format::I64; arguments as usize];
    let callee = signature("callee", &formats, Some(Format::I64));
    let mut function = returning_i64("caller");
    function.body = vec![Node::ret(Some(call(
        &callee,
        (1..=arguments).map(int).collect(),
    )))];
    function
}

#[test]
fn test_system_v_stack_arguments() {
    let lowered = build(&call_with_constants(8), TargetConfiguration::x64_linux());

    for reg in x64::SysVAssigner::GP_ARG_REGS {
        assert_eq!(moves_into(&lowered, Location::Register(reg)), 1, "{reg:?}");
    }
    // Arguments past the sixth go to the stack in declaration order.
    assert_eq!(source_of(&lowered, outgoing(0)), Some(constant(7)));
    assert_eq!(source_of(&lowered, outgoing(8)), Some(constant(8)));
    assert_eq!(count(&lowered, is_call), 1);
    assert!(lowered.frame_size >= 16);
    assert_eq!(lowered.frame_size % 16, 0);
}

#[test]
fn test_windows_shadow_space() {
    let lowered = build(&call_with_constants(5), TargetConfiguration::x64_windows());

    for reg in x64::WindowsAssigner::GP_ARG_REGS {
        assert_eq!(moves_into(&lowered, Location::Register(reg)), 1, "{reg:?}");
    }
    assert_eq!(moves_into(&lowered, outgoing(0)), 0);
    assert_eq!(moves_into(&lowered, outgoing(32)), 1);
    assert!(lowered.frame_size >= 48);
}

#[test]
fn test_arm64_stack_arguments() {
    let lowered = build(&call_with_constants(9), TargetConfiguration::arm64_linux());

    assert_eq!(source_of(&lowered, Location::Register(arm64::X0)), Some(constant(1)));
    // Immediates are staged through the scratch register before reaching the stack.
    let scratch = Location::Register(arm64::X16);
    assert_eq!(source_of(&lowered, outgoing(0)), Some(scratch));
    let operations: Vec<&Operation> = lowered.operations().collect();
    let store = operations
        .iter()
        .position(|operation| {
            matches!(operation, Operation::Move { destination, .. } if *destination == outgoing(0))
        })
        .expect("ninth argument not stored");
    assert!(matches!(
        operations[store - 1],
        Operation::Move { destination, source, .. }
            if *destination == scratch && *source == constant(9)
    ));
}

#[test]
fn test_decimal_argument_in_vector_register() {
    let callee = signature("scale", &[Format::I64, Format::Decimal], Some(Format::I64));
    let mut function = returning_i64("caller");
    let x = function.declare(Variable::parameter("x", Format::I64));
    function.body = vec![Node::ret(Some(call(&callee, vec![var(x), Node::decimal(1.5)])))];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Move { destination: Location::Register(reg), format: Format::Decimal, .. }
            if *reg == x64::XMM0
    )));

    // Each class has its own counter, so the decimal still takes the first vector register.
    let lowered = build(&function, TargetConfiguration::x64_windows());
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Move { destination: Location::Register(reg), format: Format::Decimal, .. }
            if *reg == x64::XMM0
    )));
}

#[test]
fn test_integer_argument_converted_to_decimal() {
    let callee = signature("half", &[Format::Decimal], Some(Format::Decimal));
    let mut function = Function::new("caller");
    function.returns = Some(ValueType::Scalar(Format::Decimal));
    let x = function.declare(Variable::parameter("x", Format::I64));
    function.body = vec![Node::ret(Some(call(&callee, vec![var(x)])))];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert!(lowered.operations().any(|operation| matches!(
        operation,
        Operation::Move { format: Format::Decimal, source_format: Format::I64, .. }
    )));
}

#[test]
fn test_value_live_across_call_survives() {
    let callee = signature("next", &[Format::I64], Some(Format::I64));
    let mut function = returning_i64("caller");
    let x = function.declare(Variable::parameter("x", Format::I64));
    let y = function.declare(Variable::local("y", Format::I64));
    function.body = vec![
        assign(y, call(&callee, vec![var(x)])),
        Node::ret(Some(binary(BinaryOperator::Add, var(x), var(y)))),
    ];

    let config = TargetConfiguration::x64_linux();
    let lowered = build(&function, config);
    assert!(!lowered.saved_registers.is_empty());
    let volatile = config.volatile_registers();
    assert!(lowered
        .saved_registers
        .iter()
        .all(|reg: &AsmReg| !volatile.contains(*reg)));
}

#[test]
fn test_struct_return_through_caller_buffer() {
    let callee = Signature {
        name: "pair".to_string(),
        parameters: vec![ValueType::Scalar(Format::I64)],
        returns: Some(ValueType::Pack(vec![
            ValueType::Scalar(Format::I64),
            ValueType::Scalar(Format::I64),
        ])),
        has_self: false,
    };
    let mut function = Function::new("forward_pair");
    let x = function.declare(Variable::parameter("x", Format::I64));
    function.returns = callee.returns.clone();
    function.body = vec![Node::ret(Some(call(&callee, vec![var(x)])))];

    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(
        count(&lowered, |operation| matches!(operation, Operation::LoadAddress { .. })),
        1
    );
    assert_eq!(count(&lowered, is_call), 1);
    // Both members are read back from the local buffer and stored through the hidden pointer.
    let frame_reads = count(&lowered, |operation| {
        matches!(
            operation,
            Operation::Move { source: Location::Stack(StackSlot { base: StackBase::Frame, .. }), .. }
        )
    });
    assert!(frame_reads >= 2);
    let pointer_writes = count(&lowered, |operation| {
        matches!(operation, Operation::Move { destination: Location::Address(_), .. })
    });
    assert_eq!(pointer_writes, 2);
    // The hidden pointer is returned and had to survive the call.
    assert!(moves_into(&lowered, Location::Register(x64::RAX)) >= 1);
    assert!(!lowered.saved_registers.is_empty());
    assert!(lowered.frame_size >= 16);
}

#[test]
fn test_argument_count_mismatch() {
    init_logging();
    let callee = signature("two", &[Format::I64, Format::I64], None);
    let mut function = Function::new("caller");
    function.body = vec![call(&callee, vec![int(1)])];

    let result = lower_function(&function, TargetConfiguration::x64_linux());
    assert!(matches!(result, Err(LoweringError::InvariantViolation { .. })));
}

#[test]
fn test_method_call_without_receiver() {
    init_logging();
    let mut method = signature("method", &[], None);
    method.has_self = true;
    let mut function = Function::new("free_function");
    function.body = vec![call(&method, Vec::new())];

    let result = lower_function(&function, TargetConfiguration::x64_linux());
    assert!(matches!(result, Err(LoweringError::UnsupportedConstruct { .. })));
}

#[test]
fn test_method_call_forwards_receiver() {
    let mut method = signature("method", &[Format::I64], Some(Format::I64));
    method.has_self = true;
    let mut function = returning_i64("other_method");
    function.has_self = true;
    let x = function.declare(Variable::parameter("x", Format::I64));
    function.body = vec![Node::ret(Some(Node::new(NodeKind::Call {
        signature: method,
        receiver: None,
        arguments: vec![var(x)],
    })))];

    // Receiver and argument already sit in the registers the callee expects.
    let lowered = build(&function, TargetConfiguration::x64_linux());
    assert_eq!(moves_into(&lowered, Location::Register(x64::RDI)), 0);
    assert_eq!(moves_into(&lowered, Location::Register(x64::RSI)), 0);
    assert_eq!(count(&lowered, is_call), 1);
}
