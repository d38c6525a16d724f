//! Test lowering a whole program through one compilation session.

mod common;

use bumpalo::Bump;
use common::*;
use unitlower::tree::BinaryOperator;
use unitlower::{
    lower_program, CompilationSession, Format, Function, Node, NodeKind, TargetConfiguration,
    Variable,
};

fn program() -> Vec<Function> {
    let square = signature("square", &[Format::I64], Some(Format::I64));

    let mut caller = returning_i64("sum_of_squares");
    let a = caller.declare(Variable::parameter("a", Format::I64));
    let b = caller.declare(Variable::parameter("b", Format::I64));
    let first = caller.declare(Variable::local("first", Format::I64));
    caller.body = vec![
        assign(first, call(&square, vec![var(a)])),
        Node::ret(Some(binary(
            BinaryOperator::Add,
            var(first),
            call(&square, vec![var(b)]),
        ))),
    ];

    let mut callee = returning_i64("square");
    let x = callee.declare(Variable::parameter("x", Format::I64));
    callee.body = vec![Node::ret(Some(binary(BinaryOperator::Multiply, var(x), var(x))))];

    let mut broken = Function::new("broken");
    broken.body = vec![Node::new(NodeKind::Continue)];

    vec![caller, callee, broken]
}

#[test]
fn test_program_statistics() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let functions = program();

    let results = lower_program(&functions, TargetConfiguration::x64_linux(), &session);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(results[2].is_err());

    let stats = session.stats();
    assert_eq!(stats.functions_lowered, 2);
    assert_eq!(stats.functions_failed, 1);
    assert_eq!(stats.calls_lowered, 2);
    assert!(stats.moves_inserted > 0);

    let mut symbols = session.symbols();
    symbols.sort_unstable();
    assert_eq!(symbols, vec!["broken", "square", "sum_of_squares"]);
    assert!(format!("{stats}").contains("Functions failed: 1"));
}

#[test]
fn test_program_on_every_target() {
    init_logging();
    for config in [
        TargetConfiguration::x64_linux(),
        TargetConfiguration::x64_windows(),
        TargetConfiguration::arm64_linux(),
    ] {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let functions = program();
        let results = lower_program(&functions[..2], config, &session);
        for (function, result) in functions.iter().zip(&results) {
            let lowered = result
                .as_ref()
                .unwrap_or_else(|error| panic!("{} on {config:?}: {error}", function.name));
            println!("{}", lowered.render(&config));
        }
        assert_eq!(session.stats().functions_failed, 0);
    }
}
