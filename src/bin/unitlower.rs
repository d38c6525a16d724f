//! Lower a set of built-in demo functions and print their listings.
//!
//! ```text
//! unitlower --arch arm64 --verbose
//! RUST_LOG=unitlower=trace unitlower --function sum_to
//! ```

use bumpalo::Bump;
use clap::{Parser, ValueEnum};

use unitlower::core::{Architecture, OperatingSystem};
use unitlower::tree::{BinaryOperator, Comparison, Signature, ValueType};
use unitlower::{
    lower_program, CompilationSession, Format, Function, Node, NodeKind, TargetConfiguration,
    Variable,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Arch {
    X64,
    Arm64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Os {
    Linux,
    Windows,
}

#[derive(Debug, Parser)]
#[command(version, about = "Lower demo functions to target operations", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "x64")]
    arch: Arch,

    #[arg(long, value_enum, default_value = "linux")]
    os: Os,

    /// Keep every local and parameter in a stack home
    #[arg(long)]
    debuggable: bool,

    /// Emit source position markers
    #[arg(long)]
    positions: bool,

    /// Only lower the named function
    #[arg(long)]
    function: Option<String>,

    /// Print frame details and session statistics, and log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn var(id: unitlower::VariableId) -> Node {
    Node::variable(id)
}

fn int(value: i64) -> Node {
    Node::integer(value, Format::I64)
}

/// `a = a / 6; return a`
fn divide_by_six() -> Function {
    let mut function = Function::new("divide_by_six");
    let a = function.declare(Variable::parameter("a", Format::I64));
    function.returns = Some(ValueType::Scalar(Format::I64));
    function.body = vec![
        Node::assign(
            var(a),
            Node::binary(BinaryOperator::Divide, var(a), int(6), Format::I64),
        )
        .at(1, 1),
        Node::ret(Some(var(a))).at(2, 1),
    ];
    function
}

/// `total = 0; for (i = 0; i < n; i = i + 1) total = total + i * 3; return total`
fn sum_to() -> Function {
    let mut function = Function::new("sum_to");
    let n = function.declare(Variable::parameter("n", Format::I64));
    let total = function.declare(Variable::local("total", Format::I64));
    let i = function.declare(Variable::local("i", Format::I64));
    function.returns = Some(ValueType::Scalar(Format::I64));
    function.body = vec![
        Node::assign(var(total), int(0)).at(1, 1),
        Node::new(NodeKind::Loop {
            initialization: vec![Node::assign(var(i), int(0))],
            condition: Some(Box::new(Node::compare(Comparison::Less, var(i), var(n)))),
            action: vec![Node::assign(
                var(i),
                Node::binary(BinaryOperator::Add, var(i), int(1), Format::I64),
            )],
            body: vec![Node::assign(
                var(total),
                Node::binary(
                    BinaryOperator::Add,
                    var(total),
                    Node::binary(BinaryOperator::Multiply, var(i), int(3), Format::I64),
                    Format::I64,
                ),
            )
            .at(3, 5)],
        })
        .at(2, 1),
        Node::ret(Some(var(total))).at(5, 1),
    ];
    function
}

/// `if (a > b && b != 0) { a = a - b } return combine(a, b, 1.5)`
fn call_with_branch() -> Function {
    let mut function = Function::new("call_with_branch");
    let a = function.declare(Variable::parameter("a", Format::I64));
    let b = function.declare(Variable::parameter("b", Format::I64));
    function.returns = Some(ValueType::Scalar(Format::I64));
    let combine = Signature {
        name: "combine".to_string(),
        parameters: vec![
            ValueType::Scalar(Format::I64),
            ValueType::Scalar(Format::I64),
            ValueType::Scalar(Format::Decimal),
        ],
        returns: Some(ValueType::Scalar(Format::I64)),
        has_self: false,
    };
    function.body = vec![
        Node::new(NodeKind::If {
            condition: Box::new(Node::new(NodeKind::And(
                Box::new(Node::compare(Comparison::Greater, var(a), var(b))),
                Box::new(Node::compare(Comparison::NotEqual, var(b), int(0))),
            ))),
            body: vec![Node::assign(
                var(a),
                Node::binary(BinaryOperator::Subtract, var(a), var(b), Format::I64),
            )],
            otherwise: None,
        })
        .at(1, 1),
        Node::ret(Some(Node::new(NodeKind::Call {
            signature: combine,
            receiver: None,
            arguments: vec![var(a), var(b), Node::decimal(1.5)],
        })))
        .at(2, 1),
    ];
    function
}

/// `return (x * 8, x % 7)` through a caller buffer
fn split() -> Function {
    let mut function = Function::new("split");
    let x = function.declare(Variable::parameter("x", Format::I64));
    function.returns = Some(ValueType::Pack(vec![
        ValueType::Scalar(Format::I64),
        ValueType::Scalar(Format::I64),
    ]));
    function.body = vec![Node::ret(Some(Node::new(NodeKind::Pack(vec![
        Node::binary(BinaryOperator::Multiply, var(x), int(8), Format::I64),
        Node::binary(BinaryOperator::Modulus, var(x), int(7), Format::I64),
    ]))))];
    function
}

fn main() {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let architecture = match args.arch {
        Arch::X64 => Architecture::X64,
        Arch::Arm64 => Architecture::Arm64,
    };
    let system = match args.os {
        Os::Linux => OperatingSystem::Linux,
        Os::Windows => OperatingSystem::Windows,
    };
    let config = TargetConfiguration::new(architecture, system)
        .with_debuggable(args.debuggable)
        .with_debug_positions(args.positions);

    let functions: Vec<Function> = [divide_by_six(), sum_to(), call_with_branch(), split()]
        .into_iter()
        .filter(|function| args.function.as_ref().map_or(true, |name| *name == function.name))
        .collect();
    if functions.is_empty() {
        eprintln!("no demo function named {}", args.function.unwrap_or_default());
        std::process::exit(1);
    }

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut failed = false;
    for (function, result) in functions.iter().zip(lower_program(&functions, config, &session)) {
        match result {
            Ok(lowered) => {
                print!("{}", lowered.render(&config));
                if args.verbose {
                    println!(
                        "  ; frame {} bytes, saved {}",
                        lowered.frame_size,
                        lowered
                            .saved_registers
                            .iter()
                            .map(|reg| config.register_name(*reg))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                println!();
            }
            Err(error) => {
                eprintln!("{}: {error}", function.name);
                failed = true;
            }
        }
    }

    if args.verbose {
        print!("{}", session.stats());
    }
    if failed {
        std::process::exit(1);
    }
}
