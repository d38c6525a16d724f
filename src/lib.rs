//! unitlower - instruction lowering and register allocation for a compiler backend.
//!
//! The crate takes a resolved syntax tree of one function and turns it into a flat list of
//! target operations over physical registers and stack slots. Lowering appends virtual
//! instructions to a per-function [`Unit`]; the Unit then simulates liveness and builds the
//! final operations, allocating registers on the fly and inserting the moves needed at every
//! control-flow join.
//!
//! # Primary Usage
//!
//! ```ignore
//! use unitlower::core::{CompilationSession, TargetConfiguration};
//! use unitlower::lower_program;
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let results = lower_program(&functions, TargetConfiguration::x64_linux(), &session);
//! println!("{}", session.stats());
//! ```
//!
//! # Architecture
//!
//! - [`tree`] - Resolved input tree
//! - [`lower`] - Syntax-tree lowering (branches, loops, calls, conditions, arithmetic)
//! - [`core`] - Values, register file, instructions, Unit passes, session
//! - [`x64`] - x86-64 registers and the System V and Windows conventions
//! - [`arm64`] - AArch64 registers and the AAPCS64 convention

pub mod arm64;
pub mod core;
pub mod lower;
pub mod tree;
pub mod x64;

pub use core::{
    // Values and locations
    Constant, Format, Location, ValueId, ValueTable,
    // Register allocation
    AsmReg, RegAllocError, RegBank, RegBitSet, RegisterFile,
    // Instructions
    InstructionKind, MachineInstruction, Operation, Unit,
    // Results and configuration
    LoweredFunction, LoweringError, LoweringResult, TargetConfiguration,
    // Session management
    CompilationSession, SessionStats,
};
pub use lower::{lower_function, lower_program, FunctionLowering};
pub use tree::{Function, Node, NodeKind, Variable, VariableId};
