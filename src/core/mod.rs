// This module is the hub of the lowering engine's target-independent core. It groups the data
// model (values, cells and locations), the instruction catalogue, the register file with its
// selection policy, the stack frame, calling-convention assignment, parallel move resolution
// and the Unit that runs simulate, build and post-build over one function. Syntax-tree lowering
// sits on top of this module and only talks to it through the Unit.

//! Core lowering infrastructure.
//!
//! # Key Components
//!
//! ## Values (`value`)
//! - Virtual values pointing at shared location cells
//! - Per-cell liveness computed by simulation
//!
//! ## Register Allocation (`register_file`)
//! - Free, dead-holder and least-recently-assigned selection
//! - Lock counts and volatile/non-volatile pools
//!
//! ## Instruction Buffer (`unit`)
//! - Two-pass simulate/build over appended instructions
//! - Scope snapshots and merge moves at control-flow joins
//!
//! ## Calling Conventions (`calling_convention`)
//! - The `CCAssigner` trait implemented per target in `x64` and `arm64`

pub mod calling_convention;
pub mod error;
pub mod frame;
pub mod instruction;
pub mod parallel_move;
pub mod register_file;
pub mod session;
pub mod target;
pub mod unit;
pub mod value;

pub use calling_convention::{
    assign_arguments, assigner_for, ArgAttribute, ArgumentLocation, CCAssigner, CCAssignment,
};
pub use error::{LoweringError, LoweringResult};
pub use frame::StackFrame;
pub use instruction::{
    ArithmeticOperator, CallArgument, Condition, Instruction, InstructionKind, LabelId,
    MachineInstruction, MergeBinding, MoveVariant, Operation, ScopeId,
};
pub use register_file::{AsmReg, PoolPreference, RegAllocError, RegBank, RegBitSet, RegisterFile};
pub use session::{CompilationSession, SessionStats};
pub use target::{Architecture, CallingConvention, OperatingSystem, TargetConfiguration};
pub use unit::{LoweredFunction, Unit, UnitStatistics};
pub use value::{
    Constant, Format, Location, Metadata, Position, StackBase, StackSlot, SymbolId, ValueId,
    ValueTable,
};
