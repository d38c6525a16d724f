// This module defines the error types of the lowering engine using the thiserror crate. Every
// failure this layer can report is a compiler defect rather than a user diagnostic: either a
// syntax node reached the engine without a lowering rule (UnsupportedConstruct) or an internal
// invariant was broken (InvariantViolation), e.g. a pseudo instruction reached the build pass,
// a call was emitted while a volatile register still held a live value, or a scope merge found
// a constant destination. Register file failures are wrapped transparently. LoweringResult<T>
// is the alias used by every routine that lowers, simulates or builds instructions.

//! Error types for the lowering engine.

use thiserror::Error;

use super::register_file::RegAllocError;

/// Main error type for lowering a function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    #[error("Unsupported construct: {construct}")]
    UnsupportedConstruct { construct: String },

    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    #[error("Register allocation failed: {0}")]
    RegisterAllocation(#[from] RegAllocError),

    #[error("Variable {variable} is not declared in this function")]
    UnknownVariable { variable: u32 },
}

impl LoweringError {
    pub fn unsupported(construct: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            construct: construct.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }
}

/// Result type alias for lowering operations.
pub type LoweringResult<T> = Result<T, LoweringError>;
