// This module holds the target-independent half of calling-convention lowering: the CCAssigner
// trait every convention implements, the per-argument CCAssignment record, and the
// classification helpers shared by the System V, Windows x64 and AAPCS64 assigners. An assigner
// hands out argument registers per bank until the bank's file is exhausted and then places the
// remaining arguments at ascending stack offsets in declaration order. Packs never reach an
// assigner whole: callers flatten them into scalar members first.

//! Calling convention interface.

use super::register_file::{AsmReg, RegBank};
use super::target::{CallingConvention, TargetConfiguration};
use super::value::Format;

/// Where one argument or parameter is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentLocation {
    Register(AsmReg),
    /// Offset inside the outgoing (caller) or incoming (callee) argument area.
    Stack(i32),
}

/// Argument attributes for calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAttribute {
    None,
    /// Hidden pointer to the caller's buffer for a large return value.
    StructRet,
    /// Implicit receiver pointer.
    SelfPointer,
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub bank: RegBank,
    pub size: u32,
    pub attribute: ArgAttribute,
    pub location: Option<ArgumentLocation>,
}

impl CCAssignment {
    pub fn new(format: Format) -> Self {
        Self {
            bank: format.bank(),
            size: format.bytes(),
            attribute: ArgAttribute::None,
            location: None,
        }
    }

    pub fn pointer(attribute: ArgAttribute) -> Self {
        Self {
            attribute,
            ..Self::new(Format::U64)
        }
    }

    pub fn register(&self) -> Option<AsmReg> {
        match self.location {
            Some(ArgumentLocation::Register(reg)) => Some(reg),
            _ => None,
        }
    }

    pub fn stack_offset(&self) -> Option<i32> {
        match self.location {
            Some(ArgumentLocation::Stack(offset)) => Some(offset),
            _ => None,
        }
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign an argument according to the calling convention.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value according to the calling convention.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new call or function.
    fn reset(&mut self);

    /// Stack space needed for arguments, including any reserved area.
    fn get_stack_size(&self) -> u32;

    /// Argument registers of one bank in assignment order.
    fn argument_registers(&self, bank: RegBank) -> &'static [AsmReg];
}

/// Align a value up to the specified power-of-two alignment.
pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Assigner for the configured target.
pub fn assigner_for(config: &TargetConfiguration) -> Box<dyn CCAssigner> {
    match config.calling_convention() {
        CallingConvention::SystemV => Box::new(crate::x64::SysVAssigner::new()),
        CallingConvention::WindowsX64 => Box::new(crate::x64::WindowsAssigner::new()),
        CallingConvention::Aapcs64 => Box::new(crate::arm64::Aapcs64Assigner::new()),
    }
}

/// Locations of a full argument list: optional struct-return pointer, optional receiver, then
/// the scalar members of the declared arguments. Returns the assignments in that order and the
/// stack size the list needs.
pub fn assign_arguments(
    config: &TargetConfiguration,
    struct_return: bool,
    has_self: bool,
    formats: &[Format],
) -> (Vec<CCAssignment>, u32) {
    let mut assigner = assigner_for(config);
    let mut assignments = Vec::with_capacity(formats.len() + 2);
    if struct_return {
        let mut arg = CCAssignment::pointer(ArgAttribute::StructRet);
        assigner.assign_arg(&mut arg);
        assignments.push(arg);
    }
    if has_self {
        let mut arg = CCAssignment::pointer(ArgAttribute::SelfPointer);
        assigner.assign_arg(&mut arg);
        assignments.push(arg);
    }
    for &format in formats {
        let mut arg = CCAssignment::new(format);
        assigner.assign_arg(&mut arg);
        assignments.push(arg);
    }
    (assignments, assigner.get_stack_size())
}
