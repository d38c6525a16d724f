// This module implements the two x86-64 calling conventions. System V (Linux, macOS) passes the
// first six integer-class arguments in RDI, RSI, RDX, RCX, R8, R9 and the first eight decimal
// arguments in XMM0-XMM7. Windows x64 has four registers per class (RCX, RDX, R8, R9 and
// XMM0-XMM3), each class consumed independently, and the caller always reserves 32 bytes of
// shadow space below the stack arguments, so stack arguments start at offset 32. Remaining
// arguments go to the stack in 8-byte slots in declaration order; returns use RAX or XMM0.

//! x86-64 calling conventions (System V and Windows x64).

use super::{R8, R9, RAX, RCX, RDI, RDX, RSI, XMM0};
use crate::core::calling_convention::{align_up, ArgumentLocation, CCAssigner, CCAssignment};
use crate::core::register_file::{AsmReg, RegBank};

/// System V x86-64 calling convention assigner.
///
/// - First 6 integer args in RDI, RSI, RDX, RCX, R8, R9
/// - First 8 decimal args in XMM0-XMM7
/// - Remaining args on stack
/// - Return values in RAX (integer) or XMM0 (decimal)
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    xmm_cnt: usize,
    stack: u32,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    /// System V x86-64 XMM argument registers.
    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::decimal(0),
        AsmReg::decimal(1),
        AsmReg::decimal(2),
        AsmReg::decimal(3),
        AsmReg::decimal(4),
        AsmReg::decimal(5),
        AsmReg::decimal(6),
        AsmReg::decimal(7),
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of GP argument registers used so far.
    pub fn gp_used(&self) -> usize {
        self.gp_cnt
    }

    /// Number of XMM argument registers used so far.
    pub fn xmm_used(&self) -> usize {
        self.xmm_cnt
    }
}

/// Hand out the next register of `file`, or the next stack slot.
fn next_location(file: &[AsmReg], count: &mut usize, stack: &mut u32) -> ArgumentLocation {
    if let Some(&reg) = file.get(*count) {
        *count += 1;
        ArgumentLocation::Register(reg)
    } else {
        let offset = *stack;
        *stack += 8;
        ArgumentLocation::Stack(offset as i32)
    }
}

fn return_location(bank: RegBank) -> ArgumentLocation {
    match bank {
        RegBank::General => ArgumentLocation::Register(RAX),
        RegBank::Decimal => ArgumentLocation::Register(XMM0),
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        arg.location = Some(match arg.bank {
            RegBank::General => next_location(&Self::GP_ARG_REGS, &mut self.gp_cnt, &mut self.stack),
            RegBank::Decimal => {
                next_location(&Self::XMM_ARG_REGS, &mut self.xmm_cnt, &mut self.stack)
            }
        });
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.location = Some(return_location(arg.bank));
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn get_stack_size(&self) -> u32 {
        // Align stack to 16-byte boundary as required by System V ABI
        align_up(self.stack, 16)
    }

    fn argument_registers(&self, bank: RegBank) -> &'static [AsmReg] {
        match bank {
            RegBank::General => &Self::GP_ARG_REGS,
            RegBank::Decimal => &Self::XMM_ARG_REGS,
        }
    }
}

/// Windows x64 calling convention assigner.
#[derive(Debug)]
pub struct WindowsAssigner {
    gp_cnt: usize,
    xmm_cnt: usize,
    stack: u32,
}

impl Default for WindowsAssigner {
    fn default() -> Self {
        Self {
            gp_cnt: 0,
            xmm_cnt: 0,
            stack: Self::SHADOW_SPACE,
        }
    }
}

impl WindowsAssigner {
    pub const GP_ARG_REGS: [AsmReg; 4] = [RCX, RDX, R8, R9];

    pub const XMM_ARG_REGS: [AsmReg; 4] = [
        AsmReg::decimal(0),
        AsmReg::decimal(1),
        AsmReg::decimal(2),
        AsmReg::decimal(3),
    ];

    /// One 8-byte home slot for each of the four register parameter positions.
    pub const SHADOW_SPACE: u32 = 32;

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for WindowsAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        arg.location = Some(match arg.bank {
            RegBank::General => next_location(&Self::GP_ARG_REGS, &mut self.gp_cnt, &mut self.stack),
            RegBank::Decimal => {
                next_location(&Self::XMM_ARG_REGS, &mut self.xmm_cnt, &mut self.stack)
            }
        });
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.location = Some(return_location(arg.bank));
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn get_stack_size(&self) -> u32 {
        align_up(self.stack, 16)
    }

    fn argument_registers(&self, bank: RegBank) -> &'static [AsmReg] {
        match bank {
            RegBank::General => &Self::GP_ARG_REGS,
            RegBank::Decimal => &Self::XMM_ARG_REGS,
        }
    }
}
