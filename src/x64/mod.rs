//! x86-64 architecture-specific components.
//!
//! This module contains the x86-64 register naming and the two calling conventions
//! (System V and Windows x64) used by call lowering.

pub mod calling_convention;

pub use calling_convention::{SysVAssigner, WindowsAssigner};

use crate::core::register_file::AsmReg;

pub const RAX: AsmReg = AsmReg::general(0);
pub const RCX: AsmReg = AsmReg::general(1);
pub const RDX: AsmReg = AsmReg::general(2);
pub const RBX: AsmReg = AsmReg::general(3);
pub const RSP: AsmReg = AsmReg::general(4);
pub const RBP: AsmReg = AsmReg::general(5);
pub const RSI: AsmReg = AsmReg::general(6);
pub const RDI: AsmReg = AsmReg::general(7);
pub const R8: AsmReg = AsmReg::general(8);
pub const R9: AsmReg = AsmReg::general(9);
pub const R10: AsmReg = AsmReg::general(10);
pub const R11: AsmReg = AsmReg::general(11);
pub const XMM0: AsmReg = AsmReg::decimal(0);
pub const XMM15: AsmReg = AsmReg::decimal(15);

pub const GENERAL_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

pub const DECIMAL_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];
