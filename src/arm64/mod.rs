// This module holds the AArch64 side of the lowering engine: register naming for the 31 general
// purpose registers (x0-x30) and the 32 SIMD/floating point registers used as doubles (d0-d31),
// plus the AAPCS64 calling convention. x16 and d31 are kept out of allocation as scratch
// registers, x18 is the platform register, x29/x30 are the frame pointer and link register.

//! ARM64/AArch64 architecture-specific components.

pub mod calling_convention;

pub use calling_convention::Aapcs64Assigner;

use crate::core::register_file::AsmReg;

pub const X0: AsmReg = AsmReg::general(0);
pub const X16: AsmReg = AsmReg::general(16);
pub const X18: AsmReg = AsmReg::general(18);
pub const FP: AsmReg = AsmReg::general(29);
pub const LR: AsmReg = AsmReg::general(30);
pub const SP: AsmReg = AsmReg::general(31);
pub const D0: AsmReg = AsmReg::decimal(0);
pub const D31: AsmReg = AsmReg::decimal(31);

/// Register name for display.
pub fn register_name(reg: AsmReg) -> String {
    use crate::core::register_file::RegBank;
    match (reg.bank, reg.id) {
        (RegBank::General, 29) => "fp".to_string(),
        (RegBank::General, 30) => "lr".to_string(),
        (RegBank::General, 31) => "sp".to_string(),
        (RegBank::General, id) => format!("x{id}"),
        (RegBank::Decimal, id) => format!("d{id}"),
    }
}
