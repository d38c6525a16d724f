//! AAPCS64 calling convention.
//!
//! - First 8 integer args in X0-X7
//! - First 8 decimal args in D0-D7
//! - Remaining args on stack in 8-byte slots, declaration order
//! - Return values in X0 (integer) or D0 (decimal)

use super::{D0, X0};
use crate::core::calling_convention::{align_up, ArgumentLocation, CCAssigner, CCAssignment};
use crate::core::register_file::{AsmReg, RegBank};

#[derive(Debug, Default)]
pub struct Aapcs64Assigner {
    gp_cnt: usize,
    fp_cnt: usize,
    stack: u32,
}

impl Aapcs64Assigner {
    pub const GP_ARG_REGS: [AsmReg; 8] = [
        AsmReg::general(0),
        AsmReg::general(1),
        AsmReg::general(2),
        AsmReg::general(3),
        AsmReg::general(4),
        AsmReg::general(5),
        AsmReg::general(6),
        AsmReg::general(7),
    ];

    pub const FP_ARG_REGS: [AsmReg; 8] = [
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
}

impl CCAssigner for Aapcs64Assigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        let (file, count) = match arg.bank {
            RegBank::General => (&Self::GP_ARG_REGS, &mut self.gp_cnt),
            RegBank::Decimal => (&Self::FP_ARG_REGS, &mut self.fp_cnt),
        };
        arg.location = Some(match file.get(*count) {
            Some(&reg) => {
                *count += 1;
                ArgumentLocation::Register(reg)
            }
            None => {
                let offset = self.stack;
                self.stack += 8;
                ArgumentLocation::Stack(offset as i32)
            }
        });
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.location = Some(ArgumentLocation::Register(match arg.bank {
            RegBank::General => X0,
            RegBank::Decimal => D0,
        }));
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
            RegBank::Decimal => &Self::FP_ARG_REGS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Format;

    #[test]
    fn test_aapcs64_uses_eight_registers_per_class() {
        let mut assigner = Aapcs64Assigner::new();
        let mut locations = Vec::new();
        for _ in 0..9 {
            let mut arg = CCAssignment::new(Format::I64);
            assigner.assign_arg(&mut arg);
            locations.push(arg.location);
        }
        assert_eq!(locations[7], Some(ArgumentLocation::Register(AsmReg::general(7))));
        assert_eq!(locations[8], Some(ArgumentLocation::Stack(0)));

        let mut decimal = CCAssignment::new(Format::Decimal);
        assigner.assign_arg(&mut decimal);
        assert_eq!(decimal.register(), Some(D0));
        assert_eq!(assigner.get_stack_size(), 16);
    }
}
