// Arithmetic lowering with strength reduction. Multiplication by a constant becomes a shift for
// powers of two and a single scaled-address computation when the constant is one more than 2, 4
// or 8. Signed division by a constant that is not a power of two becomes a widening multiply by
// a 64-bit reciprocal, a sign-correction term taken from bit 63 of the product, an optional
// padding shift and an add. Division by a power of two becomes a right shift. Everything else,
// modulus included, maps onto the corresponding Arithmetic or Divide instruction.

//! Binary and unary arithmetic lowering.

use super::FunctionLowering;
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::instruction::{ArithmeticOperator, InstructionKind};
use crate::core::value::{Constant, Format, ValueId};
use crate::tree::{BinaryOperator, Node};

/// Reciprocal multiplication replacing a signed division by a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivisionPlan {
    /// `floor(2^(64 + padding) / divisor) + 1`.
    pub magic: u64,
    /// Extra right shift applied to the high half of the product.
    pub padding: u32,
}

impl DivisionPlan {
    /// Plan for `divisor`, or None when a shift or a real divide is the better lowering.
    pub fn new(divisor: i64) -> Option<Self> {
        if divisor <= 1 || divisor.count_ones() == 1 {
            return None;
        }
        let divisor = divisor as u64;

        // 2^64 / d, which is never exact for a divisor that is not a power of two.
        let reciprocal = u64::MAX / divisor;
        let highest = 63 - reciprocal.leading_zeros();
        let padding = (62 - highest).min(7);

        // Long division of 2^(64 + padding) by the divisor, one quotient bit per step. The
        // integer part is zero because 2^(padding + 1) <= divisor.
        let mut remainder = 1u64 << padding;
        let mut magic = 0u64;
        for _ in 0..64 {
            remainder <<= 1;
            let bit = remainder >= divisor;
            if bit {
                remainder -= divisor;
            }
            magic = (magic << 1) | u64::from(bit);
        }
        let magic = magic.checked_add(1)?;
        (magic <= i64::MAX as u64).then_some(Self { magic, padding })
    }

    /// Quotient the emitted sequence computes for `dividend`.
    pub fn apply(&self, dividend: i64) -> i64 {
        let high = ((i128::from(dividend) * i128::from(self.magic)) >> 64) as i64;
        let sign = ((high as u64) >> 63) as i64;
        (high >> self.padding) + sign
    }
}

fn power_of_two(value: i64) -> Option<u32> {
    (value > 0 && value.count_ones() == 1).then(|| value.trailing_zeros())
}

impl<'f> FunctionLowering<'f> {
    fn integer_constant(&self, value: ValueId) -> Option<i64> {
        self.unit.values().constant_of(value)?.as_integer()
    }

    fn arithmetic(
        &mut self,
        operator: ArithmeticOperator,
        first: ValueId,
        second: ValueId,
        format: Format,
    ) -> ValueId {
        let result = self.unit.create_value(format);
        self.unit.append(InstructionKind::Arithmetic {
            operator,
            result,
            first,
            second,
        });
        result
    }

    fn shift(&mut self, operator: ArithmeticOperator, value: ValueId, count: u32, format: Format) -> ValueId {
        let count = self.unit.constant(Constant::Integer(i64::from(count)), format);
        self.arithmetic(operator, value, count, format)
    }

    pub(crate) fn lower_binary(
        &mut self,
        operator: BinaryOperator,
        left: &Node,
        right: &Node,
        format: Format,
    ) -> LoweringResult<ValueId> {
        let first = self.read(left)?;
        let first = self.convert(first, format);
        let second = self.read(right)?;
        let second = self.convert(second, format);

        if format.is_decimal() {
            let operator = match operator {
                BinaryOperator::Add => ArithmeticOperator::Add,
                BinaryOperator::Subtract => ArithmeticOperator::Subtract,
                BinaryOperator::Multiply => ArithmeticOperator::Multiply,
                BinaryOperator::Divide => ArithmeticOperator::DecimalDivide,
                other => {
                    return Err(LoweringError::unsupported(format!(
                        "{other:?} on decimal values"
                    )))
                }
            };
            return Ok(self.arithmetic(operator, first, second, format));
        }

        Ok(match operator {
            BinaryOperator::Multiply => self.lower_multiply(first, second, format),
            BinaryOperator::Divide => self.lower_divide(first, second, format),
            BinaryOperator::Modulus => self.divide(first, second, format, true),
            BinaryOperator::ShiftLeft => {
                self.arithmetic(ArithmeticOperator::ShiftLeft, first, second, format)
            }
            BinaryOperator::ShiftRight if format.is_unsigned() => {
                self.arithmetic(ArithmeticOperator::ShiftRightUnsigned, first, second, format)
            }
            BinaryOperator::ShiftRight => {
                self.arithmetic(ArithmeticOperator::ShiftRight, first, second, format)
            }
            BinaryOperator::Add => self.arithmetic(ArithmeticOperator::Add, first, second, format),
            BinaryOperator::Subtract => {
                self.arithmetic(ArithmeticOperator::Subtract, first, second, format)
            }
            BinaryOperator::BitwiseAnd => {
                self.arithmetic(ArithmeticOperator::BitwiseAnd, first, second, format)
            }
            BinaryOperator::BitwiseOr => {
                self.arithmetic(ArithmeticOperator::BitwiseOr, first, second, format)
            }
            BinaryOperator::BitwiseXor => {
                self.arithmetic(ArithmeticOperator::BitwiseXor, first, second, format)
            }
        })
    }

    fn lower_multiply(&mut self, first: ValueId, second: ValueId, format: Format) -> ValueId {
        let (value, constant) = match (self.integer_constant(first), self.integer_constant(second)) {
            (_, Some(constant)) => (first, constant),
            (Some(constant), None) => (second, constant),
            (None, None) => {
                return self.arithmetic(ArithmeticOperator::Multiply, first, second, format)
            }
        };

        if constant == 1 {
            return value;
        }
        if let Some(count) = power_of_two(constant) {
            return self.shift(ArithmeticOperator::ShiftLeft, value, count, format);
        }
        if matches!(constant, 3 | 5 | 9) {
            let result = self.unit.create_value(format);
            self.unit.append(InstructionKind::ScaledAddress {
                result,
                value,
                scale: (constant - 1) as u8,
            });
            return result;
        }
        let constant = self.unit.constant(Constant::Integer(constant), format);
        self.arithmetic(ArithmeticOperator::Multiply, value, constant, format)
    }

    fn lower_divide(&mut self, first: ValueId, second: ValueId, format: Format) -> ValueId {
        let Some(divisor) = self.integer_constant(second) else {
            return self.divide(first, second, format, false);
        };
        if divisor == 1 {
            return first;
        }
        if let Some(count) = power_of_two(divisor) {
            let operator = if format.is_unsigned() {
                ArithmeticOperator::ShiftRightUnsigned
            } else {
                ArithmeticOperator::ShiftRight
            };
            return self.shift(operator, first, count, format);
        }
        match DivisionPlan::new(divisor).filter(|_| !format.is_unsigned()) {
            Some(plan) => self.divide_by_reciprocal(first, plan, format),
            None => self.divide(first, second, format, false),
        }
    }

    fn divide(&mut self, dividend: ValueId, divisor: ValueId, format: Format, remainder: bool) -> ValueId {
        let result = self.unit.create_value(format);
        self.unit.append(InstructionKind::Divide {
            result,
            dividend,
            divisor,
            remainder,
        });
        result
    }

    fn divide_by_reciprocal(&mut self, dividend: ValueId, plan: DivisionPlan, format: Format) -> ValueId {
        log::trace!(
            "dividing by reciprocal {:#x} with padding {}",
            plan.magic,
            plan.padding
        );
        let dividend = self.convert(dividend, Format::I64);
        let magic = self
            .unit
            .constant(Constant::Integer(plan.magic as i64), Format::I64);

        let product = self.unit.create_value(Format::I64);
        self.unit.append(InstructionKind::WideMultiply {
            result: product,
            first: dividend,
            second: magic,
        });
        let sign = self.shift(ArithmeticOperator::ShiftRightUnsigned, product, 63, Format::I64);
        let quotient = if plan.padding > 0 {
            self.shift(ArithmeticOperator::ShiftRight, product, plan.padding, Format::I64)
        } else {
            product
        };
        let sum = self.arithmetic(ArithmeticOperator::Add, quotient, sign, Format::I64);
        self.convert(sum, format)
    }

    pub(crate) fn lower_negate(&mut self, inner: &Node) -> LoweringResult<ValueId> {
        let format = self.node_format(inner)?;
        let value = self.read(inner)?;
        let value = self.convert(value, format);

        if format.is_decimal() {
            let zero = self.zero(format);
            return Ok(self.arithmetic(ArithmeticOperator::Subtract, zero, value, format));
        }
        if let Some(constant) = self.integer_constant(value) {
            return Ok(self
                .unit
                .constant(Constant::Integer(constant.wrapping_neg()), format));
        }
        let result = self.unit.create_value(format);
        self.unit.append(InstructionKind::Negate {
            result,
            source: value,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Magic constant from the closed form.
    fn closed_form(divisor: i64, padding: u32) -> u64 {
        ((1u128 << (64 + padding)) / divisor as u128 + 1) as u64
    }

    #[test]
    fn test_division_by_six() {
        let plan = DivisionPlan::new(6).unwrap();
        assert_eq!(plan.padding, 1);
        assert_eq!(plan.magic, 0x5555_5555_5555_5556);
        assert_eq!(plan.apply(42), 7);
        assert_eq!(plan.apply(-7), -1);
        for dividend in -10_000..=10_000 {
            assert_eq!(plan.apply(dividend), dividend / 6, "dividend {dividend}");
        }
    }

    #[test]
    fn test_plans_match_closed_form() {
        for divisor in [3, 5, 6, 7, 10, 12, 25, 100, 641, 1000, 65_537] {
            let plan = DivisionPlan::new(divisor).unwrap();
            assert_eq!(plan.magic, closed_form(divisor, plan.padding), "divisor {divisor}");
            for dividend in -10_000..=10_000 {
                assert_eq!(plan.apply(dividend), dividend / divisor, "{dividend} / {divisor}");
            }
        }
    }

    #[test]
    fn test_no_plan_for_shifts_and_trivial_divisors() {
        for divisor in [-6, -1, 0, 1, 2, 8, 1024] {
            assert_eq!(DivisionPlan::new(divisor), None, "divisor {divisor}");
        }
    }

    #[test]
    fn test_power_of_two_detection() {
        assert_eq!(power_of_two(8), Some(3));
        assert_eq!(power_of_two(1), Some(0));
        assert_eq!(power_of_two(12), None);
        assert_eq!(power_of_two(-8), None);
    }
}
