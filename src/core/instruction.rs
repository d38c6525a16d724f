// This module defines the instruction catalogue of the lowering engine in two layers. Instruction
// is what lowering appends to a Unit: a closed enum of kinds over virtual ValueIds, each with a
// position, a declared result (the destination dependency) and the values it reads (the result
// references). The Unit drives every Instruction through simulate, build and post-build by
// exhaustive matches over InstructionKind. MachineInstruction is what build produces: the same
// program with finalized physical operands, where pseudo kinds (scope and symmetry markers,
// variable binds, staged comparisons) no longer appear and move widths have been chosen.

//! Instruction catalogue and finalized operations.

use std::fmt;

use super::calling_convention::ArgumentLocation;
use super::register_file::AsmReg;
use super::target::TargetConfiguration;
use super::value::{Format, Location, Position, StackSlot, SymbolId, ValueId};
use crate::tree::{Comparison, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Jump condition over the flags of the preceding comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Below,
    BelowOrEqual,
    Above,
    AboveOrEqual,
}

impl Condition {
    /// Unsigned (and decimal) comparisons use the below/above family.
    pub fn from_comparison(comparison: Comparison, unsigned: bool) -> Self {
        match (comparison, unsigned) {
            (Comparison::Equal, _) => Condition::Equal,
            (Comparison::NotEqual, _) => Condition::NotEqual,
            (Comparison::Less, false) => Condition::Less,
            (Comparison::LessOrEqual, false) => Condition::LessOrEqual,
            (Comparison::Greater, false) => Condition::Greater,
            (Comparison::GreaterOrEqual, false) => Condition::GreaterOrEqual,
            (Comparison::Less, true) => Condition::Below,
            (Comparison::LessOrEqual, true) => Condition::BelowOrEqual,
            (Comparison::Greater, true) => Condition::Above,
            (Comparison::GreaterOrEqual, true) => Condition::AboveOrEqual,
        }
    }

    pub fn invert(self) -> Self {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::LessOrEqual => Condition::Greater,
            Condition::Greater => Condition::LessOrEqual,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::BelowOrEqual => Condition::Above,
            Condition::Above => Condition::BelowOrEqual,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::Less => "l",
            Condition::LessOrEqual => "le",
            Condition::Greater => "g",
            Condition::GreaterOrEqual => "ge",
            Condition::Below => "b",
            Condition::BelowOrEqual => "be",
            Condition::Above => "a",
            Condition::AboveOrEqual => "ae",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOperator {
    Add,
    Subtract,
    Multiply,
    /// Decimal division; integer division has its own kind.
    DecimalDivide,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    /// Arithmetic (sign-propagating) shift.
    ShiftRight,
    /// Logical (zero-filling) shift.
    ShiftRightUnsigned,
}

impl ArithmeticOperator {
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            ArithmeticOperator::ShiftLeft
                | ArithmeticOperator::ShiftRight
                | ArithmeticOperator::ShiftRightUnsigned
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            ArithmeticOperator::Add
                | ArithmeticOperator::Multiply
                | ArithmeticOperator::BitwiseAnd
                | ArithmeticOperator::BitwiseOr
                | ArithmeticOperator::BitwiseXor
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ArithmeticOperator::Add => "add",
            ArithmeticOperator::Subtract => "sub",
            ArithmeticOperator::Multiply => "mul",
            ArithmeticOperator::DecimalDivide => "div",
            ArithmeticOperator::BitwiseAnd => "and",
            ArithmeticOperator::BitwiseOr => "or",
            ArithmeticOperator::BitwiseXor => "xor",
            ArithmeticOperator::ShiftLeft => "shl",
            ArithmeticOperator::ShiftRight => "sar",
            ArithmeticOperator::ShiftRightUnsigned => "shr",
        }
    }
}

/// Outer value of a variable and the value that must end up in its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeBinding {
    pub outer: ValueId,
    pub inner: ValueId,
}

/// Argument of a call with its convention-assigned location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallArgument {
    pub value: ValueId,
    pub location: ArgumentLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Label(LabelId),
    Jump {
        label: LabelId,
        condition: Option<Condition>,
    },
    /// Copy `source` into a fresh register-resident `result` (loads, materialization, widening).
    Copy {
        result: ValueId,
        source: ValueId,
    },
    /// Write `source` into the memory-bound value `destination`.
    Store {
        destination: ValueId,
        source: ValueId,
    },
    Arithmetic {
        operator: ArithmeticOperator,
        result: ValueId,
        first: ValueId,
        second: ValueId,
    },
    Negate {
        result: ValueId,
        source: ValueId,
    },
    /// `result = value + value * scale`, one addressing-mode computation.
    ScaledAddress {
        result: ValueId,
        value: ValueId,
        scale: u8,
    },
    /// High half of the signed 128-bit product.
    WideMultiply {
        result: ValueId,
        first: ValueId,
        second: ValueId,
    },
    Divide {
        result: ValueId,
        dividend: ValueId,
        divisor: ValueId,
        remainder: bool,
    },
    Compare {
        first: ValueId,
        second: ValueId,
    },
    /// Staged comparison inside a condition sequence; must be expanded before simulate.
    TemporaryCompare {
        index: usize,
    },
    /// Address of a frame buffer.
    LoadAddress {
        result: ValueId,
        slot: StackSlot,
    },
    Call {
        target: SymbolId,
        arguments: Vec<CallArgument>,
        result: Option<(ValueId, AsmReg)>,
        stack_size: u32,
    },
    Return {
        value: Option<(ValueId, AsmReg)>,
    },
    /// Record that a variable is now represented by `value`.
    SetVariable {
        variable: VariableId,
        value: ValueId,
    },
    EnterScope {
        scope: ScopeId,
    },
    MergeScope {
        scope: ScopeId,
        bindings: Vec<MergeBinding>,
    },
    ExitScope {
        scope: ScopeId,
    },
    SymmetryStart {
        scope: ScopeId,
        carried: Vec<ValueId>,
        non_volatile: bool,
    },
    /// Reconcile to the loop-entry state. With `exits`, control leaves through the jump that
    /// follows, so the bookkeeping of the fall-through path is left untouched.
    SymmetryEnd {
        scope: ScopeId,
        bindings: Vec<MergeBinding>,
        exits: bool,
    },
    DebugPosition {
        line: u32,
        column: u32,
    },
}

impl InstructionKind {
    /// The value this instruction defines.
    pub fn result(&self) -> Option<ValueId> {
        match self {
            InstructionKind::Copy { result, .. }
            | InstructionKind::Arithmetic { result, .. }
            | InstructionKind::Negate { result, .. }
            | InstructionKind::ScaledAddress { result, .. }
            | InstructionKind::WideMultiply { result, .. }
            | InstructionKind::Divide { result, .. }
            | InstructionKind::LoadAddress { result, .. } => Some(*result),
            InstructionKind::Call { result, .. } => result.map(|(value, _)| value),
            _ => None,
        }
    }

    /// Every value this instruction reads.
    pub fn references(&self) -> Vec<ValueId> {
        match self {
            InstructionKind::Copy { source, .. } | InstructionKind::Negate { source, .. } => {
                vec![*source]
            }
            InstructionKind::Store {
                destination,
                source,
            } => vec![*destination, *source],
            InstructionKind::Arithmetic { first, second, .. }
            | InstructionKind::WideMultiply { first, second, .. }
            | InstructionKind::Compare { first, second } => vec![*first, *second],
            InstructionKind::ScaledAddress { value, .. } => vec![*value],
            InstructionKind::Divide {
                dividend, divisor, ..
            } => vec![*dividend, *divisor],
            InstructionKind::Call { arguments, .. } => {
                arguments.iter().map(|argument| argument.value).collect()
            }
            InstructionKind::Return { value } => value.iter().map(|(value, _)| *value).collect(),
            InstructionKind::MergeScope { bindings, .. }
            | InstructionKind::SymmetryEnd { bindings, .. } => {
                bindings.iter().map(|binding| binding.inner).collect()
            }
            InstructionKind::SymmetryStart { carried, .. } => carried.clone(),
            InstructionKind::Label(_)
            | InstructionKind::Jump { .. }
            | InstructionKind::SetVariable { .. }
            | InstructionKind::TemporaryCompare { .. }
            | InstructionKind::LoadAddress { .. }
            | InstructionKind::EnterScope { .. }
            | InstructionKind::ExitScope { .. }
            | InstructionKind::DebugPosition { .. } => Vec::new(),
        }
    }

    /// Kinds that only drive allocation and never reach the output.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            InstructionKind::SetVariable { .. }
                | InstructionKind::EnterScope { .. }
                | InstructionKind::MergeScope { .. }
                | InstructionKind::ExitScope { .. }
                | InstructionKind::SymmetryStart { .. }
                | InstructionKind::SymmetryEnd { .. }
                | InstructionKind::TemporaryCompare { .. }
        )
    }

    /// Whether the result may be placed in a caller-chosen register.
    pub fn allows_redirection(&self) -> bool {
        matches!(
            self,
            InstructionKind::Copy { .. }
                | InstructionKind::Arithmetic { .. }
                | InstructionKind::Negate { .. }
                | InstructionKind::ScaledAddress { .. }
                | InstructionKind::LoadAddress { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self, InstructionKind::Call { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::Label(_) => "label",
            InstructionKind::Jump { .. } => "jump",
            InstructionKind::Copy { .. } => "copy",
            InstructionKind::Store { .. } => "store",
            InstructionKind::Arithmetic { .. } => "arithmetic",
            InstructionKind::Negate { .. } => "negate",
            InstructionKind::ScaledAddress { .. } => "scaled-address",
            InstructionKind::WideMultiply { .. } => "wide-multiply",
            InstructionKind::Divide { .. } => "divide",
            InstructionKind::Compare { .. } => "compare",
            InstructionKind::TemporaryCompare { .. } => "temporary-compare",
            InstructionKind::LoadAddress { .. } => "load-address",
            InstructionKind::Call { .. } => "call",
            InstructionKind::Return { .. } => "return",
            InstructionKind::SetVariable { .. } => "set-variable",
            InstructionKind::EnterScope { .. } => "enter-scope",
            InstructionKind::MergeScope { .. } => "merge-scope",
            InstructionKind::ExitScope { .. } => "exit-scope",
            InstructionKind::SymmetryStart { .. } => "symmetry-start",
            InstructionKind::SymmetryEnd { .. } => "symmetry-end",
            InstructionKind::DebugPosition { .. } => "debug-position",
        }
    }
}

/// An appended, not yet built instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub position: Position,
    pub kind: InstructionKind,
    /// Register the result should land in, when the producer allows it.
    pub hint: Option<AsmReg>,
}

/// Width handling of a move, chosen in post-build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveVariant {
    Plain,
    SignExtend,
    ZeroExtend,
    Truncate,
    /// Integer to decimal or decimal to integer.
    Convert,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Label(LabelId),
    Jump {
        label: LabelId,
        condition: Option<Condition>,
    },
    Move {
        destination: Location,
        source: Location,
        format: Format,
        source_format: Format,
        variant: MoveVariant,
    },
    /// Zero a register by xor-ing it with itself.
    Clear {
        destination: AsmReg,
        format: Format,
    },
    Exchange {
        first: Location,
        second: Location,
    },
    LoadAddress {
        destination: AsmReg,
        address: Location,
    },
    ScaledAddress {
        destination: AsmReg,
        base: AsmReg,
        index: AsmReg,
        scale: u8,
    },
    Arithmetic {
        operator: ArithmeticOperator,
        destination: AsmReg,
        first: AsmReg,
        second: Location,
        format: Format,
    },
    Negate {
        destination: AsmReg,
        source: AsmReg,
        format: Format,
    },
    WideMultiply {
        high: AsmReg,
        first: AsmReg,
        second: AsmReg,
    },
    /// Fill `destination` with the sign of `source` (x64 `cqo`).
    ExtendSign {
        destination: AsmReg,
        source: AsmReg,
        format: Format,
    },
    Divide {
        quotient: AsmReg,
        dividend: AsmReg,
        divisor: AsmReg,
        format: Format,
    },
    /// `destination = minuend - multiplicand * multiplier`.
    MultiplySubtract {
        destination: AsmReg,
        multiplicand: AsmReg,
        multiplier: AsmReg,
        minuend: AsmReg,
    },
    Compare {
        first: Location,
        second: Location,
        format: Format,
    },
    Call {
        target: SymbolId,
    },
    Return,
    DebugPosition {
        line: u32,
        column: u32,
    },
}

/// A built instruction with finalized operands.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInstruction {
    pub position: Position,
    pub operation: Operation,
}

impl MachineInstruction {
    /// Choose the move variant from the operand formats.
    pub fn post_build(&mut self) {
        if let Operation::Move {
            format,
            source_format,
            variant,
            ..
        } = &mut self.operation
        {
            *variant = if format.is_decimal() != source_format.is_decimal() {
                MoveVariant::Convert
            } else if format.bits() > source_format.bits() {
                if source_format.is_unsigned() {
                    MoveVariant::ZeroExtend
                } else {
                    MoveVariant::SignExtend
                }
            } else if format.bits() < source_format.bits() {
                MoveVariant::Truncate
            } else {
                MoveVariant::Plain
            };
        }
    }

    /// Human readable form for listings.
    pub fn render(&self, config: &TargetConfiguration, symbols: &[String]) -> String {
        let reg = |reg: AsmReg| config.register_name(reg);
        let loc = |location: Location| render_location(location, config, symbols);
        match &self.operation {
            Operation::Label(label) => format!("{label}:"),
            Operation::Jump { label, condition } => match condition {
                Some(condition) => format!("    j{} {label}", condition.mnemonic()),
                None => format!("    jmp {label}"),
            },
            Operation::Move {
                destination,
                source,
                variant,
                ..
            } => {
                let mnemonic = match variant {
                    MoveVariant::Plain => "mov",
                    MoveVariant::SignExtend => "movsx",
                    MoveVariant::ZeroExtend => "movzx",
                    MoveVariant::Truncate => "movtr",
                    MoveVariant::Convert => "cvt",
                };
                format!("    {mnemonic} {}, {}", loc(*destination), loc(*source))
            }
            Operation::Clear { destination, .. } => {
                format!("    xor {}, {}", reg(*destination), reg(*destination))
            }
            Operation::Exchange { first, second } => {
                format!("    xchg {}, {}", loc(*first), loc(*second))
            }
            Operation::LoadAddress {
                destination,
                address,
            } => format!("    lea {}, {}", reg(*destination), loc(*address)),
            Operation::ScaledAddress {
                destination,
                base,
                index,
                scale,
            } => format!(
                "    lea {}, [{} + {}*{scale}]",
                reg(*destination),
                reg(*base),
                reg(*index)
            ),
            Operation::Arithmetic {
                operator,
                destination,
                first,
                second,
                ..
            } => format!(
                "    {} {}, {}, {}",
                operator.mnemonic(),
                reg(*destination),
                reg(*first),
                loc(*second)
            ),
            Operation::Negate {
                destination,
                source,
                ..
            } => format!("    neg {}, {}", reg(*destination), reg(*source)),
            Operation::WideMultiply {
                high,
                first,
                second,
            } => format!("    mulh {}, {}, {}", reg(*high), reg(*first), reg(*second)),
            Operation::ExtendSign {
                destination,
                source,
                ..
            } => format!("    sext {}, {}", reg(*destination), reg(*source)),
            Operation::Divide {
                quotient,
                dividend,
                divisor,
                ..
            } => format!("    div {}, {}, {}", reg(*quotient), reg(*dividend), reg(*divisor)),
            Operation::MultiplySubtract {
                destination,
                multiplicand,
                multiplier,
                minuend,
            } => format!(
                "    msub {}, {}, {}, {}",
                reg(*destination),
                reg(*multiplicand),
                reg(*multiplier),
                reg(*minuend)
            ),
            Operation::Compare { first, second, .. } => {
                format!("    cmp {}, {}", loc(*first), loc(*second))
            }
            Operation::Call { target } => format!(
                "    call {}",
                symbols
                    .get(target.0 as usize)
                    .map_or("?", |symbol| symbol.as_str())
            ),
            Operation::Return => "    ret".to_string(),
            Operation::DebugPosition { line, column } => format!("    ; line {line}:{column}"),
        }
    }
}

pub fn render_location(
    location: Location,
    config: &TargetConfiguration,
    symbols: &[String],
) -> String {
    use super::value::{Constant, StackBase};
    match location {
        Location::Register(reg) => config.register_name(reg),
        Location::Stack(slot) => {
            let base = match slot.base {
                StackBase::Frame => "frame",
                StackBase::Outgoing => "out",
                StackBase::Incoming => "in",
            };
            format!("[{base}{:+}]", slot.offset)
        }
        Location::Constant(Constant::Integer(value)) => value.to_string(),
        Location::Constant(Constant::Decimal(bits)) => format!("{}", f64::from_bits(bits)),
        Location::Address(address) => {
            let mut text = format!("[{}", config.register_name(address.base));
            if let Some(index) = address.index {
                text.push_str(&format!(" + {}*{}", config.register_name(index), address.stride));
            }
            if address.offset != 0 {
                text.push_str(&format!(" {:+}", address.offset));
            }
            text.push(']');
            text
        }
        Location::Data(symbol) => format!(
            "[{}]",
            symbols.get(symbol.0 as usize).map_or("?", |name| name.as_str())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_inversion_is_an_involution() {
        for comparison in [
            Comparison::Equal,
            Comparison::NotEqual,
            Comparison::Less,
            Comparison::LessOrEqual,
            Comparison::Greater,
            Comparison::GreaterOrEqual,
        ] {
            for unsigned in [false, true] {
                let condition = Condition::from_comparison(comparison, unsigned);
                assert_ne!(condition, condition.invert());
                assert_eq!(condition, condition.invert().invert());
            }
        }
    }

    #[test]
    fn test_pseudo_kinds() {
        assert!(InstructionKind::EnterScope { scope: ScopeId(0) }.is_pseudo());
        assert!(InstructionKind::TemporaryCompare { index: 0 }.is_pseudo());
        assert!(!InstructionKind::Label(LabelId(0)).is_pseudo());
        assert!(!InstructionKind::DebugPosition { line: 1, column: 1 }.is_pseudo());
    }

    #[test]
    fn test_move_variant_selection() {
        let mut widen = MachineInstruction {
            position: 1,
            operation: Operation::Move {
                destination: Location::Register(AsmReg::general(0)),
                source: Location::Register(AsmReg::general(1)),
                format: Format::I64,
                source_format: Format::U32,
                variant: MoveVariant::Plain,
            },
        };
        widen.post_build();
        assert!(matches!(
            widen.operation,
            Operation::Move {
                variant: MoveVariant::ZeroExtend,
                ..
            }
        ));

        let mut narrow = widen.clone();
        if let Operation::Move {
            format,
            source_format,
            ..
        } = &mut narrow.operation
        {
            *format = Format::I8;
            *source_format = Format::I64;
        }
        narrow.post_build();
        assert!(matches!(
            narrow.operation,
            Operation::Move {
                variant: MoveVariant::Truncate,
                ..
            }
        ));
    }
}
