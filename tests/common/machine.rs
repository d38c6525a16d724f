//! A small interpreter for the integer subset of lowered code.
//!
//! Registers and slots nothing has written read as [`UNDEFINED`], and a call overwrites every
//! volatile register with it, so a value that was not preserved shows up as a wrong result.

use hashbrown::HashMap;
use unitlower::core::{
    ArithmeticOperator, CallingConvention, Condition, Constant, LabelId, Location, Operation,
    StackSlot,
};
use unitlower::{arm64, x64, AsmReg, LoweredFunction, RegBank, TargetConfiguration};

pub const UNDEFINED: i64 = 0x5a5a_5a5a_5a5a_5a5a;

const STEP_LIMIT: usize = 1_000_000;

pub fn integer_argument_registers(config: &TargetConfiguration) -> Vec<AsmReg> {
    match config.calling_convention() {
        CallingConvention::SystemV => x64::SysVAssigner::GP_ARG_REGS.to_vec(),
        CallingConvention::WindowsX64 => x64::WindowsAssigner::GP_ARG_REGS.to_vec(),
        CallingConvention::Aapcs64 => arm64::Aapcs64Assigner::GP_ARG_REGS.to_vec(),
    }
}

struct Machine {
    registers: HashMap<AsmReg, i64>,
    memory: HashMap<StackSlot, i64>,
    flags: (i64, i64),
}

impl Machine {
    fn read(&self, location: &Location) -> i64 {
        match location {
            Location::Register(reg) => self.registers.get(reg).copied().unwrap_or(UNDEFINED),
            Location::Stack(slot) => self.memory.get(slot).copied().unwrap_or(UNDEFINED),
            Location::Constant(Constant::Integer(value)) => *value,
            other => panic!("cannot read {other:?}"),
        }
    }

    fn write(&mut self, location: &Location, value: i64) {
        match location {
            Location::Register(reg) => {
                self.registers.insert(*reg, value);
            }
            Location::Stack(slot) => {
                self.memory.insert(*slot, value);
            }
            other => panic!("cannot write {other:?}"),
        }
    }

    fn register(&self, reg: AsmReg) -> i64 {
        self.read(&Location::Register(reg))
    }

    fn holds(&self, condition: Condition) -> bool {
        let (a, b) = self.flags;
        let (ua, ub) = (a as u64, b as u64);
        match condition {
            Condition::Equal => a == b,
            Condition::NotEqual => a != b,
            Condition::Less => a < b,
            Condition::LessOrEqual => a <= b,
            Condition::Greater => a > b,
            Condition::GreaterOrEqual => a >= b,
            Condition::Below => ua < ub,
            Condition::BelowOrEqual => ua <= ub,
            Condition::Above => ua > ub,
            Condition::AboveOrEqual => ua >= ub,
        }
    }
}

fn apply(operator: ArithmeticOperator, a: i64, b: i64) -> i64 {
    match operator {
        ArithmeticOperator::Add => a.wrapping_add(b),
        ArithmeticOperator::Subtract => a.wrapping_sub(b),
        ArithmeticOperator::Multiply => a.wrapping_mul(b),
        ArithmeticOperator::BitwiseAnd => a & b,
        ArithmeticOperator::BitwiseOr => a | b,
        ArithmeticOperator::BitwiseXor => a ^ b,
        ArithmeticOperator::ShiftLeft => a.wrapping_shl(b as u32 & 63),
        ArithmeticOperator::ShiftRight => a.wrapping_shr(b as u32 & 63),
        ArithmeticOperator::ShiftRightUnsigned => ((a as u64) >> (b as u32 & 63)) as i64,
        ArithmeticOperator::DecimalDivide => panic!("decimal arithmetic is not interpreted"),
    }
}

/// Run `lowered` with integer `arguments` and return the integer result.
///
/// `callee` receives the symbol name and first integer argument of every call and returns the
/// call's result.
pub fn execute(
    lowered: &LoweredFunction,
    config: &TargetConfiguration,
    arguments: &[i64],
    mut callee: impl FnMut(&str, i64) -> i64,
) -> i64 {
    let argument_registers = integer_argument_registers(config);
    let volatile = config.volatile_registers();
    let result_register = config.return_register(RegBank::General);

    let mut machine = Machine {
        registers: HashMap::new(),
        memory: HashMap::new(),
        flags: (0, 0),
    };
    for (reg, value) in argument_registers.iter().zip(arguments) {
        machine.registers.insert(*reg, *value);
    }

    let operations: Vec<&Operation> = lowered.operations().collect();
    let labels: HashMap<LabelId, usize> = operations
        .iter()
        .enumerate()
        .filter_map(|(index, operation)| match operation {
            Operation::Label(label) => Some((*label, index)),
            _ => None,
        })
        .collect();

    let mut pc = 0;
    for _ in 0..STEP_LIMIT {
        let operation = operations
            .get(pc)
            .unwrap_or_else(|| panic!("{} ran past its end", lowered.name));
        pc += 1;
        match operation {
            Operation::Label(_) | Operation::DebugPosition { .. } => {}
            Operation::Jump { label, condition } => {
                if condition.map_or(true, |condition| machine.holds(condition)) {
                    pc = labels[label];
                }
            }
            Operation::Move {
                destination,
                source,
                ..
            } => {
                let value = machine.read(source);
                machine.write(destination, value);
            }
            Operation::Clear { destination, .. } => {
                machine.registers.insert(*destination, 0);
            }
            Operation::Exchange { first, second } => {
                let (a, b) = (machine.read(first), machine.read(second));
                machine.write(first, b);
                machine.write(second, a);
            }
            Operation::ScaledAddress {
                destination,
                base,
                index,
                scale,
            } => {
                let value = machine
                    .register(*base)
                    .wrapping_add(machine.register(*index).wrapping_mul(i64::from(*scale)));
                machine.registers.insert(*destination, value);
            }
            Operation::Arithmetic {
                operator,
                destination,
                first,
                second,
                ..
            } => {
                let value = apply(*operator, machine.register(*first), machine.read(second));
                machine.registers.insert(*destination, value);
            }
            Operation::Negate {
                destination,
                source,
                ..
            } => {
                let value = machine.register(*source).wrapping_neg();
                machine.registers.insert(*destination, value);
            }
            Operation::WideMultiply {
                high,
                first,
                second,
            } => {
                let product =
                    i128::from(machine.register(*first)) * i128::from(machine.register(*second));
                machine.registers.insert(*high, (product >> 64) as i64);
            }
            Operation::ExtendSign {
                destination,
                source,
                ..
            } => {
                let value = machine.register(*source) >> 63;
                machine.registers.insert(*destination, value);
            }
            Operation::MultiplySubtract {
                destination,
                multiplicand,
                multiplier,
                minuend,
            } => {
                let value = machine.register(*minuend).wrapping_sub(
                    machine
                        .register(*multiplicand)
                        .wrapping_mul(machine.register(*multiplier)),
                );
                machine.registers.insert(*destination, value);
            }
            Operation::Compare { first, second, .. } => {
                machine.flags = (machine.read(first), machine.read(second));
            }
            Operation::Call { target } => {
                let name = &lowered.symbols[target.0 as usize];
                let argument = machine.register(argument_registers[0]);
                let result = callee(name, argument);
                machine.registers.retain(|reg, _| !volatile.contains(*reg));
                machine.registers.insert(result_register, result);
                machine.flags = (UNDEFINED, 0);
            }
            Operation::Return => return machine.register(result_register),
            other => panic!("{other:?} is not interpreted"),
        }
    }
    panic!("{} did not return within {STEP_LIMIT} steps", lowered.name)
}
