// This module lowers a resolved Function into a Unit. FunctionLowering walks the statement list
// once, acquiring a virtual value for every expression node and appending instructions. Each
// predictable variable is represented by whichever value it was last assigned (assignment binds
// an entangled value sharing the assigned value's cell); variables that need a stable address
// (members, globals, non-predictable locals, every local and parameter in debuggable mode) are
// read through a copy from their memory home and written with a store. Branches, loops, calls,
// conditions and arithmetic strength reduction live in the child modules.

//! Syntax-tree lowering onto a [`Unit`].

pub mod arithmetic;
pub mod calls;
pub mod conditions;
pub mod loops;
pub mod scope;

use crate::core::calling_convention::{assign_arguments, ArgumentLocation};
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::instruction::{InstructionKind, LabelId, ScopeId};
use crate::core::register_file::RegBank;
use crate::core::session::CompilationSession;
use crate::core::target::TargetConfiguration;
use crate::core::unit::{LoweredFunction, Unit};
use crate::core::value::{Constant, Format, Location, Metadata, StackSlot, ValueId};
use crate::tree::{Function, Node, NodeKind, StorageCategory, ValueType, Variable, VariableId};

/// Labels and header bindings of the innermost loops, innermost last.
#[derive(Debug, Clone)]
struct LoopContext {
    scope: ScopeId,
    continue_label: LabelId,
    exit_label: LabelId,
    outer: Vec<(VariableId, ValueId)>,
}

pub struct FunctionLowering<'f> {
    function: &'f Function,
    unit: Unit,
    /// Current value of each predictable variable.
    bindings: Vec<Option<ValueId>>,
    /// Memory home of each variable read and written through memory.
    homes: Vec<Option<ValueId>>,
    self_value: Option<ValueId>,
    struct_return: Option<ValueId>,
    loops: Vec<LoopContext>,
}

impl<'f> FunctionLowering<'f> {
    /// Bind the parameters as the calling convention delivers them.
    pub fn new(function: &'f Function, config: TargetConfiguration) -> LoweringResult<Self> {
        let mut lowering = Self {
            function,
            unit: Unit::new(&function.name, config),
            bindings: vec![None; function.variables.len()],
            homes: vec![None; function.variables.len()],
            self_value: None,
            struct_return: None,
            loops: Vec::new(),
        };

        let parameters: Vec<VariableId> = function
            .parameters
            .iter()
            .flat_map(|shape| shape.flatten())
            .collect();
        let mut formats = Vec::with_capacity(parameters.len());
        for &id in &parameters {
            formats.push(lowering.variable(id)?.format);
        }

        let struct_return = returns_through_pointer(function.returns.as_ref());
        let (assignments, _) =
            assign_arguments(&config, struct_return, function.has_self, &formats);
        let mut assignments = assignments.into_iter();
        let mut next_location = || {
            assignments
                .next()
                .and_then(|assignment| assignment.location)
                .ok_or_else(|| LoweringError::invariant("parameter without a location"))
        };

        if struct_return {
            let location = next_location()?;
            lowering.struct_return = Some(lowering.unit.parameter(Format::U64, location)?);
        }
        if function.has_self {
            let location = next_location()?;
            lowering.self_value = Some(lowering.unit.parameter(Format::U64, location)?);
        }
        let mut locations: Vec<ArgumentLocation> = Vec::with_capacity(parameters.len());
        for _ in &parameters {
            locations.push(next_location()?);
        }
        for (&id, location) in parameters.iter().zip(locations) {
            let format = lowering.variable(id)?.format;
            let value = lowering.unit.parameter(format, location)?;
            lowering
                .unit
                .values_mut()
                .set_metadata(value, Metadata::Variable(id));
            lowering.bindings[id.0 as usize] = Some(value);
        }

        for (index, variable) in function.variables.iter().enumerate() {
            let home = match variable.category {
                StorageCategory::Local if !variable.predictable || config.debuggable => {
                    let slot = lowering.unit.allocate_local(8);
                    Some(lowering.memory_home(variable.format, slot))
                }
                StorageCategory::Global => {
                    let symbol = lowering.unit.symbol(&variable.name);
                    Some(
                        lowering
                            .unit
                            .values_mut()
                            .memory(variable.format, Location::Data(symbol)),
                    )
                }
                _ => None,
            };
            lowering.homes[index] = home;
        }

        if config.debuggable {
            lowering.materialize_parameters()?;
        } else {
            let unpredictable: Vec<VariableId> = parameters
                .iter()
                .copied()
                .filter(|id| {
                    function
                        .variable(*id)
                        .is_some_and(|variable| !variable.predictable)
                })
                .collect();
            lowering.materialize(&unpredictable)?;
        }
        Ok(lowering)
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn config(&self) -> &TargetConfiguration {
        self.unit.config()
    }

    /// Store every parameter into a home stack slot; afterwards parameters are read and written
    /// through memory. Must run before any body instruction is lowered.
    pub fn materialize_parameters(&mut self) -> LoweringResult<()> {
        let parameters: Vec<VariableId> = self
            .function
            .parameters
            .iter()
            .flat_map(|shape| shape.flatten())
            .collect();
        self.materialize(&parameters)
    }

    fn materialize(&mut self, parameters: &[VariableId]) -> LoweringResult<()> {
        for &id in parameters {
            let Some(value) = self.bindings[id.0 as usize].take() else {
                continue;
            };
            let format = self.variable(id)?.format;
            let slot = self.unit.allocate_local(8);
            let home = self.memory_home(format, slot);
            self.unit.append(InstructionKind::Store {
                destination: home,
                source: value,
            });
            self.homes[id.0 as usize] = Some(home);
            log::trace!("parameter {id} materialized at {}", slot.offset);
        }
        Ok(())
    }

    fn memory_home(&mut self, format: Format, slot: StackSlot) -> ValueId {
        self.unit.values_mut().memory(format, Location::Stack(slot))
    }

    /// Append the instructions of the whole body, ending in a return.
    pub fn lower_body(&mut self) -> LoweringResult<()> {
        let function = self.function;
        for statement in &function.body {
            self.lower_statement(statement)?;
        }
        let returned = matches!(
            function.body.last().map(|node| &node.kind),
            Some(NodeKind::Return(_))
        );
        if !returned {
            self.unit.append(InstructionKind::Return { value: None });
        }
        log::debug!(
            "{}: lowered {} instructions",
            function.name,
            self.unit.instructions().len()
        );
        Ok(())
    }

    /// Build the Unit appended so far.
    pub fn finish(self) -> LoweringResult<LoweredFunction> {
        self.unit.build()
    }

    /// Lower the body and build the Unit.
    pub fn lower(mut self) -> LoweringResult<LoweredFunction> {
        self.lower_body()?;
        self.finish()
    }

    pub(crate) fn variable(&self, id: VariableId) -> LoweringResult<&'f Variable> {
        self.function
            .variable(id)
            .ok_or(LoweringError::UnknownVariable { variable: id.0 })
    }

    /// Read and written through memory rather than tracked in a value.
    pub(crate) fn is_homed(&self, id: VariableId) -> bool {
        self.homes.get(id.0 as usize).is_some_and(Option::is_some)
            || self
                .function
                .variable(id)
                .is_some_and(|variable| variable.category == StorageCategory::Member)
    }

    pub(crate) fn binding(&self, id: VariableId) -> Option<ValueId> {
        self.bindings.get(id.0 as usize).copied().flatten()
    }

    pub(crate) fn bind(&mut self, id: VariableId, value: ValueId) {
        self.bindings[id.0 as usize] = Some(value);
        self.unit
            .append(InstructionKind::SetVariable { variable: id, value });
    }

    pub(crate) fn zero(&mut self, format: Format) -> ValueId {
        let constant = if format.is_decimal() {
            Constant::decimal(0.0)
        } else {
            Constant::Integer(0)
        };
        self.unit.constant(constant, format)
    }

    /// Copy `value` into a fresh register-resident value of `format`.
    pub(crate) fn copy(&mut self, value: ValueId, format: Format) -> ValueId {
        let result = self.unit.create_value(format);
        self.unit.append(InstructionKind::Copy {
            result,
            source: value,
        });
        result
    }

    /// `value` in `format`, converting through a copy when the formats differ. Integer
    /// constants are re-typed instead.
    pub(crate) fn convert(&mut self, value: ValueId, format: Format) -> ValueId {
        if self.unit.values().format(value) == format {
            return value;
        }
        match self.unit.values().constant_of(value) {
            Some(Constant::Integer(integer)) if format.is_decimal() => self
                .unit
                .constant(Constant::decimal(integer as f64), format),
            Some(constant @ Constant::Integer(_)) => self.unit.constant(constant, format),
            _ => self.copy(value, format),
        }
    }

    /// Format the resolver assigned to an expression node.
    pub(crate) fn node_format(&self, node: &Node) -> LoweringResult<Format> {
        Ok(match &node.kind {
            NodeKind::Integer { format, .. } | NodeKind::Binary { format, .. } => *format,
            NodeKind::Decimal(_) => Format::Decimal,
            NodeKind::Variable(id) | NodeKind::Access { member: id, .. } => {
                self.variable(*id)?.format
            }
            NodeKind::Element { format, .. } => *format,
            NodeKind::Negate(inner) => self.node_format(inner)?,
            NodeKind::Call { signature, .. } => match &signature.returns {
                Some(ValueType::Scalar(format)) => *format,
                _ => Format::I64,
            },
            _ => Format::I64,
        })
    }

    pub(crate) fn lower_statement(&mut self, node: &Node) -> LoweringResult<()> {
        if self.config().debug_positions {
            if let Some(position) = node.position {
                self.unit.append(InstructionKind::DebugPosition {
                    line: position.line,
                    column: position.column,
                });
            }
        }

        match &node.kind {
            NodeKind::Assign { target, value } => self.lower_assign(target, value),
            NodeKind::If {
                condition,
                body,
                otherwise,
            } => self.lower_if(condition, body, otherwise.as_deref()),
            NodeKind::Loop {
                initialization,
                condition,
                action,
                body,
            } => self.lower_loop(initialization, condition.as_deref(), action, body),
            NodeKind::Return(value) => self.lower_return(value.as_deref()),
            NodeKind::Stop => self.lower_stop(),
            NodeKind::Continue => self.lower_continue(),
            NodeKind::Call {
                signature,
                receiver,
                arguments,
            } => self
                .lower_call(signature, receiver.as_deref(), arguments)
                .map(|_| ()),
            _ => self.read(node).map(|_| ()),
        }
    }

    /// Acquire a value for an expression without side effects beyond appended instructions.
    pub(crate) fn read(&mut self, node: &Node) -> LoweringResult<ValueId> {
        match &node.kind {
            NodeKind::Integer { value, format } => {
                Ok(self.unit.constant(Constant::Integer(*value), *format))
            }
            NodeKind::Decimal(value) => Ok(self
                .unit
                .constant(Constant::decimal(*value), Format::Decimal)),
            NodeKind::Variable(id) => self.read_variable(*id),
            NodeKind::Access { object, member } => {
                let address = self.member_address(Some(object), *member)?;
                let format = self.unit.values().format(address);
                Ok(self.copy(address, format))
            }
            NodeKind::Element {
                object,
                index,
                stride,
                format,
            } => {
                let address = self.element_address(object, index, *stride, *format)?;
                Ok(self.copy(address, *format))
            }
            NodeKind::Binary {
                operator,
                left,
                right,
                format,
            } => self.lower_binary(*operator, left, right, *format),
            NodeKind::Negate(inner) => self.lower_negate(inner),
            NodeKind::Call {
                signature,
                receiver,
                arguments,
            } => {
                let results = self.lower_call(signature, receiver.as_deref(), arguments)?;
                match results.as_slice() {
                    [value] => Ok(*value),
                    _ => Err(LoweringError::unsupported(format!(
                        "call to {} used as a scalar value",
                        signature.name
                    ))),
                }
            }
            NodeKind::Compare { .. } | NodeKind::And(..) | NodeKind::Or(..) | NodeKind::Not(_) => {
                Err(LoweringError::unsupported("condition used as a value"))
            }
            NodeKind::Pack(_) => Err(LoweringError::unsupported("pack used as a scalar value")),
            NodeKind::Assign { .. }
            | NodeKind::If { .. }
            | NodeKind::Loop { .. }
            | NodeKind::Return(_)
            | NodeKind::Stop
            | NodeKind::Continue => Err(LoweringError::unsupported("statement used as a value")),
        }
    }

    /// Scalar members of a pack expression, flattened.
    pub(crate) fn read_pack(&mut self, node: &Node) -> LoweringResult<Vec<ValueId>> {
        match &node.kind {
            NodeKind::Pack(members) => {
                let mut values = Vec::new();
                for member in members {
                    values.extend(self.read_pack(member)?);
                }
                Ok(values)
            }
            NodeKind::Call {
                signature,
                receiver,
                arguments,
            } => self.lower_call(signature, receiver.as_deref(), arguments),
            _ => Ok(vec![self.read(node)?]),
        }
    }

    fn read_variable(&mut self, id: VariableId) -> LoweringResult<ValueId> {
        let variable = self.variable(id)?;
        if variable.category == StorageCategory::Member {
            let address = self.member_address(None, id)?;
            return Ok(self.copy(address, variable.format));
        }
        if let Some(home) = self.homes[id.0 as usize] {
            return Ok(self.copy(home, variable.format));
        }
        match self.binding(id) {
            Some(value) => Ok(value),
            None => Ok(self.zero(variable.format)),
        }
    }

    /// Address value of a member, relative to `object` or to the receiver.
    fn member_address(&mut self, object: Option<&Node>, member: VariableId) -> LoweringResult<ValueId> {
        let variable = self.variable(member)?;
        if variable.category != StorageCategory::Member {
            return Err(LoweringError::unsupported(format!(
                "access to {} which is not a member",
                variable.name
            )));
        }
        let base = match object {
            Some(object) => self.read(object)?,
            None => self.self_value.ok_or_else(|| {
                LoweringError::unsupported(format!("member {} without a receiver", variable.name))
            })?,
        };
        Ok(self
            .unit
            .values_mut()
            .address(variable.format, base, variable.offset))
    }

    /// Address value of `object[index]`. Constant indices fold into the offset.
    fn element_address(
        &mut self,
        object: &Node,
        index: &Node,
        stride: u8,
        format: Format,
    ) -> LoweringResult<ValueId> {
        if !matches!(stride, 1 | 2 | 4 | 8) {
            return Err(LoweringError::unsupported(format!("element stride {stride}")));
        }
        let base = self.read(object)?;
        if let NodeKind::Integer { value, .. } = index.kind {
            let offset = value
                .checked_mul(i64::from(stride))
                .and_then(|offset| i32::try_from(offset).ok())
                .ok_or_else(|| {
                    LoweringError::unsupported(format!("element offset {value} * {stride}"))
                })?;
            return Ok(self.unit.values_mut().address(format, base, offset));
        }
        let index = self.read(index)?;
        let index = self.convert(index, Format::I64);
        Ok(self.unit.values_mut().element(format, base, index, stride))
    }

    fn lower_assign(&mut self, target: &Node, value: &Node) -> LoweringResult<()> {
        match &target.kind {
            NodeKind::Variable(id) => {
                let variable = self.variable(*id)?;
                let source = self.read(value)?;
                let source = self.convert(source, variable.format);
                if variable.category == StorageCategory::Member {
                    let address = self.member_address(None, *id)?;
                    self.unit.append(InstructionKind::Store {
                        destination: address,
                        source,
                    });
                } else if let Some(home) = self.homes[id.0 as usize] {
                    self.unit.append(InstructionKind::Store {
                        destination: home,
                        source,
                    });
                } else {
                    let entangled = self
                        .unit
                        .values_mut()
                        .entangle(source, Some(Metadata::Variable(*id)));
                    self.bind(*id, entangled);
                }
                Ok(())
            }
            NodeKind::Access { object, member } => {
                let format = self.variable(*member)?.format;
                let source = self.read(value)?;
                let source = self.convert(source, format);
                let address = self.member_address(Some(object), *member)?;
                self.unit.append(InstructionKind::Store {
                    destination: address,
                    source,
                });
                Ok(())
            }
            NodeKind::Element {
                object,
                index,
                stride,
                format,
            } => {
                let source = self.read(value)?;
                let source = self.convert(source, *format);
                let address = self.element_address(object, index, *stride, *format)?;
                self.unit.append(InstructionKind::Store {
                    destination: address,
                    source,
                });
                Ok(())
            }
            _ => Err(LoweringError::unsupported("assignment to a non-variable")),
        }
    }

    fn lower_return(&mut self, value: Option<&Node>) -> LoweringResult<()> {
        let Some(node) = value else {
            self.unit.append(InstructionKind::Return { value: None });
            return Ok(());
        };

        let declared = self
            .function
            .returns
            .as_ref()
            .map(ValueType::flatten)
            .unwrap_or_default();

        if let Some(pointer) = self.struct_return {
            let members = self.read_pack(node)?;
            if members.len() != declared.len() {
                return Err(LoweringError::invariant(format!(
                    "{} returns {} members, {} declared",
                    self.function.name,
                    members.len(),
                    declared.len()
                )));
            }
            for (index, (member, format)) in members.into_iter().zip(declared).enumerate() {
                let source = self.convert(member, format);
                let destination = self.unit.values_mut().address(
                    format,
                    pointer,
                    (index as u32 * TargetConfiguration::STACK_SLOT_SIZE) as i32,
                );
                self.unit.append(InstructionKind::Store {
                    destination,
                    source,
                });
            }
            let register = self.config().return_register(RegBank::General);
            self.unit.append(InstructionKind::Return {
                value: Some((pointer, register)),
            });
            return Ok(());
        }

        let members = self.read_pack(node)?;
        let [value] = members.as_slice() else {
            return Err(LoweringError::unsupported(format!(
                "{} returns {} values through registers",
                self.function.name,
                members.len()
            )));
        };
        let format = declared
            .first()
            .copied()
            .unwrap_or_else(|| self.unit.values().format(*value));
        let value = self.convert(*value, format);
        let register = self.config().return_register(format.bank());
        if !self.unit.values().is_fixed(value) && self.unit.try_redirect(value, register) {
            log::trace!("return value redirected to {}", self.config().register_name(register));
        }
        self.unit.append(InstructionKind::Return {
            value: Some((value, register)),
        });
        Ok(())
    }
}

/// The return type does not fit the single return register.
pub(crate) fn returns_through_pointer(returns: Option<&ValueType>) -> bool {
    returns.is_some_and(|returns| returns.flatten().len() > 1)
}

/// Lower one function for `config`.
pub fn lower_function(
    function: &Function,
    config: TargetConfiguration,
) -> LoweringResult<LoweredFunction> {
    FunctionLowering::new(function, config)?.lower()
}

/// Lower every function of a program, folding each result into `session`. A function that
/// fails to lower does not stop the others.
pub fn lower_program(
    functions: &[Function],
    config: TargetConfiguration,
    session: &CompilationSession<'_>,
) -> Vec<LoweringResult<LoweredFunction>> {
    functions
        .iter()
        .map(|function| {
            let lowered = lower_function(function, config);
            match &lowered {
                Ok(result) => session.record_function(result),
                Err(error) => {
                    log::warn!("{}: {error}", function.name);
                    session.record_failure(&function.name);
                }
            }
            lowered
        })
        .collect()
}
