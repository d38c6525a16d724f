// Call lowering. Arguments are flattened into scalars, converted to the declared formats and
// paired with the locations the target's CCAssigner hands out; a hidden struct-return pointer
// and the receiver lead the list. The Unit places all arguments with one parallel move at build
// time, so no argument is evaluated into its final register early. A scalar result comes back
// in the return register of its bank. A multi-member result is written by the callee into a
// frame buffer the caller reserves, and each member is read back from it.

use super::FunctionLowering;
use crate::core::calling_convention::assign_arguments;
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::instruction::{CallArgument, InstructionKind};
use crate::core::target::TargetConfiguration;
use crate::core::value::{Format, Location, StackSlot, ValueId};
use crate::tree::{Node, Signature, ValueType};

impl<'f> FunctionLowering<'f> {
    /// Argument `value` in a form the parallel argument move can read directly.
    fn argument_value(&mut self, value: ValueId, format: Format) -> ValueId {
        let value = self.convert(value, format);
        let values = self.unit.values();
        let cell = values.cell(values.cell_of(value));
        let in_memory = cell.address.is_some() || cell.location.is_some_and(Location::is_memory);
        if in_memory {
            self.copy(value, format)
        } else {
            value
        }
    }

    /// Lower a call and return its scalar results in declaration order.
    pub(crate) fn lower_call(
        &mut self,
        signature: &Signature,
        receiver: Option<&Node>,
        arguments: &[Node],
    ) -> LoweringResult<Vec<ValueId>> {
        let receiver = match (signature.has_self, receiver) {
            (true, Some(node)) => Some(self.read(node)?),
            (true, None) => Some(self.self_value.ok_or_else(|| {
                LoweringError::unsupported(format!("call to {} without a receiver", signature.name))
            })?),
            (false, Some(_)) => {
                return Err(LoweringError::unsupported(format!(
                    "receiver passed to {} which takes none",
                    signature.name
                )))
            }
            (false, None) => None,
        };

        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            values.extend(self.read_pack(argument)?);
        }
        let formats: Vec<Format> = signature
            .parameters
            .iter()
            .flat_map(ValueType::flatten)
            .collect();
        if values.len() != formats.len() {
            return Err(LoweringError::invariant(format!(
                "{} takes {} scalar arguments, {} given",
                signature.name,
                formats.len(),
                values.len()
            )));
        }

        let returns = signature
            .returns
            .as_ref()
            .map(ValueType::flatten)
            .unwrap_or_default();
        let struct_return = returns.len() > 1;

        let mut passed = Vec::with_capacity(values.len() + 2);
        let mut buffer = None;
        if struct_return {
            let size = returns.len() as u32 * TargetConfiguration::STACK_SLOT_SIZE;
            let slot = self.unit.allocate_local(size);
            let pointer = self.unit.create_value(Format::U64);
            self.unit.append(InstructionKind::LoadAddress {
                result: pointer,
                slot,
            });
            passed.push(pointer);
            buffer = Some(slot);
        }
        passed.extend(receiver);
        for (value, &format) in values.into_iter().zip(&formats) {
            passed.push(self.argument_value(value, format));
        }

        let config = *self.config();
        let (assignments, stack_size) =
            assign_arguments(&config, struct_return, signature.has_self, &formats);
        let mut call_arguments = Vec::with_capacity(passed.len());
        for (value, assignment) in passed.into_iter().zip(assignments) {
            let location = assignment.location.ok_or_else(|| {
                LoweringError::invariant(format!("argument of {} without a location", signature.name))
            })?;
            call_arguments.push(CallArgument { value, location });
        }

        let target = self.unit.symbol(&signature.name);
        let result = match returns.as_slice() {
            [format] => Some((
                self.unit.create_value(*format),
                config.return_register(format.bank()),
            )),
            _ => None,
        };
        log::trace!(
            "call {} with {} arguments, {} bytes on the stack",
            signature.name,
            call_arguments.len(),
            stack_size
        );
        self.unit.append(InstructionKind::Call {
            target,
            arguments: call_arguments,
            result,
            stack_size,
        });

        if let Some((value, _)) = result {
            return Ok(vec![value]);
        }
        let Some(slot) = buffer else {
            return Ok(Vec::new());
        };
        let mut members = Vec::with_capacity(returns.len());
        for (index, format) in returns.into_iter().enumerate() {
            let member = self.unit.values_mut().memory(
                format,
                Location::Stack(StackSlot::frame(
                    slot.offset + (index as u32 * TargetConfiguration::STACK_SLOT_SIZE) as i32,
                )),
            );
            members.push(self.copy(member, format));
        }
        Ok(members)
    }
}
