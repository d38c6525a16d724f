// Condition lowering. A boolean expression never becomes a value: it becomes a short sequence of
// jumps. The sequence is first staged as a flat list of InstructionKinds in which every
// comparison is a TemporaryCompare placeholder, so a peephole pass can fold jump-over-jump
// patterns and drop jumps to the label that follows before any operand is read. Only then is
// each placeholder expanded into a scoped comparison: the operands are read and compared inside
// a scope of their own that is merged and exited before the conditional jump, so every label the
// condition targets is reached with the register state the condition started from.

//! Short-circuit condition lowering and jump peephole.

use hashbrown::HashSet;

use super::FunctionLowering;
use crate::core::error::LoweringResult;
use crate::core::instruction::{Condition, InstructionKind, LabelId};
use crate::core::value::Format;
use crate::tree::{Node, NodeKind};

/// Comparison waiting for its placeholder to be expanded.
#[derive(Debug, Clone, Copy)]
enum PendingCompare<'n> {
    Comparison(&'n Node, &'n Node),
    /// `node != 0`.
    Truthy(&'n Node),
}

#[derive(Debug, Default)]
struct StagedCondition<'n> {
    sequence: Vec<InstructionKind>,
    compares: Vec<PendingCompare<'n>>,
    local_labels: HashSet<LabelId>,
}

impl<'n> StagedCondition<'n> {
    fn compare(
        &mut self,
        compare: PendingCompare<'n>,
        condition: Condition,
        success: LabelId,
        failure: LabelId,
    ) {
        self.sequence.push(InstructionKind::TemporaryCompare {
            index: self.compares.len(),
        });
        self.compares.push(compare);
        self.jump(success, Some(condition));
        self.jump(failure, None);
    }

    fn jump(&mut self, label: LabelId, condition: Option<Condition>) {
        self.sequence.push(InstructionKind::Jump { label, condition });
    }
}

impl<'f> FunctionLowering<'f> {
    /// Lower `condition` as jumps to `success` or `failure`, followed by the label of
    /// whichever target `success_follows` selects.
    pub(crate) fn lower_condition(
        &mut self,
        condition: &Node,
        success: LabelId,
        failure: LabelId,
        success_follows: bool,
    ) -> LoweringResult<()> {
        let mut staged = StagedCondition::default();
        self.stage(condition, success, failure, &mut staged)?;
        let follows = if success_follows { success } else { failure };
        staged.sequence.push(InstructionKind::Label(follows));

        let staged_len = staged.sequence.len();
        peephole(&mut staged.sequence, &staged.local_labels);
        log::trace!(
            "condition staged as {staged_len} instructions, {} after peephole",
            staged.sequence.len()
        );

        for kind in staged.sequence {
            match kind {
                InstructionKind::TemporaryCompare { index } => {
                    self.expand_compare(staged.compares[index])?
                }
                other => {
                    self.unit.append(other);
                }
            }
        }
        Ok(())
    }

    fn stage<'n>(
        &mut self,
        node: &'n Node,
        success: LabelId,
        failure: LabelId,
        staged: &mut StagedCondition<'n>,
    ) -> LoweringResult<()> {
        match &node.kind {
            NodeKind::Compare {
                comparison,
                left,
                right,
            } => {
                let format = self.comparison_format(left, right)?;
                let condition = Condition::from_comparison(
                    *comparison,
                    format.is_unsigned() || format.is_decimal(),
                );
                staged.compare(
                    PendingCompare::Comparison(left, right),
                    condition,
                    success,
                    failure,
                );
            }
            NodeKind::And(left, right) => {
                let middle = self.unit.new_label();
                staged.local_labels.insert(middle);
                self.stage(left, middle, failure, staged)?;
                staged.sequence.push(InstructionKind::Label(middle));
                self.stage(right, success, failure, staged)?;
            }
            NodeKind::Or(left, right) => {
                let middle = self.unit.new_label();
                staged.local_labels.insert(middle);
                self.stage(left, success, middle, staged)?;
                staged.sequence.push(InstructionKind::Label(middle));
                self.stage(right, success, failure, staged)?;
            }
            NodeKind::Not(inner) => self.stage(inner, failure, success, staged)?,
            NodeKind::Integer { value, .. } => {
                staged.jump(if *value != 0 { success } else { failure }, None);
            }
            _ => staged.compare(
                PendingCompare::Truthy(node),
                Condition::NotEqual,
                success,
                failure,
            ),
        }
        Ok(())
    }

    /// Format both operands of a comparison are brought to.
    fn comparison_format(&self, left: &Node, right: &Node) -> LoweringResult<Format> {
        let literal = |node: &Node| matches!(node.kind, NodeKind::Integer { .. });
        if literal(left) && !literal(right) {
            self.node_format(right)
        } else {
            self.node_format(left)
        }
    }

    fn expand_compare(&mut self, compare: PendingCompare<'_>) -> LoweringResult<()> {
        let scope = self.unit.new_scope();
        self.unit.append(InstructionKind::EnterScope { scope });
        let (first, second) = match compare {
            PendingCompare::Comparison(left, right) => {
                let format = self.comparison_format(left, right)?;
                let first = self.read(left)?;
                let first = self.convert(first, format);
                let second = self.read(right)?;
                (first, self.convert(second, format))
            }
            PendingCompare::Truthy(node) => {
                let value = self.read(node)?;
                let format = self.unit.values().format(value);
                (value, self.zero(format))
            }
        };
        self.unit.append(InstructionKind::Compare { first, second });
        self.unit.append(InstructionKind::MergeScope {
            scope,
            bindings: Vec::new(),
        });
        self.unit.append(InstructionKind::ExitScope { scope });
        Ok(())
    }
}

fn unconditional(kind: &InstructionKind) -> bool {
    matches!(kind, InstructionKind::Jump { condition: None, .. })
}

fn is_label(kind: &InstructionKind, label: LabelId) -> bool {
    matches!(kind, InstructionKind::Label(l) if *l == label)
}

/// Simplify a staged condition sequence until nothing changes. Labels in `local_labels` are
/// removed once no jump refers to them.
pub(crate) fn peephole(sequence: &mut Vec<InstructionKind>, local_labels: &HashSet<LabelId>) {
    loop {
        let mut changed = false;

        // Jc L; J M; L:  =>  J!c M; L:
        let mut index = 0;
        while index + 2 < sequence.len() {
            let folded = match (&sequence[index], &sequence[index + 1]) {
                (
                    InstructionKind::Jump {
                        label,
                        condition: Some(condition),
                    },
                    InstructionKind::Jump {
                        label: other,
                        condition: None,
                    },
                ) if is_label(&sequence[index + 2], *label) => Some(InstructionKind::Jump {
                    label: *other,
                    condition: Some(condition.invert()),
                }),
                _ => None,
            };
            if let Some(folded) = folded {
                sequence[index] = folded;
                sequence.remove(index + 1);
                changed = true;
            }
            index += 1;
        }

        // J L; L:  =>  L:
        let mut index = 0;
        while index + 1 < sequence.len() {
            let redundant = matches!(
                &sequence[index],
                InstructionKind::Jump { label, .. } if is_label(&sequence[index + 1], *label)
            );
            if redundant {
                sequence.remove(index);
                changed = true;
            } else {
                index += 1;
            }
        }

        // Nothing after an unconditional jump runs until the next label.
        let mut index = 0;
        while index + 1 < sequence.len() {
            let unreachable = unconditional(&sequence[index])
                && !matches!(sequence[index + 1], InstructionKind::Label(_));
            if unreachable {
                sequence.remove(index + 1);
                changed = true;
            } else {
                index += 1;
            }
        }

        let referenced: HashSet<LabelId> = sequence
            .iter()
            .filter_map(|kind| match kind {
                InstructionKind::Jump { label, .. } => Some(*label),
                _ => None,
            })
            .collect();
        let before = sequence.len();
        sequence.retain(|kind| match kind {
            InstructionKind::Label(label) => {
                !local_labels.contains(label) || referenced.contains(label)
            }
            _ => true,
        });
        changed |= sequence.len() != before;

        if !changed {
            break;
        }
    }
}
