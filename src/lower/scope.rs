// Branch lowering. Before a conditional region is entered, every predictable variable the region
// may assign is given a private, register-resident cell: a variable that is still unbound, bound
// to a constant or memory cell, or entangled with another variable's cell would otherwise receive
// the merge move of one path only, or clobber its partner. Each path then ends in a MergeScope
// that moves the path's final binding of every variable into the location the outer value had at
// scope entry, and the variable is rebound to its outer value once the region is closed.

use hashbrown::HashSet;

use super::FunctionLowering;
use crate::core::error::LoweringResult;
use crate::core::instruction::{InstructionKind, MergeBinding};
use crate::core::value::ValueId;
use crate::tree::{walk_all, Node, NodeKind, VariableId};

impl<'f> FunctionLowering<'f> {
    /// Predictable, register-tracked variables assigned anywhere in `nodes`, in first-seen order.
    pub(crate) fn edited_variables(&self, nodes: &[&[Node]]) -> Vec<VariableId> {
        let mut seen = HashSet::new();
        let mut edited = Vec::new();
        for &list in nodes {
            walk_all(list, &mut |node| {
                if let NodeKind::Assign { target, .. } = &node.kind {
                    if let NodeKind::Variable(id) = target.kind {
                        if seen.insert(id) {
                            edited.push(id);
                        }
                    }
                }
            });
        }
        edited.retain(|&id| {
            !self.is_homed(id)
                && self
                    .function
                    .variable(id)
                    .is_some_and(|variable| variable.predictable)
        });
        edited
    }

    /// Give each of `edited` a cell of its own that a merge may overwrite.
    pub(crate) fn prepare_modifiable(&mut self, edited: &[VariableId]) -> LoweringResult<()> {
        for &id in edited {
            let format = self.variable(id)?.format;
            let current = self.binding(id);
            let needs_copy = match current {
                None => true,
                Some(value) => {
                    self.unit.values().is_fixed(value)
                        || self.bindings.iter().enumerate().any(|(index, other)| {
                            index != id.0 as usize
                                && other.is_some_and(|other| {
                                    self.unit.values().same_cell(other, value)
                                })
                        })
                }
            };
            if !needs_copy {
                continue;
            }
            let source = match current {
                Some(value) => value,
                None => self.zero(format),
            };
            let copy = self.copy(source, format);
            self.bind(id, copy);
            log::trace!("{id} made modifiable as {copy}");
        }
        Ok(())
    }

    /// Current bindings, to be restored when a region closes.
    pub(crate) fn save_bindings(&self) -> Vec<(VariableId, ValueId)> {
        self.bindings
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.map(|value| (VariableId(index as u32), value)))
            .collect()
    }

    pub(crate) fn restore_bindings(&mut self, saved: &[(VariableId, ValueId)]) {
        for &(id, value) in saved {
            self.bindings[id.0 as usize] = Some(value);
        }
    }

    /// Merge bindings for every variable whose value changed since `outer` was saved.
    pub(crate) fn merge_bindings(&self, outer: &[(VariableId, ValueId)]) -> Vec<MergeBinding> {
        outer
            .iter()
            .filter_map(|&(id, outer)| {
                let inner = self.binding(id)?;
                (inner != outer).then_some(MergeBinding { outer, inner })
            })
            .collect()
    }

    /// Lower one path of a branch inside its own scope.
    fn lower_path(&mut self, body: &[Node], outer: &[(VariableId, ValueId)]) -> LoweringResult<()> {
        let scope = self.unit.new_scope();
        self.unit.append(InstructionKind::EnterScope { scope });
        for statement in body {
            self.lower_statement(statement)?;
        }
        let bindings = self.merge_bindings(outer);
        self.unit
            .append(InstructionKind::MergeScope { scope, bindings });
        self.unit.append(InstructionKind::ExitScope { scope });
        self.restore_bindings(outer);
        Ok(())
    }

    pub(crate) fn lower_if(
        &mut self,
        condition: &Node,
        body: &[Node],
        otherwise: Option<&[Node]>,
    ) -> LoweringResult<()> {
        let mut regions: Vec<&[Node]> = vec![body];
        if let Some(otherwise) = otherwise {
            regions.push(otherwise);
        }
        let edited = self.edited_variables(&regions);
        self.prepare_modifiable(&edited)?;

        let then_label = self.unit.new_label();
        let else_label = self.unit.new_label();
        self.lower_condition(condition, then_label, else_label, true)?;

        let outer = self.save_bindings();
        self.lower_path(body, &outer)?;

        match otherwise {
            Some(otherwise) => {
                let end_label = self.unit.new_label();
                self.unit.append(InstructionKind::Jump {
                    label: end_label,
                    condition: None,
                });
                self.unit.append(InstructionKind::Label(else_label));
                self.lower_path(otherwise, &outer)?;
                self.unit.append(InstructionKind::Label(end_label));
            }
            None => {
                self.unit.append(InstructionKind::Label(else_label));
            }
        }
        Ok(())
    }
}
