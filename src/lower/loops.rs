// Loop lowering. A loop is bracketed by SymmetryStart and ExitScope: the start caches the stack
// values the loop carries in registers (non-volatile ones when the loop contains a call) and
// snapshots the entry state; every edge that returns to the header or leaves the loop first
// reconciles with that snapshot through a SymmetryEnd. The entry check and the back-edge check
// both test the loop condition, so a loop that never runs jumps straight to its exit. The
// Unit is told the header and exit positions so values carried around the back-edge stay live
// for the whole loop.

use hashbrown::HashSet;

use super::{FunctionLowering, LoopContext};
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::instruction::{InstructionKind, LabelId, ScopeId};
use crate::core::value::ValueId;
use crate::tree::{walk_all, Node, NodeKind, VariableId};

/// Whether `node` leaves the current iteration early.
fn leaves_iteration(node: &Node) -> bool {
    let mut leaves = false;
    node.walk(&mut |node| leaves |= matches!(node.kind, NodeKind::Stop | NodeKind::Continue));
    leaves
}

impl<'f> FunctionLowering<'f> {
    /// Values of the predictable variables an iteration may read before assigning them.
    ///
    /// Only plain assignments at the top level of the body count as assigning a variable, and
    /// none do after a statement that may leave the iteration early.
    fn carried_values(&self, condition: Option<&Node>, body: &[Node], action: &[Node]) -> Vec<ValueId> {
        let mut assigned: HashSet<VariableId> = HashSet::new();
        let mut exposed: Vec<VariableId> = Vec::new();
        let mut expose = |node: &Node, assigned: &HashSet<VariableId>| {
            node.walk_reads(&mut |node| {
                if let NodeKind::Variable(id) = node.kind {
                    if !assigned.contains(&id) && !exposed.contains(&id) {
                        exposed.push(id);
                    }
                }
            });
        };

        if let Some(condition) = condition {
            expose(condition, &assigned);
        }
        let mut complete = true;
        for statement in body.iter().chain(action) {
            expose(statement, &assigned);
            complete &= !leaves_iteration(statement);
            if let NodeKind::Assign { target, .. } = &statement.kind {
                if let NodeKind::Variable(id) = target.kind {
                    if complete {
                        assigned.insert(id);
                    }
                }
            }
        }

        let mut carried: Vec<ValueId> = Vec::new();
        for id in exposed {
            if let Some(value) = self.binding(id) {
                if !carried.contains(&value) {
                    carried.push(value);
                }
            }
        }
        carried
    }

    pub(crate) fn lower_loop(
        &mut self,
        initialization: &[Node],
        condition: Option<&Node>,
        action: &[Node],
        body: &[Node],
    ) -> LoweringResult<()> {
        for statement in initialization {
            self.lower_statement(statement)?;
        }

        let edited = self.edited_variables(&[body, action]);
        self.prepare_modifiable(&edited)?;

        let mut has_call = false;
        let mut find_call = |node: &Node| {
            has_call |= matches!(node.kind, NodeKind::Call { .. });
        };
        walk_all(body, &mut find_call);
        walk_all(action, &mut find_call);
        if let Some(condition) = condition {
            condition.walk(&mut find_call);
        }

        let carried = self.carried_values(condition, body, action);
        let scope = self.unit.new_scope();
        let start_label = self.unit.new_label();
        let continue_label = self.unit.new_label();
        let exit_label = self.unit.new_label();

        let header = self.unit.append(InstructionKind::SymmetryStart {
            scope,
            carried,
            non_volatile: has_call,
        });
        let outer = self.save_bindings();

        match condition {
            Some(condition) => self.lower_condition(condition, start_label, exit_label, true)?,
            None => {
                self.unit.append(InstructionKind::Label(start_label));
            }
        }

        self.loops.push(LoopContext {
            scope,
            continue_label,
            exit_label,
            outer: outer.clone(),
        });
        let lowered = self.lower_loop_body(
            scope,
            continue_label,
            start_label,
            condition,
            action,
            body,
            &outer,
        );
        self.loops.pop();
        lowered?;

        let end = self.unit.append(InstructionKind::ExitScope { scope });
        self.unit.append(InstructionKind::Label(exit_label));
        self.unit.register_loop(header, end);
        self.restore_bindings(&outer);
        log::trace!("loop {} spans {header}..{end}", scope.0);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_loop_body(
        &mut self,
        scope: ScopeId,
        continue_label: LabelId,
        start_label: LabelId,
        condition: Option<&Node>,
        action: &[Node],
        body: &[Node],
        outer: &[(VariableId, ValueId)],
    ) -> LoweringResult<()> {
        for statement in body {
            self.lower_statement(statement)?;
        }
        let bindings = self.merge_bindings(outer);
        self.unit.append(InstructionKind::SymmetryEnd {
            scope,
            bindings,
            exits: false,
        });
        self.unit.append(InstructionKind::Label(continue_label));
        self.restore_bindings(outer);

        if !action.is_empty() {
            for statement in action {
                self.lower_statement(statement)?;
            }
            let bindings = self.merge_bindings(outer);
            self.unit.append(InstructionKind::SymmetryEnd {
                scope,
                bindings,
                exits: false,
            });
            self.restore_bindings(outer);
        }

        match condition {
            Some(condition) => {
                let fall_through = self.unit.new_label();
                self.lower_condition(condition, start_label, fall_through, false)?;
            }
            None => {
                self.unit.append(InstructionKind::Jump {
                    label: start_label,
                    condition: None,
                });
            }
        }
        Ok(())
    }

    /// Jump out of the innermost loop after reconciling with its entry state.
    fn leave_loop(&mut self, construct: &str, to_continue: bool) -> LoweringResult<()> {
        let context = self
            .loops
            .last()
            .cloned()
            .ok_or_else(|| LoweringError::unsupported(format!("{construct} outside a loop")))?;
        let bindings = self.merge_bindings(&context.outer);
        self.unit.append(InstructionKind::SymmetryEnd {
            scope: context.scope,
            bindings,
            exits: true,
        });
        let label = if to_continue {
            context.continue_label
        } else {
            context.exit_label
        };
        self.unit.append(InstructionKind::Jump {
            label,
            condition: None,
        });
        Ok(())
    }

    pub(crate) fn lower_stop(&mut self) -> LoweringResult<()> {
        self.leave_loop("stop", false)
    }

    pub(crate) fn lower_continue(&mut self) -> LoweringResult<()> {
        self.leave_loop("continue", true)
    }
}
