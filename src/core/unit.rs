// This module implements the Unit, the per-function instruction buffer that drives the two
// passes of the lowering engine. Lowering appends virtual instructions over ValueIds. simulate
// then walks the buffer once to compute, per location cell, the position of its definition and
// of its last read, extends the liveness of values that are carried around a loop back-edge,
// and records call positions so values that survive a call prefer non-volatile registers.
// build walks the buffer again with a RegisterFile and a StackFrame, assigning physical
// locations and writing MachineInstructions. Evictions, reloads and scope merges insert their
// own moves in front of the instruction that forced them, carrying its position. Scope and
// symmetry markers snapshot the (cell, location) pairs of live values and restore them at the
// join points, so every path reaching a label agrees on where each live value is. post_build
// finally chooses the width variant of every move.

//! Per-function instruction buffer with simulate, build and post-build passes.

use hashbrown::{HashMap, HashSet};

use super::calling_convention::ArgumentLocation;
use super::error::{LoweringError, LoweringResult};
use super::frame::StackFrame;
use super::instruction::{
    ArithmeticOperator, CallArgument, Instruction, InstructionKind, LabelId, MachineInstruction,
    MergeBinding, Operation, ScopeId,
};
use super::parallel_move::{self, PendingMove, ResolvedMove};
use super::register_file::{AsmReg, PoolPreference, RegBank, RegBitSet, RegisterFile, Selection};
use super::target::TargetConfiguration;
use super::value::{
    CellId, Constant, Format, Location, MemoryAddress, Metadata, Position, StackBase, StackSlot,
    SymbolId, ValueId, ValueTable,
};

/// Locations of the live cells at a scope entry.
#[derive(Debug, Clone)]
struct Snapshot {
    position: Position,
    cells: Vec<(CellId, Location)>,
}

/// Positions spanned by one loop, from its symmetry start to its exit.
#[derive(Debug, Clone, Copy)]
struct LoopRange {
    header: Position,
    end: Position,
}

/// Counters reported with every lowered function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStatistics {
    pub instructions: usize,
    pub moves: usize,
    pub exchanges: usize,
    pub spills: usize,
}

/// Result of building one function.
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub name: String,
    pub instructions: Vec<MachineInstruction>,
    /// Locals, spill slots and the outgoing argument area, 16-byte aligned.
    pub frame_size: u32,
    /// Non-volatile registers the prologue must preserve.
    pub saved_registers: Vec<AsmReg>,
    pub symbols: Vec<String>,
    pub statistics: UnitStatistics,
}

impl LoweredFunction {
    pub fn operations(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.instructions.iter().map(|instruction| &instruction.operation)
    }

    /// Assembly-like listing.
    pub fn render(&self, config: &TargetConfiguration) -> String {
        let mut listing = format!("{}:\n", self.name);
        for instruction in &self.instructions {
            listing.push_str(&instruction.render(config, &self.symbols));
            listing.push('\n');
        }
        listing
    }
}

pub struct Unit {
    name: String,
    config: TargetConfiguration,
    values: ValueTable,
    instructions: Vec<Instruction>,
    position: Position,
    next_label: u32,
    next_scope: u32,
    symbols: Vec<String>,
    symbol_ids: HashMap<String, SymbolId>,
    loops: Vec<LoopRange>,
    call_positions: Vec<Position>,

    // Build state.
    registers: RegisterFile,
    frame: StackFrame,
    snapshots: HashMap<ScopeId, Snapshot>,
    /// Registers the current instruction reads or has reserved; never chosen for eviction.
    protected: RegBitSet,
    output: Vec<MachineInstruction>,
    statistics: UnitStatistics,
}

impl Unit {
    pub fn new(name: &str, config: TargetConfiguration) -> Self {
        Self {
            name: name.to_string(),
            registers: RegisterFile::new(
                config.allocatable_registers(),
                config.volatile_registers(),
            ),
            config,
            values: ValueTable::new(),
            instructions: Vec::new(),
            position: 0,
            next_label: 0,
            next_scope: 0,
            symbols: Vec::new(),
            symbol_ids: HashMap::new(),
            loops: Vec::new(),
            call_positions: Vec::new(),
            frame: StackFrame::new(),
            snapshots: HashMap::new(),
            protected: RegBitSet::new(),
            output: Vec::new(),
            statistics: UnitStatistics::default(),
        }
    }

    pub fn config(&self) -> &TargetConfiguration {
        &self.config
    }

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueTable {
        &mut self.values
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Position of the most recently appended instruction.
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn create_value(&mut self, format: Format) -> ValueId {
        self.values.create(format)
    }

    pub fn constant(&mut self, constant: Constant, format: Format) -> ValueId {
        self.values.constant(constant, format)
    }

    /// Value living in a register or stack slot on entry (parameters).
    pub fn parameter(&mut self, format: Format, location: ArgumentLocation) -> LoweringResult<ValueId> {
        let value = self.values.create(format);
        let cell = self.values.cell_of(value);
        match location {
            ArgumentLocation::Register(reg) => {
                self.registers.assign(reg, cell)?;
                self.values.bind(cell, Location::Register(reg));
            }
            ArgumentLocation::Stack(offset) => {
                self.values.bind(
                    cell,
                    Location::Stack(StackSlot {
                        base: StackBase::Incoming,
                        offset,
                    }),
                );
            }
        }
        Ok(value)
    }

    pub fn new_label(&mut self) -> LabelId {
        self.next_label += 1;
        LabelId(self.next_label - 1)
    }

    pub fn new_scope(&mut self) -> ScopeId {
        self.next_scope += 1;
        ScopeId(self.next_scope - 1)
    }

    pub fn symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbol_ids.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(name.to_string());
        self.symbol_ids.insert(name.to_string(), id);
        id
    }

    /// Permanent frame slot (home slots, return buffers).
    pub fn allocate_local(&mut self, size: u32) -> StackSlot {
        self.frame.allocate_local(size)
    }

    pub fn append(&mut self, kind: InstructionKind) -> Position {
        self.position += 1;
        log::trace!("append {} at {}", kind.name(), self.position);
        self.instructions.push(Instruction {
            position: self.position,
            kind,
            hint: None,
        });
        self.position
    }

    /// Ask the producer of `value` (or of any value entangled with it) to place its result
    /// in `register`.
    ///
    /// Fails when the producer does not support redirection (calls, divides and other kinds
    /// with fixed result registers).
    pub fn redirect(&mut self, value: ValueId, register: AsmReg) -> LoweringResult<()> {
        let values = &self.values;
        let instruction = self
            .instructions
            .iter_mut()
            .rev()
            .find(|instruction| {
                instruction
                    .kind
                    .result()
                    .is_some_and(|result| values.same_cell(result, value))
            })
            .ok_or_else(|| LoweringError::invariant(format!("{value} has no producer to redirect")))?;
        if !instruction.kind.allows_redirection() {
            return Err(LoweringError::invariant(format!(
                "{} result cannot be redirected",
                instruction.kind.name()
            )));
        }
        instruction.hint = Some(register);
        Ok(())
    }

    /// Try to redirect; returns whether the producer accepted.
    pub fn try_redirect(&mut self, value: ValueId, register: AsmReg) -> bool {
        let accepts = self
            .instructions
            .iter()
            .rev()
            .find(|instruction| {
                instruction
                    .kind
                    .result()
                    .is_some_and(|result| self.values.same_cell(result, value))
            })
            .is_some_and(|instruction| instruction.kind.allows_redirection());
        accepts && self.redirect(value, register).is_ok()
    }

    /// Record a loop spanning `header..=end` for liveness extension.
    pub fn register_loop(&mut self, header: Position, end: Position) {
        self.loops.push(LoopRange { header, end });
    }

    /// Run `f` with `registers` locked against selection, unlocking on every path.
    pub fn with_locked<T>(
        &mut self,
        registers: &[AsmReg],
        f: impl FnOnce(&mut Self) -> LoweringResult<T>,
    ) -> LoweringResult<T> {
        for (index, &reg) in registers.iter().enumerate() {
            if let Err(error) = self.registers.lock(reg) {
                for &locked in &registers[..index] {
                    let _ = self.registers.unlock(locked);
                }
                return Err(error.into());
            }
        }

        let result = f(self);

        let mut unlocked = Ok(());
        for &reg in registers {
            if let Err(error) = self.registers.unlock(reg) {
                unlocked = Err(LoweringError::from(error));
            }
        }
        let value = result?;
        unlocked.map(|()| value)
    }

    pub fn is_locked(&self, reg: AsmReg) -> bool {
        self.registers.is_locked(reg)
    }

    // ---------------------------------------------------------------------------------------
    // simulate
    // ---------------------------------------------------------------------------------------

    fn mark_read(&mut self, value: ValueId, position: Position) {
        self.values.mark_use(value, position);
        let cell = self.values.cell_of(value);
        if let Some(expression) = self.values.cell(cell).address {
            for operand in expression.operands() {
                self.mark_read(operand, position);
            }
        }
    }

    /// Compute definition and last-use positions of every cell.
    pub fn simulate(&mut self) -> LoweringResult<()> {
        self.values.reset_liveness();
        self.call_positions.clear();

        let instructions = std::mem::take(&mut self.instructions);
        let mut outcome = Ok(());
        for instruction in &instructions {
            let position = instruction.position;
            if let InstructionKind::TemporaryCompare { index } = instruction.kind {
                outcome = Err(LoweringError::invariant(format!(
                    "staged comparison {index} reached simulate at {position}"
                )));
                break;
            }
            for value in instruction.kind.references() {
                self.mark_read(value, position);
            }
            if let Some(result) = instruction.kind.result() {
                self.values.mark_definition(result, position);
            }
            if instruction.kind.is_call() {
                self.call_positions.push(position);
            }
        }
        self.instructions = instructions;
        outcome?;

        self.extend_loop_liveness();
        log::debug!(
            "{}: simulated {} instructions, {} cells, {} calls",
            self.name,
            self.instructions.len(),
            self.values.cell_count(),
            self.call_positions.len()
        );
        Ok(())
    }

    /// A cell defined before a loop and read inside it stays live until the loop ends.
    fn extend_loop_liveness(&mut self) {
        let cells: Vec<CellId> = self.values.cell_ids().collect();
        loop {
            let mut changed = false;
            for range in &self.loops {
                for &id in &cells {
                    let cell = self.values.cell_mut(id);
                    let defined = cell.defined_at.unwrap_or(0);
                    if let Some(last) = cell.last_use {
                        if defined < range.header && last >= range.header && last < range.end {
                            cell.last_use = Some(range.end);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn survives_call(&self, cell: CellId) -> bool {
        let cell = self.values.cell(cell);
        let defined = cell.defined_at.unwrap_or(0);
        let Some(last) = cell.last_use else {
            return false;
        };
        self.call_positions
            .iter()
            .any(|&call| call >= defined && call < last)
    }

    fn preference(&self, cell: CellId) -> PoolPreference {
        if self.survives_call(cell) {
            PoolPreference::NonVolatileFirst
        } else {
            PoolPreference::VolatileFirst
        }
    }

    // ---------------------------------------------------------------------------------------
    // build
    // ---------------------------------------------------------------------------------------

    /// Simulate, build and post-build the buffer into a finished function.
    pub fn build(mut self) -> LoweringResult<LoweredFunction> {
        self.simulate()?;

        let instructions = std::mem::take(&mut self.instructions);
        for instruction in &instructions {
            self.build_instruction(instruction)?;
        }

        self.drop_unreferenced_labels();
        for machine in &mut self.output {
            machine.post_build();
        }

        self.statistics.instructions = self.output.len();
        self.statistics.spills = self.frame.spill_count();
        log::debug!(
            "{}: built {} operations ({} moves, {} exchanges, {} spills), frame {} bytes",
            self.name,
            self.statistics.instructions,
            self.statistics.moves,
            self.statistics.exchanges,
            self.statistics.spills,
            self.frame.size()
        );

        Ok(LoweredFunction {
            name: self.name,
            instructions: self.output,
            frame_size: self.frame.size(),
            saved_registers: self.registers.used_non_volatile(),
            symbols: self.symbols,
            statistics: self.statistics,
        })
    }

    /// Remove label definitions no jump targets.
    fn drop_unreferenced_labels(&mut self) {
        let targeted: HashSet<LabelId> = self
            .output
            .iter()
            .filter_map(|machine| match machine.operation {
                Operation::Jump { label, .. } => Some(label),
                _ => None,
            })
            .collect();
        let before = self.output.len();
        self.output.retain(|machine| match machine.operation {
            Operation::Label(label) => targeted.contains(&label),
            _ => true,
        });
        log::trace!(
            "{}: dropped {} unreferenced labels",
            self.name,
            before - self.output.len()
        );
    }

    fn is_dead(&self, cell: CellId) -> bool {
        !self.values.is_live_after(cell, self.position)
    }

    fn build_instruction(&mut self, instruction: &Instruction) -> LoweringResult<()> {
        self.position = instruction.position;
        self.protected = RegBitSet::new();
        for value in instruction.kind.references() {
            self.protect_value(value);
        }

        match &instruction.kind {
            InstructionKind::Label(label) => self.emit(Operation::Label(*label)),
            InstructionKind::Jump { label, condition } => self.emit(Operation::Jump {
                label: *label,
                condition: *condition,
            }),
            InstructionKind::DebugPosition { line, column } => self.emit(Operation::DebugPosition {
                line: *line,
                column: *column,
            }),
            InstructionKind::Copy { result, source } => {
                if self.values.cell(self.values.cell_of(*result)).last_use.is_some() {
                    self.build_copy(*result, *source, instruction.hint)?
                } else {
                    log::trace!("{result} is never read, copy dropped");
                }
            }
            InstructionKind::Store {
                destination,
                source,
            } => {
                let target = self.resolve(*destination)?;
                let location = self.resolve(*source)?;
                let format = self.values.format(*destination);
                let source_format = self.values.format(*source);
                self.emit_move(target, location, format, source_format);
            }
            InstructionKind::Arithmetic {
                operator,
                result,
                first,
                second,
            } => self.build_arithmetic(*operator, *result, *first, *second, instruction.hint)?,
            InstructionKind::Negate { result, source } => {
                self.build_negate(*result, *source, instruction.hint)?
            }
            InstructionKind::ScaledAddress {
                result,
                value,
                scale,
            } => {
                let base = self.to_register(*value)?;
                let destination = self.result_register(*result, Some(*value), instruction.hint)?;
                self.emit(Operation::ScaledAddress {
                    destination,
                    base,
                    index: base,
                    scale: *scale,
                });
                self.place_result(*result, destination)?;
            }
            InstructionKind::WideMultiply {
                result,
                first,
                second,
            } => self.build_wide_multiply(*result, *first, *second)?,
            InstructionKind::Divide {
                result,
                dividend,
                divisor,
                remainder,
            } => self.build_divide(*result, *dividend, *divisor, *remainder)?,
            InstructionKind::Compare { first, second } => self.build_compare(*first, *second)?,
            InstructionKind::TemporaryCompare { index } => {
                return Err(LoweringError::invariant(format!(
                    "staged comparison {index} reached build"
                )))
            }
            InstructionKind::LoadAddress { result, slot } => {
                let destination = self.result_register(*result, None, instruction.hint)?;
                self.emit(Operation::LoadAddress {
                    destination,
                    address: Location::Stack(*slot),
                });
                self.place_result(*result, destination)?;
            }
            InstructionKind::Call {
                target,
                arguments,
                result,
                stack_size,
            } => self.build_call(*target, arguments, *result, *stack_size)?,
            InstructionKind::Return { value } => {
                if let Some((value, reg)) = value {
                    let location = self.resolve(*value)?;
                    let format = self.values.format(*value);
                    self.emit_move(Location::Register(*reg), location, format, format);
                }
                self.emit(Operation::Return);
            }
            InstructionKind::SetVariable { variable, value } => {
                log::trace!("{variable} is now {value}");
                self.values.set_metadata(*value, Metadata::Variable(*variable));
            }
            InstructionKind::EnterScope { scope } => self.enter_scope(*scope),
            InstructionKind::MergeScope { scope, bindings } => {
                self.merge_scope(*scope, bindings, true)?
            }
            InstructionKind::ExitScope { scope } => self.exit_scope(*scope)?,
            InstructionKind::SymmetryStart {
                scope,
                carried,
                non_volatile,
            } => self.symmetry_start(*scope, carried, *non_volatile)?,
            InstructionKind::SymmetryEnd {
                scope,
                bindings,
                exits,
            } => self.merge_scope(*scope, bindings, !exits)?,
        }

        #[cfg(debug_assertions)]
        self.verify_exclusivity()?;
        Ok(())
    }

    fn protect_value(&mut self, value: ValueId) {
        let cell = self.values.cell(self.values.cell_of(value));
        let address = cell.address;
        if let Some(Location::Register(reg)) = cell.location {
            self.protected.set(reg);
        }
        if let Some(expression) = address {
            for operand in expression.operands() {
                self.protect_value(operand);
            }
        }
    }

    /// Every live cell that claims a register is that register's holder.
    #[cfg(debug_assertions)]
    fn verify_exclusivity(&self) -> LoweringResult<()> {
        for id in self.values.cell_ids() {
            let cell = self.values.cell(id);
            if cell.fixed || self.is_dead(id) {
                continue;
            }
            if let Some(Location::Register(reg)) = cell.location {
                if self.registers.holder(reg) != Some(id) {
                    return Err(LoweringError::invariant(format!(
                        "{id} claims {} held by {:?} at {}",
                        self.config.register_name(reg),
                        self.registers.holder(reg),
                        self.position
                    )));
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, operation: Operation) {
        self.output.push(MachineInstruction {
            position: self.position,
            operation,
        });
    }

    /// Transfer `source` into `destination`, staging through the scratch register when
    /// the target cannot move between the two directly.
    fn emit_move(
        &mut self,
        destination: Location,
        source: Location,
        format: Format,
        source_format: Format,
    ) {
        if destination == source && format == source_format {
            return;
        }
        self.statistics.moves += 1;

        if let (Location::Register(reg), Location::Constant(constant)) = (destination, source) {
            if constant.is_zero() && !format.is_decimal() {
                self.emit(Operation::Clear {
                    destination: reg,
                    format,
                });
                return;
            }
        }

        if destination.is_memory() && self.needs_staging(source) {
            let scratch = self.config.scratch_register(source_format.bank());
            self.registers.touch(scratch);
            self.push_move(Location::Register(scratch), source, source_format, source_format);
            self.push_move(destination, Location::Register(scratch), format, source_format);
            return;
        }
        self.push_move(destination, source, format, source_format);
    }

    fn needs_staging(&self, source: Location) -> bool {
        match source {
            Location::Register(_) => false,
            Location::Constant(Constant::Integer(value)) => {
                !self.config.is_x64() || i32::try_from(value).is_err()
            }
            Location::Constant(Constant::Decimal(_)) => true,
            Location::Stack(_) | Location::Address(_) | Location::Data(_) => true,
        }
    }

    fn push_move(
        &mut self,
        destination: Location,
        source: Location,
        format: Format,
        source_format: Format,
    ) {
        log::trace!("move {destination:?} <- {source:?} at {}", self.position);
        self.emit(Operation::Move {
            destination,
            source,
            format,
            source_format,
            variant: super::instruction::MoveVariant::Plain,
        });
    }

    fn emit_exchange(&mut self, first: Location, second: Location, format: Format) {
        self.statistics.exchanges += 1;
        match (first, second) {
            (Location::Register(_), _) | (_, Location::Register(_)) => {
                self.emit(Operation::Exchange { first, second })
            }
            _ => {
                let scratch = Location::Register(self.config.scratch_register(format.bank()));
                self.push_move(scratch, first, format, format);
                self.emit(Operation::Exchange {
                    first: scratch,
                    second,
                });
                self.push_move(first, scratch, format, format);
            }
        }
    }

    /// Emit a resolved parallel move set.
    fn emit_parallel(&mut self, moves: Vec<PendingMove>) {
        for step in parallel_move::resolve(moves) {
            match step {
                ResolvedMove::Move(PendingMove {
                    source,
                    destination,
                    format,
                }) => self.emit_move(destination, source, format, format),
                ResolvedMove::Exchange {
                    first,
                    second,
                    format,
                } => self.emit_exchange(first, second, format),
            }
        }
    }

    /// Current location of a value, materializing address expressions.
    fn resolve(&mut self, value: ValueId) -> LoweringResult<Location> {
        let cell = self.values.cell(self.values.cell_of(value));
        if let Some(expression) = cell.address {
            let base = self.to_register(expression.base)?;
            let index = expression
                .index
                .map(|index| self.to_register(index))
                .transpose()?;
            return Ok(Location::Address(MemoryAddress {
                base,
                index,
                stride: expression.stride,
                offset: expression.offset,
            }));
        }
        cell.location
            .ok_or_else(|| LoweringError::invariant(format!("{value} read before it was placed")))
    }

    /// Make sure `value` is in a register for the current instruction.
    ///
    /// Fixed values (constants, memory homes) are loaded into a temporary that is only
    /// reserved until the instruction completes. Other values are reloaded into a register
    /// that becomes their new location.
    fn to_register(&mut self, value: ValueId) -> LoweringResult<AsmReg> {
        let location = self.resolve(value)?;
        if let Location::Register(reg) = location {
            self.protected.set(reg);
            return Ok(reg);
        }

        let cell = self.values.cell_of(value);
        let format = self.values.format(value);
        let reg = self.allocate_register(format.bank(), self.preference(cell), None)?;
        self.emit_move(Location::Register(reg), location, format, format);
        self.protected.set(reg);

        if !self.values.is_fixed(value) {
            if let Location::Stack(slot) = location {
                self.frame.release(slot);
            }
            self.registers.assign(reg, cell)?;
            self.values.bind(cell, Location::Register(reg));
        }
        Ok(reg)
    }

    /// Free a register of `bank` for the current instruction.
    fn allocate_register(
        &mut self,
        bank: RegBank,
        preference: PoolPreference,
        hint: Option<AsmReg>,
    ) -> LoweringResult<AsmReg> {
        if let Some(hint) = hint {
            let usable = hint.bank == bank
                && self.registers.is_allocatable(hint)
                && !self.registers.is_locked(hint)
                && !self.protected.contains(hint)
                && self.registers.holder(hint).map_or(true, |cell| self.is_dead(cell));
            if usable {
                self.registers.release(hint);
                return Ok(hint);
            }
        }

        let position = self.position;
        let values = &self.values;
        let selection = self.registers.select(bank, preference, &self.protected, |cell| {
            !values.is_live_after(cell, position)
        })?;
        match selection {
            Selection::Free(reg) => Ok(reg),
            Selection::Dead(reg, _) => {
                self.registers.release(reg);
                Ok(reg)
            }
            Selection::Evict(reg, cell) => {
                log::trace!("evicting {cell} from {}", self.config.register_name(reg));
                self.relocate(cell, reg, self.preference(cell))?;
                Ok(reg)
            }
        }
    }

    /// Move the holder of `from` to another free register, or spill it.
    fn relocate(
        &mut self,
        cell: CellId,
        from: AsmReg,
        preference: PoolPreference,
    ) -> LoweringResult<()> {
        self.registers.release(from);
        let format = self.values.cell(cell).format;
        let was_protected = self.protected.contains(from);

        let mut exclude = self.protected;
        exclude.set(from);
        let position = self.position;
        let values = &self.values;
        let selection = self.registers.select(format.bank(), preference, &exclude, |holder| {
            !values.is_live_after(holder, position)
        });

        let target = match selection {
            Ok(Selection::Free(reg)) | Ok(Selection::Dead(reg, _)) => {
                self.registers.release(reg);
                self.registers.assign(reg, cell)?;
                if was_protected {
                    self.protected.set(reg);
                }
                Location::Register(reg)
            }
            _ => {
                let values = &self.values;
                let slot = self
                    .frame
                    .spill(cell, |holder| !values.is_live_after(holder, position));
                log::debug!("{}: spilling {cell} at {}", self.name, self.position);
                Location::Stack(slot)
            }
        };
        self.emit_move(target, Location::Register(from), format, format);
        self.values.bind(cell, target);
        Ok(())
    }

    /// Take `reg` away from its current holder.
    fn claim(&mut self, reg: AsmReg) -> LoweringResult<()> {
        if let Some(cell) = self.registers.holder(reg) {
            if !self.is_dead(cell) || self.protected.contains(reg) {
                self.relocate(cell, reg, self.preference(cell))?;
            } else {
                self.registers.release(reg);
            }
        }
        self.protected.set(reg);
        Ok(())
    }

    /// Place `value` in the fixed register `reg`. With `clobbered`, a holder that stays live
    /// is first copied elsewhere since the instruction overwrites `reg`.
    fn load_fixed(&mut self, value: ValueId, reg: AsmReg, clobbered: bool) -> LoweringResult<()> {
        let cell = self.values.cell_of(value);
        if self.registers.holder(reg) == Some(cell) {
            if clobbered && !self.is_dead(cell) {
                self.relocate(cell, reg, self.preference(cell))?;
            }
            self.protected.set(reg);
            return Ok(());
        }

        self.claim(reg)?;
        let location = self.resolve(value)?;
        let format = self.values.format(value);
        self.emit_move(Location::Register(reg), location, format, format);
        Ok(())
    }

    /// Register for the result of the current instruction. A dying, register-resident
    /// `reuse` operand donates its register.
    fn result_register(
        &mut self,
        result: ValueId,
        reuse: Option<ValueId>,
        hint: Option<AsmReg>,
    ) -> LoweringResult<AsmReg> {
        let format = self.values.format(result);
        if hint.is_none() {
            if let Some(operand) = reuse {
                if let Some(reg) = self.donated_register(operand, format) {
                    return Ok(reg);
                }
            }
        }
        let cell = self.values.cell_of(result);
        self.allocate_register(format.bank(), self.preference(cell), hint)
    }

    fn donated_register(&self, operand: ValueId, format: Format) -> Option<AsmReg> {
        if self.values.is_fixed(operand) || !self.values.is_dying(operand, self.position) {
            return None;
        }
        match self.values.location(operand) {
            Some(Location::Register(reg)) if reg.bank == format.bank() => Some(reg),
            _ => None,
        }
    }

    fn place_result(&mut self, result: ValueId, reg: AsmReg) -> LoweringResult<()> {
        let cell = self.values.cell_of(result);
        if let Some(Location::Stack(slot)) = self.values.cell(cell).location {
            self.frame.release(slot);
        }
        if let Some(Location::Register(previous)) = self.values.cell(cell).location {
            if previous != reg && self.registers.holder(previous) == Some(cell) {
                self.registers.release(previous);
            }
        }
        self.registers.assign(reg, cell)?;
        self.values.bind(cell, Location::Register(reg));
        self.protected.set(reg);
        Ok(())
    }

    fn build_copy(
        &mut self,
        result: ValueId,
        source: ValueId,
        hint: Option<AsmReg>,
    ) -> LoweringResult<()> {
        let location = self.resolve(source)?;
        let format = self.values.format(result);
        let source_format = self.values.format(source);

        let destination = self.result_register(result, Some(source), hint)?;
        self.emit_move(Location::Register(destination), location, format, source_format);
        self.place_result(result, destination)
    }

    /// Immediate operand for `value`, when the target can encode it.
    fn immediate(&self, value: ValueId, operator: Option<ArithmeticOperator>) -> Option<Location> {
        if self.values.format(value).is_decimal() {
            return None;
        }
        let integer = self.values.constant_of(value)?.as_integer()?;
        let encodable = match operator {
            Some(operator) if operator.is_shift() => (0..64).contains(&integer),
            _ if self.config.is_x64() => i32::try_from(integer).is_ok(),
            None | Some(ArithmeticOperator::Add) | Some(ArithmeticOperator::Subtract) => {
                (0..=4095).contains(&integer)
            }
            Some(_) => false,
        };
        encodable.then_some(Location::Constant(Constant::Integer(integer)))
    }

    fn build_arithmetic(
        &mut self,
        operator: ArithmeticOperator,
        result: ValueId,
        first: ValueId,
        second: ValueId,
        hint: Option<AsmReg>,
    ) -> LoweringResult<()> {
        let format = self.values.format(result);
        if format.is_decimal() && operator.is_shift() {
            return Err(LoweringError::unsupported(format!(
                "{} on decimal values",
                operator.mnemonic()
            )));
        }

        let variable_shift = operator.is_shift() && self.immediate(second, Some(operator)).is_none();
        match self.config.shift_register().filter(|_| variable_shift) {
            Some(count) => self.with_locked(&[count], |unit| {
                unit.load_fixed(second, count, false)?;
                unit.finish_arithmetic(operator, result, first, Location::Register(count), hint)
            }),
            None => {
                let operand = match self.immediate(second, Some(operator)) {
                    Some(immediate) => immediate,
                    None => Location::Register(self.to_register(second)?),
                };
                self.finish_arithmetic(operator, result, first, operand, hint)
            }
        }
    }

    fn finish_arithmetic(
        &mut self,
        operator: ArithmeticOperator,
        result: ValueId,
        first: ValueId,
        second: Location,
        hint: Option<AsmReg>,
    ) -> LoweringResult<()> {
        let format = self.values.format(result);
        let first_location = self.resolve(first)?;
        let destination = match self.donated_register(first, format).filter(|_| hint.is_none()) {
            Some(reg) if Location::Register(reg) != second => reg,
            _ => {
                let cell = self.values.cell_of(result);
                self.allocate_register(format.bank(), self.preference(cell), hint)?
            }
        };

        let first = if self.config.is_x64() {
            // Two-address form: the destination starts out as the first operand.
            let first_format = self.values.format(first);
            self.emit_move(Location::Register(destination), first_location, format, first_format);
            destination
        } else {
            match first_location {
                Location::Register(reg) => reg,
                other => {
                    let first_format = self.values.format(first);
                    self.emit_move(Location::Register(destination), other, format, first_format);
                    destination
                }
            }
        };

        self.emit(Operation::Arithmetic {
            operator,
            destination,
            first,
            second,
            format,
        });
        self.place_result(result, destination)
    }

    fn build_negate(
        &mut self,
        result: ValueId,
        source: ValueId,
        hint: Option<AsmReg>,
    ) -> LoweringResult<()> {
        let format = self.values.format(result);
        if format.is_decimal() {
            return Err(LoweringError::unsupported("negation of decimal values"));
        }
        let source_reg = self.to_register(source)?;
        let destination = self.result_register(result, Some(source), hint)?;
        self.emit(Operation::Negate {
            destination,
            source: source_reg,
            format,
        });
        self.place_result(result, destination)
    }

    fn build_wide_multiply(
        &mut self,
        result: ValueId,
        first: ValueId,
        second: ValueId,
    ) -> LoweringResult<()> {
        match (self.config.numerator_register(), self.config.remainder_register()) {
            (Some(low), Some(high)) => {
                self.load_fixed(first, low, true)?;
                self.claim(high)?;
                self.with_locked(&[low, high], |unit| {
                    let multiplier = unit.to_register(second)?;
                    unit.emit(Operation::WideMultiply {
                        high,
                        first: low,
                        second: multiplier,
                    });
                    unit.place_result(result, high)
                })
            }
            _ => {
                let first_reg = self.to_register(first)?;
                let second_reg = self.to_register(second)?;
                let destination = self.result_register(result, Some(first), None)?;
                self.emit(Operation::WideMultiply {
                    high: destination,
                    first: first_reg,
                    second: second_reg,
                });
                self.place_result(result, destination)
            }
        }
    }

    fn build_divide(
        &mut self,
        result: ValueId,
        dividend: ValueId,
        divisor: ValueId,
        remainder: bool,
    ) -> LoweringResult<()> {
        let format = self.values.format(result);
        if format.is_decimal() {
            return Err(LoweringError::invariant("integer divide on decimal values"));
        }

        match (self.config.numerator_register(), self.config.remainder_register()) {
            (Some(numerator), Some(high)) => {
                self.load_fixed(dividend, numerator, true)?;
                self.claim(high)?;
                self.with_locked(&[numerator, high], |unit| {
                    let mut divisor_reg = unit.to_register(divisor)?;
                    if divisor_reg == numerator || divisor_reg == high {
                        let copy = unit.allocate_register(
                            RegBank::General,
                            PoolPreference::VolatileFirst,
                            None,
                        )?;
                        unit.emit_move(
                            Location::Register(copy),
                            Location::Register(divisor_reg),
                            format,
                            format,
                        );
                        unit.protected.set(copy);
                        divisor_reg = copy;
                    }

                    if format.is_unsigned() {
                        unit.emit(Operation::Clear {
                            destination: high,
                            format,
                        });
                    } else {
                        unit.emit(Operation::ExtendSign {
                            destination: high,
                            source: numerator,
                            format,
                        });
                    }
                    unit.emit(Operation::Divide {
                        quotient: numerator,
                        dividend: numerator,
                        divisor: divisor_reg,
                        format,
                    });
                    unit.place_result(result, if remainder { high } else { numerator })
                })
            }
            _ => {
                let dividend_reg = self.to_register(dividend)?;
                let divisor_reg = self.to_register(divisor)?;
                let quotient = if remainder {
                    let temporary =
                        self.allocate_register(RegBank::General, PoolPreference::VolatileFirst, None)?;
                    self.protected.set(temporary);
                    temporary
                } else {
                    self.result_register(result, None, None)?
                };
                self.emit(Operation::Divide {
                    quotient,
                    dividend: dividend_reg,
                    divisor: divisor_reg,
                    format,
                });
                if !remainder {
                    return self.place_result(result, quotient);
                }
                let destination = self.result_register(result, None, None)?;
                self.emit(Operation::MultiplySubtract {
                    destination,
                    multiplicand: quotient,
                    multiplier: divisor_reg,
                    minuend: dividend_reg,
                });
                self.place_result(result, destination)
            }
        }
    }

    fn build_compare(&mut self, first: ValueId, second: ValueId) -> LoweringResult<()> {
        let format = self.values.format(first);
        let first = self.to_register(first)?;
        let second = match self.immediate(second, None) {
            Some(immediate) => immediate,
            None => Location::Register(self.to_register(second)?),
        };
        self.emit(Operation::Compare {
            first: Location::Register(first),
            second,
            format,
        });
        Ok(())
    }

    fn build_call(
        &mut self,
        target: SymbolId,
        arguments: &[CallArgument],
        result: Option<(ValueId, AsmReg)>,
        stack_size: u32,
    ) -> LoweringResult<()> {
        for (reg, cell) in self.registers.volatile_holders() {
            if !self.is_dead(cell) {
                self.relocate(cell, reg, PoolPreference::NonVolatileOnly)?;
            }
        }

        let mut moves = Vec::with_capacity(arguments.len());
        for argument in arguments {
            let source = self.resolve(argument.value)?;
            let destination = match argument.location {
                ArgumentLocation::Register(reg) => Location::Register(reg),
                ArgumentLocation::Stack(offset) => Location::Stack(StackSlot {
                    base: StackBase::Outgoing,
                    offset,
                }),
            };
            moves.push(PendingMove::new(
                source,
                destination,
                self.values.format(argument.value),
            ));
        }
        self.emit_parallel(moves);

        for (reg, cell) in self.registers.volatile_holders() {
            if !self.is_dead(cell) {
                return Err(LoweringError::invariant(format!(
                    "{cell} is live across a call in volatile {}",
                    self.config.register_name(reg)
                )));
            }
        }

        self.emit(Operation::Call { target });
        let volatile: Vec<AsmReg> = self
            .registers
            .allocatable()
            .iter()
            .filter(|reg| self.registers.is_volatile(*reg))
            .collect();
        for reg in volatile {
            self.registers.release(reg);
        }
        self.frame.reserve_outgoing(stack_size);

        if let Some((value, reg)) = result {
            self.protected = RegBitSet::new();
            self.place_result(value, reg)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // scopes
    // ---------------------------------------------------------------------------------------

    fn snapshot(&self) -> Snapshot {
        let cells = self
            .values
            .cell_ids()
            .filter_map(|id| {
                let cell = self.values.cell(id);
                if cell.fixed || self.is_dead(id) {
                    return None;
                }
                match cell.location {
                    Some(location @ (Location::Register(_) | Location::Stack(_))) => {
                        Some((id, location))
                    }
                    _ => None,
                }
            })
            .collect();
        Snapshot {
            position: self.position,
            cells,
        }
    }

    fn enter_scope(&mut self, scope: ScopeId) {
        let snapshot = self.snapshot();
        log::trace!("scope {} entered with {} live cells", scope.0, snapshot.cells.len());
        self.snapshots.insert(scope, snapshot);
    }

    fn scope_snapshot(&self, scope: ScopeId) -> LoweringResult<Snapshot> {
        self.snapshots
            .get(&scope)
            .cloned()
            .ok_or_else(|| LoweringError::invariant(format!("scope {} was never entered", scope.0)))
    }

    /// Move every value that is live after this point back to its location at scope entry,
    /// and every bound inner value into the location of its outer value. Without
    /// `fall_through` only the moves are emitted.
    fn merge_scope(
        &mut self,
        scope: ScopeId,
        bindings: &[MergeBinding],
        fall_through: bool,
    ) -> LoweringResult<()> {
        let snapshot = self.scope_snapshot(scope)?;
        let mut moves = Vec::new();
        let mut targeted: HashSet<CellId> = HashSet::new();
        let mut rebinds = Vec::new();

        for binding in bindings {
            let outer = self.values.cell_of(binding.outer);
            let inner = self.values.cell_of(binding.inner);
            if outer == inner || self.is_dead(outer) || !targeted.insert(outer) {
                continue;
            }
            let destination = snapshot
                .cells
                .iter()
                .find(|(cell, _)| *cell == outer)
                .map(|(_, location)| *location)
                .or(self.values.cell(outer).location);
            let Some(destination) = destination else {
                continue;
            };
            if let Location::Constant(constant) = destination {
                return Err(LoweringError::invariant(format!(
                    "merge of {} into constant {constant:?}",
                    binding.inner
                )));
            }
            let source = self.resolve(binding.inner)?;
            moves.push(PendingMove::new(
                source,
                destination,
                self.values.format(binding.outer),
            ));
            rebinds.push((outer, destination));
        }

        for &(cell, location) in &snapshot.cells {
            if targeted.contains(&cell) || self.is_dead(cell) {
                continue;
            }
            if let Some(current) = self.values.cell(cell).location {
                if current != location {
                    moves.push(PendingMove::new(current, location, self.values.cell(cell).format));
                }
            }
            rebinds.push((cell, location));
        }

        log::trace!(
            "scope {} merge: {} moves for {} bindings",
            scope.0,
            moves.len(),
            bindings.len()
        );
        self.emit_parallel(moves);
        if !fall_through {
            return Ok(());
        }
        for (cell, location) in rebinds {
            self.values.bind(cell, location);
        }
        self.rebuild_holders()
    }

    /// Restore the entry locations of values that stay live past the scope.
    fn exit_scope(&mut self, scope: ScopeId) -> LoweringResult<()> {
        let snapshot = self
            .snapshots
            .remove(&scope)
            .ok_or_else(|| LoweringError::invariant(format!("scope {} was never entered", scope.0)))?;

        for &(cell, location) in &snapshot.cells {
            if !self.is_dead(cell) {
                self.values.bind(cell, location);
            }
        }

        for id in self.values.cell_ids() {
            let cell = self.values.cell(id);
            if cell.fixed || self.is_dead(id) || cell.location.is_none() {
                continue;
            }
            let defined_inside = cell
                .defined_at
                .is_some_and(|defined| defined > snapshot.position);
            if defined_inside && !snapshot.cells.iter().any(|(held, _)| *held == id) {
                return Err(LoweringError::invariant(format!(
                    "{id} defined inside scope {} is live after it",
                    scope.0
                )));
            }
        }
        self.rebuild_holders()
    }

    /// Cache carried stack values in registers and snapshot the loop-entry state.
    fn symmetry_start(
        &mut self,
        scope: ScopeId,
        carried: &[ValueId],
        non_volatile: bool,
    ) -> LoweringResult<()> {
        let preference = if non_volatile {
            PoolPreference::NonVolatileOnly
        } else {
            PoolPreference::VolatileFirst
        };

        for &value in carried {
            let cell = self.values.cell_of(value);
            if self.values.is_fixed(value) || self.is_dead(cell) {
                continue;
            }
            let Some(location) = self.values.cell(cell).location else {
                continue;
            };
            let needs_register = match location {
                Location::Stack(_) => true,
                Location::Register(reg) => non_volatile && self.registers.is_volatile(reg),
                _ => false,
            };
            if !needs_register {
                continue;
            }

            let format = self.values.format(value);
            let position = self.position;
            let values = &self.values;
            let selection = self.registers.select(format.bank(), preference, &self.protected, |holder| {
                !values.is_live_after(holder, position)
            });
            let reg = match selection {
                Ok(Selection::Free(reg)) | Ok(Selection::Dead(reg, _)) => reg,
                _ => {
                    log::warn!("{}: no register to cache {value} across the loop", self.name);
                    continue;
                }
            };

            self.registers.release(reg);
            self.emit_move(Location::Register(reg), location, format, format);
            match location {
                Location::Stack(slot) => self.frame.release(slot),
                Location::Register(previous) => {
                    self.registers.release(previous);
                }
                _ => {}
            }
            self.registers.assign(reg, cell)?;
            self.values.bind(cell, Location::Register(reg));
            self.protected.set(reg);
        }

        self.enter_scope(scope);
        Ok(())
    }

    /// Recompute register and spill-slot holders from the locations of live cells.
    fn rebuild_holders(&mut self) -> LoweringResult<()> {
        self.registers.release_all();
        self.frame.release_all();
        for id in self.values.cell_ids() {
            let cell = self.values.cell(id);
            if cell.fixed || self.is_dead(id) {
                continue;
            }
            match cell.location {
                Some(Location::Register(reg)) => {
                    if let Some(other) = self.registers.holder(reg) {
                        return Err(LoweringError::invariant(format!(
                            "{id} and {other} both live in {}",
                            self.config.register_name(reg)
                        )));
                    }
                    self.registers.assign(reg, id)?;
                }
                Some(Location::Stack(slot)) if slot.base == StackBase::Frame => {
                    self.frame.occupy(slot, id);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
