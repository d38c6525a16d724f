//! Virtual values, location cells and physical locations.
//!
//! Every value produced while lowering a syntax node is a [`ValueId`] into the per-Unit
//! [`ValueTable`]. Values do not own their location directly: each points at a [`CellId`] and
//! the cell carries the physical [`Location`]. Entangled values share one cell, so relocating the
//! cell (eviction, reload, merge) is seen through every value bound to it. Liveness is tracked
//! per cell as the position of its last reading instruction.

use std::fmt;

use super::register_file::{AsmReg, RegBank};
use crate::tree::VariableId;

/// Monotonic instruction position inside a Unit. Parameters are defined at position 0.
pub type Position = u32;

/// Numeric format of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Decimal,
}

impl Format {
    pub fn bytes(self) -> u32 {
        match self {
            Format::I8 | Format::U8 => 1,
            Format::I16 | Format::U16 => 2,
            Format::I32 | Format::U32 => 4,
            Format::I64 | Format::U64 | Format::Decimal => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Format::U8 | Format::U16 | Format::U32 | Format::U64)
    }

    pub fn is_decimal(self) -> bool {
        self == Format::Decimal
    }

    pub fn bank(self) -> RegBank {
        if self.is_decimal() {
            RegBank::Decimal
        } else {
            RegBank::General
        }
    }
}

/// Immediate value. Decimals are kept as their IEEE-754 bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Integer(i64),
    Decimal(u64),
}

impl Constant {
    pub fn decimal(value: f64) -> Self {
        Constant::Decimal(value.to_bits())
    }

    pub fn is_zero(self) -> bool {
        match self {
            Constant::Integer(value) => value == 0,
            Constant::Decimal(bits) => bits == 0,
        }
    }

    pub fn as_integer(self) -> Option<i64> {
        match self {
            Constant::Integer(value) => Some(value),
            Constant::Decimal(_) => None,
        }
    }
}

/// Which stack area a slot offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackBase {
    /// Locals and spills of the current frame.
    Frame,
    /// Argument area of an outgoing call, relative to the stack pointer.
    Outgoing,
    /// Stack-passed parameters of the current function.
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub base: StackBase,
    pub offset: i32,
}

impl StackSlot {
    pub fn frame(offset: i32) -> Self {
        Self {
            base: StackBase::Frame,
            offset,
        }
    }
}

/// `base + index * stride + offset` with registers already chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAddress {
    pub base: AsmReg,
    pub index: Option<AsmReg>,
    pub stride: u8,
    pub offset: i32,
}

/// Index into the symbol table of a lowered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// Physical location of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(AsmReg),
    Stack(StackSlot),
    Constant(Constant),
    Address(MemoryAddress),
    Data(SymbolId),
}

impl Location {
    pub fn register(self) -> Option<AsmReg> {
        match self {
            Location::Register(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            Location::Stack(_) | Location::Address(_) | Location::Data(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// What a value stands for in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    Variable(VariableId),
    Constant,
}

/// Address computed from a pointer value at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressExpression {
    pub base: ValueId,
    /// Element index, scaled by `stride` bytes.
    pub index: Option<ValueId>,
    pub stride: u8,
    pub offset: i32,
}

impl AddressExpression {
    /// Values that must sit in registers when the address is formed.
    pub fn operands(&self) -> impl Iterator<Item = ValueId> {
        std::iter::once(self.base).chain(self.index)
    }
}

/// Shared location cell.
#[derive(Debug, Clone)]
pub struct Cell {
    pub format: Format,
    pub location: Option<Location>,
    pub address: Option<AddressExpression>,
    /// The location never changes (constants, memory homes, addresses).
    pub fixed: bool,
    pub defined_at: Option<Position>,
    pub last_use: Option<Position>,
}

impl Cell {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            location: None,
            address: None,
            fixed: false,
            defined_at: None,
            last_use: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub format: Format,
    pub cell: CellId,
    pub metadata: Option<Metadata>,
}

/// Per-Unit arena of values and cells.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    values: Vec<Value>,
    cells: Vec<Cell>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_cell(&mut self, cell: Cell) -> CellId {
        self.cells.push(cell);
        CellId(self.cells.len() as u32 - 1)
    }

    fn push_value(&mut self, format: Format, cell: CellId, metadata: Option<Metadata>) -> ValueId {
        self.values.push(Value {
            format,
            cell,
            metadata,
        });
        ValueId(self.values.len() as u32 - 1)
    }

    /// Fresh value with its own, still unplaced cell.
    pub fn create(&mut self, format: Format) -> ValueId {
        let cell = self.push_cell(Cell::new(format));
        self.push_value(format, cell, None)
    }

    pub fn constant(&mut self, constant: Constant, format: Format) -> ValueId {
        let cell = self.push_cell(Cell {
            location: Some(Location::Constant(constant)),
            fixed: true,
            ..Cell::new(format)
        });
        self.push_value(format, cell, Some(Metadata::Constant))
    }

    /// Value permanently bound to a memory location.
    pub fn memory(&mut self, format: Format, location: Location) -> ValueId {
        let cell = self.push_cell(Cell {
            location: Some(location),
            fixed: true,
            ..Cell::new(format)
        });
        self.push_value(format, cell, None)
    }

    /// Value living at `base + offset`, where `base` is a pointer value.
    pub fn address(&mut self, format: Format, base: ValueId, offset: i32) -> ValueId {
        self.push_address(
            format,
            AddressExpression {
                base,
                index: None,
                stride: 1,
                offset,
            },
        )
    }

    /// Value living at `base + index * stride`.
    pub fn element(&mut self, format: Format, base: ValueId, index: ValueId, stride: u8) -> ValueId {
        self.push_address(
            format,
            AddressExpression {
                base,
                index: Some(index),
                stride,
                offset: 0,
            },
        )
    }

    fn push_address(&mut self, format: Format, expression: AddressExpression) -> ValueId {
        let cell = self.push_cell(Cell {
            address: Some(expression),
            fixed: true,
            ..Cell::new(format)
        });
        self.push_value(format, cell, None)
    }

    /// New value sharing the cell of `source`.
    pub fn entangle(&mut self, source: ValueId, metadata: Option<Metadata>) -> ValueId {
        let Value { format, cell, .. } = self.values[source.0 as usize];
        self.push_value(format, cell, metadata)
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn format(&self, id: ValueId) -> Format {
        self.value(id).format
    }

    pub fn cell_of(&self, id: ValueId) -> CellId {
        self.value(id).cell
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.0 as usize]
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.0 as usize]
    }

    pub fn set_metadata(&mut self, id: ValueId, metadata: Metadata) {
        self.values[id.0 as usize].metadata = Some(metadata);
    }

    pub fn location(&self, id: ValueId) -> Option<Location> {
        self.cell(self.cell_of(id)).location
    }

    pub fn constant_of(&self, id: ValueId) -> Option<Constant> {
        match self.location(id) {
            Some(Location::Constant(constant)) => Some(constant),
            _ => None,
        }
    }

    pub fn is_constant(&self, id: ValueId) -> bool {
        self.constant_of(id).is_some()
    }

    pub fn is_fixed(&self, id: ValueId) -> bool {
        self.cell(self.cell_of(id)).fixed
    }

    pub fn same_cell(&self, a: ValueId, b: ValueId) -> bool {
        self.cell_of(a) == self.cell_of(b)
    }

    /// Relocate a cell.
    pub fn bind(&mut self, cell: CellId, location: Location) {
        self.cell_mut(cell).location = Some(location);
    }

    /// The cell is still read by an instruction after `position`.
    pub fn is_live_after(&self, cell: CellId, position: Position) -> bool {
        self.cell(cell).last_use.is_some_and(|last| last > position)
    }

    /// This is the last reading position of the value's cell.
    pub fn is_dying(&self, id: ValueId, position: Position) -> bool {
        !self.is_live_after(self.cell_of(id), position)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> {
        (0..self.cells.len() as u32).map(CellId)
    }

    /// Record a read of `id` at `position`.
    pub fn mark_use(&mut self, id: ValueId, position: Position) {
        let cell = self.cell_mut(self.cell_of(id));
        cell.last_use = Some(cell.last_use.map_or(position, |last| last.max(position)));
    }

    /// Record the definition of `id` at `position`, keeping the earliest.
    pub fn mark_definition(&mut self, id: ValueId, position: Position) {
        let cell = self.cell_mut(self.cell_of(id));
        cell.defined_at = Some(cell.defined_at.map_or(position, |first| first.min(position)));
    }

    pub fn reset_liveness(&mut self) {
        for cell in &mut self.cells {
            cell.last_use = None;
            cell.defined_at = None;
        }
    }
}
