//! Stack frame layout of one function.
//!
//! Locals (home slots, return buffers) and spill slots grow downwards from the frame base in
//! 8-byte units. Spill slots remember their holder cell so a slot can be reused once its
//! holder is dead. The outgoing argument area is sized by the largest call.

use super::calling_convention::align_up;
use super::value::{CellId, StackSlot};

#[derive(Debug, Clone)]
struct SpillSlot {
    offset: i32,
    holder: Option<CellId>,
}

#[derive(Debug, Clone, Default)]
pub struct StackFrame {
    /// Lowest offset handed out so far (negative).
    next_offset: i32,
    spill_slots: Vec<SpillSlot>,
    outgoing_size: u32,
    spills: usize,
}

impl StackFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanent slot of `size` bytes.
    pub fn allocate_local(&mut self, size: u32) -> StackSlot {
        let aligned = align_up(size.max(1), 8);
        self.next_offset -= aligned as i32;
        StackSlot::frame(self.next_offset)
    }

    /// Slot for a spilled cell, reusing a slot whose holder is dead.
    pub fn spill(&mut self, cell: CellId, is_dead: impl Fn(CellId) -> bool) -> StackSlot {
        self.spills += 1;
        let reusable = self
            .spill_slots
            .iter_mut()
            .find(|slot| slot.holder.map_or(true, &is_dead));
        if let Some(slot) = reusable {
            slot.holder = Some(cell);
            return StackSlot::frame(slot.offset);
        }

        let slot = self.allocate_local(8);
        self.spill_slots.push(SpillSlot {
            offset: slot.offset,
            holder: Some(cell),
        });
        slot
    }

    /// Forget the holder of a spill slot (the cell was reloaded or moved).
    pub fn release(&mut self, slot: StackSlot) {
        if let Some(spill) = self
            .spill_slots
            .iter_mut()
            .find(|spill| spill.offset == slot.offset)
        {
            spill.holder = None;
        }
    }

    /// Claim a spill slot for `cell` (used when restoring a scope snapshot).
    pub fn occupy(&mut self, slot: StackSlot, cell: CellId) {
        if let Some(spill) = self
            .spill_slots
            .iter_mut()
            .find(|spill| spill.offset == slot.offset)
        {
            spill.holder = Some(cell);
        }
    }

    pub fn release_all(&mut self) {
        for slot in &mut self.spill_slots {
            slot.holder = None;
        }
    }

    pub fn holder(&self, slot: StackSlot) -> Option<CellId> {
        self.spill_slots
            .iter()
            .find(|spill| spill.offset == slot.offset)
            .and_then(|spill| spill.holder)
    }

    /// Grow the outgoing argument area to at least `size` bytes.
    pub fn reserve_outgoing(&mut self, size: u32) {
        self.outgoing_size = self.outgoing_size.max(size);
    }

    pub fn spill_count(&self) -> usize {
        self.spills
    }

    /// Total frame size, 16-byte aligned.
    pub fn size(&self) -> u32 {
        align_up((-self.next_offset) as u32 + self.outgoing_size, 16)
    }
}
