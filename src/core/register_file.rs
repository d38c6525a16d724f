//! Register file state and selection.
//!
//! This module implements the RegisterFile that tracks which value cell currently holds each
//! physical register, which registers are locked against eviction, and the order in which
//! registers were last assigned. Selection follows the allocation priority of the Unit: a free
//! register, then a register whose holder is already dead, then the least-recently-assigned
//! unlocked register (whose holder the caller must relocate before reuse).

use std::fmt;

use thiserror::Error;

use super::value::CellId;

/// Number of register banks (general purpose and decimal).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 32;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Register banks, one per value class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegBank {
    General = 0,
    Decimal = 1,
}

impl RegBank {
    pub const ALL: [RegBank; MAX_REGISTER_BANKS] = [RegBank::General, RegBank::Decimal];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RegBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegBank::General => write!(f, "general"),
            RegBank::Decimal => write!(f, "decimal"),
        }
    }
}

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn general(id: RegId) -> Self {
        Self::new(RegBank::General, id)
    }

    pub const fn decimal(id: RegId) -> Self {
        Self::new(RegBank::Decimal, id)
    }

    fn slot(self) -> (usize, usize) {
        (self.bank.index(), self.id as usize)
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub const fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    pub fn from_registers(registers: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in registers {
            set.set(reg);
        }
        set
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (reg.id as usize) < MAX_REGISTERS_PER_BANK
            && self.banks[reg.bank.index()] & (1u64 << reg.id) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.id as usize) < MAX_REGISTERS_PER_BANK {
            self.banks[reg.bank.index()] |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.id as usize) < MAX_REGISTERS_PER_BANK {
            self.banks[reg.bank.index()] &= !(1u64 << reg.id);
        }
    }

    pub fn union(&mut self, other: &RegBitSet) {
        for (mine, theirs) in self.banks.iter_mut().zip(other.banks) {
            *mine |= theirs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|bank| *bank == 0)
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks[bank.index()].count_ones()
    }

    /// Registers of one bank in ascending id order.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let mask = self.banks[bank.index()];
        (0..MAX_REGISTERS_PER_BANK as RegId)
            .filter(move |id| mask & (1u64 << id) != 0)
            .map(move |id| AsmReg::new(bank, id))
    }

    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        RegBank::ALL.into_iter().flat_map(move |bank| self.iter_bank(bank))
    }
}

/// Error types for register allocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    #[error("no {bank} register can be freed")]
    NoRegistersAvailable { bank: RegBank },

    #[error("register {0:?} is not allocatable")]
    InvalidRegister(AsmReg),

    #[error("register {0:?} unlocked more often than locked")]
    LockCountUnderflow(AsmReg),
}

/// Order in which the volatile and non-volatile pools are searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPreference {
    VolatileFirst,
    NonVolatileFirst,
    /// Only registers that survive calls.
    NonVolatileOnly,
}

/// Outcome of a register selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Nobody holds the register.
    Free(AsmReg),
    /// The holder is no longer live and can be dropped.
    Dead(AsmReg, CellId),
    /// The holder is live and must be relocated before reuse.
    Evict(AsmReg, CellId),
}

impl Selection {
    pub fn register(self) -> AsmReg {
        match self {
            Selection::Free(reg) | Selection::Dead(reg, _) | Selection::Evict(reg, _) => reg,
        }
    }
}

/// RegisterFile manages register ownership for a single function.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    /// Registers available for allocation (excludes stack/frame pointers and scratch).
    allocatable: RegBitSet,
    /// Registers a call may clobber.
    volatile: RegBitSet,
    /// Registers that were assigned at least once.
    used: RegBitSet,
    holders: [[Option<CellId>; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
    lock_counts: [[u8; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
    /// Assignment tick of each register, for least-recently-assigned eviction.
    ticks: [[u64; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
    clock: u64,
}

impl RegisterFile {
    pub fn new(allocatable: RegBitSet, volatile: RegBitSet) -> Self {
        Self {
            allocatable,
            volatile,
            used: RegBitSet::new(),
            holders: [[None; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
            lock_counts: [[0; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
            ticks: [[0; MAX_REGISTERS_PER_BANK]; MAX_REGISTER_BANKS],
            clock: 0,
        }
    }

    pub fn is_allocatable(&self, reg: AsmReg) -> bool {
        self.allocatable.contains(reg)
    }

    pub fn is_volatile(&self, reg: AsmReg) -> bool {
        self.volatile.contains(reg)
    }

    pub fn allocatable(&self) -> &RegBitSet {
        &self.allocatable
    }

    pub fn holder(&self, reg: AsmReg) -> Option<CellId> {
        let (bank, id) = reg.slot();
        self.holders[bank][id]
    }

    /// Make `cell` the holder of `reg`.
    pub fn assign(&mut self, reg: AsmReg, cell: CellId) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        self.clock += 1;
        let (bank, id) = reg.slot();
        self.holders[bank][id] = Some(cell);
        self.ticks[bank][id] = self.clock;
        self.used.set(reg);
        Ok(())
    }

    /// Mark a register as written without giving it a holder (call clobbers, scratch use).
    pub fn touch(&mut self, reg: AsmReg) {
        if self.allocatable.contains(reg) {
            self.used.set(reg);
        }
    }

    pub fn release(&mut self, reg: AsmReg) -> Option<CellId> {
        let (bank, id) = reg.slot();
        self.holders.get_mut(bank)?.get_mut(id)?.take()
    }

    /// Drop every holder, keeping lock counts and usage history.
    pub fn release_all(&mut self) {
        for bank in self.holders.iter_mut() {
            bank.fill(None);
        }
    }

    pub fn find(&self, cell: CellId) -> Option<AsmReg> {
        self.occupied()
            .find(|(_, holder)| *holder == cell)
            .map(|(reg, _)| reg)
    }

    /// Every register that currently has a holder.
    pub fn occupied(&self) -> impl Iterator<Item = (AsmReg, CellId)> + '_ {
        self.allocatable
            .iter()
            .filter_map(move |reg| self.holder(reg).map(|cell| (reg, cell)))
    }

    pub fn lock(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        let (bank, id) = reg.slot();
        self.lock_counts[bank][id] += 1;
        Ok(())
    }

    pub fn unlock(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        let (bank, id) = reg.slot();
        let count = &mut self.lock_counts[bank][id];
        if *count == 0 {
            return Err(RegAllocError::LockCountUnderflow(reg));
        }
        *count -= 1;
        Ok(())
    }

    pub fn is_locked(&self, reg: AsmReg) -> bool {
        let (bank, id) = reg.slot();
        self.lock_counts[bank][id] > 0
    }

    /// Registers of `bank` in the order they should be tried.
    fn pool(&self, bank: RegBank, preference: PoolPreference) -> Vec<AsmReg> {
        let (volatile, stable): (Vec<_>, Vec<_>) = self
            .allocatable
            .iter_bank(bank)
            .partition(|reg| self.volatile.contains(*reg));
        match preference {
            PoolPreference::VolatileFirst => volatile.into_iter().chain(stable).collect(),
            PoolPreference::NonVolatileFirst => stable.into_iter().chain(volatile).collect(),
            PoolPreference::NonVolatileOnly => stable,
        }
    }

    /// Pick a register in `bank`. Locked and excluded registers are never returned; `is_dead`
    /// tells whether a holder is no longer live at the current position.
    pub fn select(
        &self,
        bank: RegBank,
        preference: PoolPreference,
        exclude: &RegBitSet,
        is_dead: impl Fn(CellId) -> bool,
    ) -> Result<Selection, RegAllocError> {
        let candidates: Vec<AsmReg> = self
            .pool(bank, preference)
            .into_iter()
            .filter(|reg| !exclude.contains(*reg) && !self.is_locked(*reg))
            .collect();

        if let Some(&reg) = candidates.iter().find(|reg| self.holder(**reg).is_none()) {
            return Ok(Selection::Free(reg));
        }

        for &reg in &candidates {
            if let Some(cell) = self.holder(reg) {
                if is_dead(cell) {
                    return Ok(Selection::Dead(reg, cell));
                }
            }
        }

        candidates
            .iter()
            .filter_map(|reg| self.holder(*reg).map(|cell| (*reg, cell)))
            .min_by_key(|(reg, _)| {
                let (bank, id) = reg.slot();
                self.ticks[bank][id]
            })
            .map(|(reg, cell)| Selection::Evict(reg, cell))
            .ok_or(RegAllocError::NoRegistersAvailable { bank })
    }

    /// Non-volatile registers assigned at least once, which the prologue must save.
    pub fn used_non_volatile(&self) -> Vec<AsmReg> {
        self.used
            .iter()
            .filter(|reg| !self.volatile.contains(*reg))
            .collect()
    }

    /// Volatile registers whose holders a call would destroy.
    pub fn volatile_holders(&self) -> Vec<(AsmReg, CellId)> {
        self.occupied()
            .filter(|(reg, _)| self.volatile.contains(*reg))
            .collect()
    }
}
