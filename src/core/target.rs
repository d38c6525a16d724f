// This module defines TargetConfiguration, the explicit description of the machine a function is
// lowered for. It is threaded into the Unit constructor and every lowering routine instead of
// being read from process-wide state. Besides the architecture and operating system selectors it
// answers the register questions the allocator and the call lowering need: which registers are
// allocatable, which a call clobbers, which are pinned by particular instructions (the x64
// dividend/remainder pair and shift count), the per-bank scratch register and the return
// registers. The debuggable and debug_positions switches select stack-homed variables and
// source position markers.

//! Target parameters for lowering.

use std::fmt;

use super::register_file::{AsmReg, RegBank, RegBitSet};
use crate::{arm64, x64};

/// Instruction set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X64,
    Arm64,
}

/// Operating system of the target, which selects the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingSystem {
    Linux,
    MacOs,
    Windows,
}

/// Calling convention derived from architecture and operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    SystemV,
    WindowsX64,
    Aapcs64,
}

/// Explicit lowering configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfiguration {
    pub architecture: Architecture,
    pub system: OperatingSystem,
    /// Keep every local and parameter in a home stack slot.
    pub debuggable: bool,
    /// Emit a position marker before each statement.
    pub debug_positions: bool,
}

impl TargetConfiguration {
    pub const STACK_SLOT_SIZE: u32 = 8;

    pub fn new(architecture: Architecture, system: OperatingSystem) -> Self {
        Self {
            architecture,
            system,
            debuggable: false,
            debug_positions: false,
        }
    }

    pub fn x64_linux() -> Self {
        Self::new(Architecture::X64, OperatingSystem::Linux)
    }

    pub fn x64_windows() -> Self {
        Self::new(Architecture::X64, OperatingSystem::Windows)
    }

    pub fn arm64_linux() -> Self {
        Self::new(Architecture::Arm64, OperatingSystem::Linux)
    }

    pub fn with_debuggable(mut self, debuggable: bool) -> Self {
        self.debuggable = debuggable;
        self
    }

    pub fn with_debug_positions(mut self, enabled: bool) -> Self {
        self.debug_positions = enabled;
        self
    }

    pub fn is_x64(&self) -> bool {
        self.architecture == Architecture::X64
    }

    pub fn calling_convention(&self) -> CallingConvention {
        match (self.architecture, self.system) {
            (Architecture::X64, OperatingSystem::Windows) => CallingConvention::WindowsX64,
            (Architecture::X64, _) => CallingConvention::SystemV,
            (Architecture::Arm64, _) => CallingConvention::Aapcs64,
        }
    }

    /// Registers the allocator may hand out.
    pub fn allocatable_registers(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        match self.architecture {
            Architecture::X64 => {
                for id in 0..16 {
                    let reg = AsmReg::general(id);
                    if reg != x64::RSP && reg != x64::RBP && reg != x64::R11 {
                        set.set(reg);
                    }
                    if id != x64::XMM15.id {
                        set.set(AsmReg::decimal(id));
                    }
                }
            }
            Architecture::Arm64 => {
                for id in 0..29 {
                    let reg = AsmReg::general(id);
                    if reg != arm64::X16 && reg != arm64::X18 {
                        set.set(reg);
                    }
                }
                for id in 0..31 {
                    set.set(AsmReg::decimal(id));
                }
            }
        }
        set
    }

    /// Registers a call may clobber.
    pub fn volatile_registers(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        match self.calling_convention() {
            CallingConvention::SystemV => {
                for id in [0, 1, 2, 6, 7, 8, 9, 10, 11] {
                    set.set(AsmReg::general(id));
                }
                for id in 0..16 {
                    set.set(AsmReg::decimal(id));
                }
            }
            CallingConvention::WindowsX64 => {
                for id in [0, 1, 2, 8, 9, 10, 11] {
                    set.set(AsmReg::general(id));
                }
                for id in 0..6 {
                    set.set(AsmReg::decimal(id));
                }
            }
            CallingConvention::Aapcs64 => {
                for id in 0..19 {
                    set.set(AsmReg::general(id));
                }
                for id in (0..8).chain(16..32) {
                    set.set(AsmReg::decimal(id));
                }
            }
        }
        set
    }

    /// Allocatable register count of a bank.
    pub fn register_count(&self, bank: RegBank) -> u32 {
        self.allocatable_registers().count_in_bank(bank)
    }

    /// Register reserved for memory-to-memory transfers and cycle breaking.
    pub fn scratch_register(&self, bank: RegBank) -> AsmReg {
        match (self.architecture, bank) {
            (Architecture::X64, RegBank::General) => x64::R11,
            (Architecture::X64, RegBank::Decimal) => x64::XMM15,
            (Architecture::Arm64, RegBank::General) => arm64::X16,
            (Architecture::Arm64, RegBank::Decimal) => arm64::D31,
        }
    }

    pub fn return_register(&self, bank: RegBank) -> AsmReg {
        match (self.architecture, bank) {
            (Architecture::X64, RegBank::General) => x64::RAX,
            (Architecture::X64, RegBank::Decimal) => x64::XMM0,
            (Architecture::Arm64, RegBank::General) => arm64::X0,
            (Architecture::Arm64, RegBank::Decimal) => arm64::D0,
        }
    }

    /// Register that receives the dividend and quotient of a divide.
    pub fn numerator_register(&self) -> Option<AsmReg> {
        self.is_x64().then_some(x64::RAX)
    }

    /// Register that receives the remainder (and high multiply half).
    pub fn remainder_register(&self) -> Option<AsmReg> {
        self.is_x64().then_some(x64::RDX)
    }

    /// Register that must hold a variable shift amount.
    pub fn shift_register(&self) -> Option<AsmReg> {
        self.is_x64().then_some(x64::RCX)
    }

    /// Stack space the caller reserves for the callee's register arguments.
    pub fn shadow_space(&self) -> u32 {
        match self.calling_convention() {
            CallingConvention::WindowsX64 => 32,
            _ => 0,
        }
    }

    pub fn register_name(&self, reg: AsmReg) -> String {
        match (self.architecture, reg.bank) {
            (Architecture::X64, RegBank::General) => x64::GENERAL_NAMES
                .get(reg.id as usize)
                .map_or_else(|| format!("r?{}", reg.id), |name| name.to_string()),
            (Architecture::X64, RegBank::Decimal) => x64::DECIMAL_NAMES
                .get(reg.id as usize)
                .map_or_else(|| format!("xmm?{}", reg.id), |name| name.to_string()),
            (Architecture::Arm64, _) => arm64::register_name(reg),
        }
    }
}

impl fmt::Display for TargetConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?} ({:?})", self.architecture, self.system, self.calling_convention())
    }
}
