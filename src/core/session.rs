// This module provides arena-based session management for lowering whole programs, using the
// bumpalo crate. A CompilationSession outlives every Unit it drives: it owns the arena in which
// function and data symbol names are interned, so listings and symbol tables of all lowered
// functions can share one copy of each name, and it accumulates statistics across functions
// (functions lowered, operations emitted, inserted moves and exchanges, spills, calls). Units
// themselves stay arena-free; they report into the session once their build pass completes.

//! Arena-based session state shared by all functions of a program.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

use super::instruction::Operation;
use super::unit::LoweredFunction;

/// Session for lowering many functions against one arena.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    interned_strings: RefCell<HashMap<String, &'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Every symbol interned so far, in no particular order.
    pub fn symbols(&self) -> Vec<&'arena str> {
        self.interned_strings.borrow().values().copied().collect()
    }

    /// Fold the statistics of a built function into the session.
    pub fn record_function(&self, function: &LoweredFunction) {
        self.intern_str(&function.name);
        for symbol in &function.symbols {
            self.intern_str(symbol);
        }

        let calls = function
            .operations()
            .filter(|operation| matches!(operation, Operation::Call { .. }))
            .count();

        let mut stats = self.stats.borrow_mut();
        stats.functions_lowered += 1;
        stats.operations_emitted += function.instructions.len();
        stats.moves_inserted += function.statistics.moves;
        stats.exchanges_inserted += function.statistics.exchanges;
        stats.spills_generated += function.statistics.spills;
        stats.calls_lowered += calls;
        if function.frame_size > stats.largest_frame_size {
            stats.largest_frame_size = function.frame_size;
            stats.largest_frame_function = function.name.clone();
        }
        log::debug!(
            "recorded {}: {} operations, frame {} bytes",
            function.name,
            function.instructions.len(),
            function.frame_size
        );
    }

    /// Record a function that failed to lower.
    pub fn record_failure(&self, name: &str) {
        self.intern_str(name);
        self.stats.borrow_mut().functions_failed += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Statistics over every function lowered in a session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_lowered: usize,
    pub functions_failed: usize,
    pub operations_emitted: usize,
    pub moves_inserted: usize,
    pub exchanges_inserted: usize,
    pub spills_generated: usize,
    pub calls_lowered: usize,
    pub largest_frame_size: u32,
    pub largest_frame_function: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lowering Session Statistics:")?;
        writeln!(f, "  Functions lowered: {}", self.functions_lowered)?;
        if self.functions_failed > 0 {
            writeln!(f, "  Functions failed: {}", self.functions_failed)?;
        }
        writeln!(f, "  Operations emitted: {}", self.operations_emitted)?;
        writeln!(f, "  Moves inserted: {}", self.moves_inserted)?;
        writeln!(f, "  Exchanges inserted: {}", self.exchanges_inserted)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Calls lowered: {}", self.calls_lowered)?;

        if !self.largest_frame_function.is_empty() {
            writeln!(
                f,
                "  Largest frame: {} ({} bytes)",
                self.largest_frame_function, self.largest_frame_size
            )?;
        }
        Ok(())
    }
}
