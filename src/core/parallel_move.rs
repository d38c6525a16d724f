// This module orders a set of simultaneous location transfers (scope merges, loop back-edges
// and call argument placement) into a sequential list. A transfer may only run once no other
// pending transfer still reads its destination. When every remaining transfer is blocked the
// rest form cycles, and one cycle edge is turned into an Exchange of its source and destination;
// the readers of the exchanged destination then read the exchanged source instead. A two-way
// register swap therefore becomes exactly one Exchange and no moves.

//! Parallel move resolution with cycle breaking.

use super::value::{Format, Location};

/// One transfer of a parallel move set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMove {
    pub source: Location,
    pub destination: Location,
    pub format: Format,
}

impl PendingMove {
    pub fn new(source: Location, destination: Location, format: Format) -> Self {
        Self {
            source,
            destination,
            format,
        }
    }
}

/// Sequential step produced by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMove {
    Move(PendingMove),
    Exchange {
        first: Location,
        second: Location,
        format: Format,
    },
}

/// Order `moves` so that every source is read before it is overwritten.
pub fn resolve(moves: Vec<PendingMove>) -> Vec<ResolvedMove> {
    let mut pending: Vec<PendingMove> = Vec::with_capacity(moves.len());
    for candidate in moves {
        if candidate.source == candidate.destination || pending.contains(&candidate) {
            continue;
        }
        pending.push(candidate);
    }

    let mut resolved = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|candidate| {
            !pending
                .iter()
                .any(|other| other != candidate && other.source == candidate.destination)
        });

        if let Some(index) = ready {
            resolved.push(ResolvedMove::Move(pending.remove(index)));
            continue;
        }

        // Only cycles remain.
        let edge = pending.remove(0);
        log::trace!(
            "breaking move cycle with exchange {:?} <-> {:?}",
            edge.source,
            edge.destination
        );
        resolved.push(ResolvedMove::Exchange {
            first: edge.source,
            second: edge.destination,
            format: edge.format,
        });
        for other in &mut pending {
            if other.source == edge.destination {
                other.source = edge.source;
            }
        }
        pending.retain(|other| other.source != other.destination);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::AsmReg;
    use crate::core::value::StackSlot;

    fn reg(id: u8) -> Location {
        Location::Register(AsmReg::general(id))
    }

    fn mv(source: Location, destination: Location) -> PendingMove {
        PendingMove::new(source, destination, Format::I64)
    }

    /// Execute the resolved steps on a symbolic machine state.
    fn run(initial: &[(Location, u32)], steps: &[ResolvedMove]) -> Vec<(Location, u32)> {
        let mut state = initial.to_vec();
        let read = |state: &Vec<(Location, u32)>, location: Location| {
            state
                .iter()
                .find(|(at, _)| *at == location)
                .map(|(_, value)| *value)
                .unwrap()
        };
        let write = |state: &mut Vec<(Location, u32)>, location: Location, value: u32| {
            if let Some(entry) = state.iter_mut().find(|(at, _)| *at == location) {
                entry.1 = value;
            } else {
                state.push((location, value));
            }
        };
        for step in steps {
            match *step {
                ResolvedMove::Move(PendingMove {
                    source,
                    destination,
                    ..
                }) => {
                    let value = read(&state, source);
                    write(&mut state, destination, value);
                }
                ResolvedMove::Exchange { first, second, .. } => {
                    let a = read(&state, first);
                    let b = read(&state, second);
                    write(&mut state, first, b);
                    write(&mut state, second, a);
                }
            }
        }
        state
    }

    #[test]
    fn test_swap_becomes_single_exchange() {
        let steps = resolve(vec![mv(reg(1), reg(2)), mv(reg(2), reg(1))]);
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0], ResolvedMove::Exchange { .. }));
    }

    #[test]
    fn test_chain_reads_before_overwrite() {
        // r1 -> r2 and r2 -> r3: r3 must be written first.
        let steps = resolve(vec![mv(reg(1), reg(2)), mv(reg(2), reg(3))]);
        assert_eq!(steps[0], ResolvedMove::Move(mv(reg(2), reg(3))));
        assert_eq!(steps[1], ResolvedMove::Move(mv(reg(1), reg(2))));

        let state = run(&[(reg(1), 10), (reg(2), 20), (reg(3), 30)], &steps);
        let value_of = |location| state.iter().find(|(at, _)| *at == location).unwrap().1;
        assert_eq!(value_of(reg(2)), 10);
        assert_eq!(value_of(reg(3)), 20);
    }

    #[test]
    fn test_rotation_through_memory() {
        let slot = Location::Stack(StackSlot::frame(-8));
        let moves = vec![mv(reg(1), reg(2)), mv(reg(2), slot), mv(slot, reg(1))];
        let steps = resolve(moves.clone());
        let state = run(&[(reg(1), 1), (reg(2), 2), (slot, 3)], &steps);
        let value_of = |location| state.iter().find(|(at, _)| *at == location).unwrap().1;
        assert_eq!(value_of(reg(2)), 1);
        assert_eq!(value_of(slot), 2);
        assert_eq!(value_of(reg(1)), 3);
        assert_eq!(
            steps
                .iter()
                .filter(|step| matches!(step, ResolvedMove::Exchange { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_identity_and_duplicates_are_dropped() {
        let steps = resolve(vec![mv(reg(1), reg(1)), mv(reg(3), reg(4)), mv(reg(3), reg(4))]);
        assert_eq!(steps, vec![ResolvedMove::Move(mv(reg(3), reg(4)))]);
    }

    #[test]
    fn test_fan_out_keeps_shared_source() {
        let constant = Location::Constant(crate::core::value::Constant::Integer(5));
        let steps = resolve(vec![
            mv(reg(1), reg(2)),
            mv(reg(1), reg(3)),
            mv(constant, reg(1)),
        ]);
        let state = run(&[(reg(1), 1), (reg(2), 0), (reg(3), 0), (constant, 5)], &steps);
        let value_of = |location| state.iter().find(|(at, _)| *at == location).unwrap().1;
        assert_eq!(value_of(reg(2)), 1);
        assert_eq!(value_of(reg(3)), 1);
        assert_eq!(value_of(reg(1)), 5);
    }
}
