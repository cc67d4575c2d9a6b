//! Breakpoints are held as a set of program counter addresses. A source
//! line usually maps to more than one address (and occasionally the same
//! address maps to aliased lines), so toggling works on all of a line's
//! addresses at once.
//!
//! The set knows nothing about the source model; callers gather a line's
//! addresses under the source lock and operate on the set under its own
//! lock, so the two locks are never held together.

use crate::source::LineId;
use std::collections::HashSet;

#[derive(Default)]
pub struct Breakpoints {
    addresses: HashSet<u32>,

    /// Line of the most recent check. Prevents re-breaking on a line
    /// across consecutive instructions that both bind to it.
    prev_check: Option<LineId>,
}

impl Breakpoints {
    /// Toggle the breakpoint over a line's addresses: if any is set,
    /// clear them all; otherwise set them all.
    pub fn toggle(&mut self, break_addresses: &[u32]) {
        if break_addresses.iter().any(|a| self.addresses.contains(a)) {
            for a in break_addresses {
                self.addresses.remove(a);
            }
        } else {
            for a in break_addresses {
                self.addresses.insert(*a);
            }
        }
    }

    /// True when any of the addresses has a breakpoint.
    pub fn check(&self, break_addresses: &[u32]) -> bool {
        break_addresses.iter().any(|a| self.addresses.contains(a))
    }

    pub fn check_addr(&self, addr: u32) -> bool {
        self.addresses.contains(&addr)
    }

    /// Whether execution should stop at the address. `line` is the source
    /// line the address binds to; consecutive hits on the same line
    /// report only once.
    pub fn should_break(&mut self, addr: u32, line: Option<LineId>) -> bool {
        if !self.addresses.contains(&addr) {
            self.prev_check = line;
            return false;
        }

        if line.is_some() && line == self.prev_check {
            return false;
        }
        self.prev_check = line;

        true
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &u32> {
        self.addresses.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toggle_aliased_addresses() {
        let mut breakpoints = Breakpoints::default();
        let addresses = [0x8010, 0x8012];

        breakpoints.toggle(&addresses);
        assert!(breakpoints.check_addr(0x8010));
        assert!(breakpoints.check_addr(0x8012));
        assert!(breakpoints.check(&addresses));

        breakpoints.toggle(&addresses);
        assert!(!breakpoints.check_addr(0x8010));
        assert!(!breakpoints.check_addr(0x8012));
        assert!(breakpoints.is_empty());
    }

    #[test]
    fn toggle_heals_partial_state() {
        let mut breakpoints = Breakpoints::default();

        // one of the two addresses set by other means: toggle clears both
        breakpoints.addresses.insert(0x8012);
        breakpoints.toggle(&[0x8010, 0x8012]);
        assert!(breakpoints.is_empty());
    }

    #[test]
    fn no_rebreak_on_same_line() {
        let mut breakpoints = Breakpoints::default();
        breakpoints.toggle(&[0x8010, 0x8012]);

        assert!(breakpoints.should_break(0x8010, Some(42)));
        // the next instruction binds to the same line
        assert!(!breakpoints.should_break(0x8012, Some(42)));

        // leaving the line resets the guard
        assert!(!breakpoints.should_break(0x9000, Some(43)));
        assert!(breakpoints.should_break(0x8010, Some(42)));
    }
}
