//! Log of illegal memory accesses made by the coprocessor.

use crate::source::LineId;
use indexmap::IndexMap;
use strum_macros::Display;

/// Addresses at or below this are treated as null pointer dereferences.
const NULL_ACCESS_CEILING: u32 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AccessEvent {
    #[strum(serialize = "illegal address")]
    IllegalAddress,
    #[strum(serialize = "null dereference")]
    NullDereference,
    #[strum(serialize = "misaligned address")]
    MisalignedAddress,
    #[strum(serialize = "stack collision")]
    StackCollision,
}

#[derive(Debug, Clone)]
pub struct IllegalAccessEntry {
    pub event: AccessEvent,
    pub pc: u32,
    pub addr: u32,
    pub count: u64,
    pub is_null_access: bool,

    /// Source line of the offending instruction, when known.
    pub line: Option<LineId>,
}

/// Accesses keyed by `(addr, pc)`: the same bad access repeated in a loop
/// is one entry with a count.
#[derive(Default)]
pub struct IllegalAccessLog {
    entries: IndexMap<(u32, u32), IllegalAccessEntry>,

    /// A stack collision makes every entry in the log suspect.
    pub has_stack_collision: bool,
}

impl IllegalAccessLog {
    pub fn record(&mut self, event: AccessEvent, pc: u32, addr: u32, line: Option<LineId>) {
        if event == AccessEvent::StackCollision {
            self.has_stack_collision = true;
        }

        match self.entries.get_mut(&(addr, pc)) {
            Some(entry) => entry.count += 1,
            None => {
                self.entries.insert(
                    (addr, pc),
                    IllegalAccessEntry {
                        event,
                        pc,
                        addr,
                        count: 1,
                        is_null_access: addr <= NULL_ACCESS_CEILING,
                        line,
                    },
                );
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &IllegalAccessEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeated_access_is_one_entry() {
        let mut log = IllegalAccessLog::default();
        log.record(AccessEvent::IllegalAddress, 0x8000, 0x6000_0000, None);
        log.record(AccessEvent::IllegalAddress, 0x8000, 0x6000_0000, None);
        log.record(AccessEvent::IllegalAddress, 0x8004, 0x6000_0000, None);

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries().next().unwrap().count, 2);
    }

    #[test]
    fn null_access_flag() {
        let mut log = IllegalAccessLog::default();
        log.record(AccessEvent::NullDereference, 0x8000, 0x0000_0004, None);
        assert!(log.entries().next().unwrap().is_null_access);
        assert!(!log.has_stack_collision);
    }

    #[test]
    fn stack_collision_taints_log() {
        let mut log = IllegalAccessLog::default();
        log.record(AccessEvent::StackCollision, 0x8000, 0x2000_1000, None);
        assert!(log.has_stack_collision);
    }
}
