//! Functions and their address ranges.

use crate::dwarf::loclist::Loclist;
use crate::profile::{Phases, StatsGroup};
use crate::source::LineId;
use std::sync::Arc;

/// An address range covered by a function. Inclusive at both ends.
/// A function has several ranges when it is inlined or discontiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    pub start: u32,
    pub end: u32,
    pub inline: bool,
}

impl SourceRange {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn size(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }
}

/// A function in the coprocessor program.
pub struct SourceFunction {
    pub name: String,

    /// Address ranges. Multiple entries cover inlined instances and
    /// discontiguous regions.
    pub ranges: Vec<SourceRange>,

    /// Frame base expression from `DW_AT_frame_base`, shared with the
    /// loclists of the function's local variables.
    pub framebase: Option<Arc<Loclist>>,

    /// Line carrying the function declaration.
    pub decl_line: Option<LineId>,

    /// Cycles spent in the function itself.
    pub flat: StatsGroup,

    /// Cycles spent in the function and everything it called.
    pub cumulative: StatsGroup,

    pub kernel: Phases,

    /// Set when the profiler had to pop more than one frame at once to
    /// find this function's caller, indicating the compiler collapsed the
    /// call chain.
    pub optimised_callstack: bool,

    /// True for functions synthesised from the symbol table or for the
    /// driver, rather than from DWARF.
    pub stub: bool,
}

impl SourceFunction {
    pub fn new(name: impl Into<String>) -> SourceFunction {
        SourceFunction {
            name: name.into(),
            ranges: vec![],
            framebase: None,
            decl_line: None,
            flat: StatsGroup::default(),
            cumulative: StatsGroup::default(),
            kernel: Phases::default(),
            optimised_callstack: false,
            stub: false,
        }
    }

    pub fn stub(name: impl Into<String>) -> SourceFunction {
        SourceFunction {
            stub: true,
            ..SourceFunction::new(name)
        }
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// True when any non-inline range contains the address.
    pub fn contains(&self, addr: u32) -> bool {
        self.ranges.iter().any(|r| !r.inline && r.contains(addr))
    }

    /// The smallest range containing the address, if any.
    pub fn smallest_range(&self, addr: u32) -> Option<SourceRange> {
        self.ranges
            .iter()
            .filter(|r| r.contains(addr))
            .min_by_key(|r| r.size())
            .copied()
    }

    /// Add a range, merging an exact duplicate.
    pub fn add_range(&mut self, range: SourceRange) {
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
    }
}
