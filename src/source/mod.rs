//! The queryable model of the coprocessor program: files, lines,
//! functions, types and variables, all reconstructed from DWARF.
//!
//! Back references are arena indices into the vectors owned by
//! [`Source`], never pointers, keeping the model `Send` and free of
//! reference cycles. The model is constructed once per ROM load; after
//! construction only stub line bindings, breakpoints and statistics
//! change.

pub mod callstack;
pub mod file;
pub mod function;
pub mod sort;
pub mod types;
pub mod variable;

use crate::profile::StatsGroup;
use crate::source::file::{SourceDisasm, SourceFile, SourceLine};
use crate::source::function::{SourceFunction, SourceRange};
use crate::source::sort::{SortedFunctions, SortedLines, SortedVariables};
use crate::source::types::SourceType;
use crate::source::variable::{SourceVariable, SourceVariableLocal};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub type FileId = usize;
pub type LineId = usize;
pub type FunctionId = usize;
pub type TypeId = usize;
pub type GlobalId = usize;
pub type LocalId = usize;

/// Name of the synthetic function collecting addresses outside any known
/// range.
pub const DRIVER_FUNCTION: &str = "<driver>";

pub struct Source {
    /// Files keyed by absolute filename, in the order the DWARF first
    /// referenced them.
    pub files: IndexMap<PathBuf, SourceFile>,

    /// All lines of all files, plus stub lines. Owned here; files hold
    /// indices.
    pub lines: Vec<SourceLine>,

    pub functions: Vec<SourceFunction>,
    functions_by_name: IndexMap<String, FunctionId>,

    pub types: Vec<SourceType>,

    pub globals: Vec<SourceVariable>,

    /// Globals keyed by their address, resolved once at construction.
    pub globals_by_address: HashMap<u64, GlobalId>,

    pub locals: Vec<SourceVariableLocal>,

    /// Every decoded instruction, keyed by address.
    pub disasm: BTreeMap<u32, SourceDisasm>,

    /// Address to source line, the product of the line program walk.
    pub lines_by_address: HashMap<u32, LineId>,

    pub driver_function: FunctionId,
    pub driver_line: LineId,
    pub main_function: Option<FunctionId>,

    /// Statistics for the source overall.
    pub stats: StatsGroup,

    /// Television frames seen by the profiler.
    pub frames_seen: u64,

    /// Set when a compilation unit was produced with an optimisation
    /// level this overlay cannot fully trust.
    pub optimised_warning: bool,

    profile_dirty: AtomicBool,

    pub sorted_lines: SortedLines,
    pub sorted_functions: SortedFunctions,
    pub sorted_globals: SortedVariables,
}

impl Source {
    /// An empty model containing only the driver function and its line.
    /// The DWARF builders populate everything else.
    pub fn new() -> Source {
        let mut source = Source {
            files: IndexMap::new(),
            lines: vec![],
            functions: vec![],
            functions_by_name: IndexMap::new(),
            types: vec![],
            globals: vec![],
            globals_by_address: HashMap::new(),
            locals: vec![],
            disasm: BTreeMap::new(),
            lines_by_address: HashMap::new(),
            driver_function: 0,
            driver_line: 0,
            main_function: None,
            stats: StatsGroup::default(),
            frames_seen: 0,
            optimised_warning: false,
            profile_dirty: AtomicBool::new(false),
            sorted_lines: SortedLines::default(),
            sorted_functions: SortedFunctions::default(),
            sorted_globals: SortedVariables::default(),
        };

        let driver = source.add_function(SourceFunction::stub(DRIVER_FUNCTION));
        let driver_line = source.add_stub_line(DRIVER_FUNCTION);
        source.lines[driver_line].function = Some(driver);
        source.driver_function = driver;
        source.driver_line = driver_line;

        source
    }

    /// Add a function, merging ranges into an existing function of the
    /// same name. Returns the function's id either way.
    pub fn add_function(&mut self, function: SourceFunction) -> FunctionId {
        match self.functions_by_name.get(&function.name) {
            Some(&id) => {
                for range in function.ranges {
                    self.functions[id].add_range(range);
                }
                if self.functions[id].framebase.is_none() {
                    self.functions[id].framebase = function.framebase;
                }
                if self.functions[id].decl_line.is_none() {
                    self.functions[id].decl_line = function.decl_line;
                }
                id
            }
            None => {
                let id = self.functions.len();
                self.functions_by_name.insert(function.name.clone(), id);
                self.functions.push(function);
                id
            }
        }
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions_by_name.get(name).copied()
    }

    pub fn add_stub_line(&mut self, plain: impl Into<String>) -> LineId {
        let id = self.lines.len();
        self.lines.push(SourceLine::stub(plain));
        id
    }

    /// The source line an address binds to.
    pub fn line_for_addr(&self, addr: u32) -> Option<LineId> {
        self.lines_by_address.get(&addr).copied()
    }

    /// The function whose smallest range contains the address, together
    /// with that range. Inline ranges take precedence over the enclosing
    /// function by virtue of being smaller.
    pub fn function_range_at(&self, addr: u32) -> Option<(FunctionId, SourceRange)> {
        let mut best: Option<(FunctionId, SourceRange)> = None;

        for (id, function) in self.functions.iter().enumerate() {
            for range in &function.ranges {
                if !range.contains(addr) {
                    continue;
                }
                match best {
                    Some((_, b)) if b.size() <= range.size() => {}
                    _ => best = Some((id, *range)),
                }
            }
        }

        best
    }

    /// The function covering an address, preferring non-inline ranges.
    pub fn function_at(&self, addr: u32) -> Option<FunctionId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.contains(addr))
            .min_by_key(|(_, f)| f.smallest_range(addr).map(|r| r.size()).unwrap_or(u32::MAX))
            .map(|(id, _)| id)
    }

    /// True when any known range covers the address.
    pub fn addr_covered(&self, addr: u32) -> bool {
        self.functions
            .iter()
            .any(|f| f.ranges.iter().any(|r| r.contains(addr)))
    }

    pub fn set_profile_dirty(&self) {
        self.profile_dirty.store(true, Ordering::Relaxed);
    }

    /// Observe and clear the profile-changed flag. The UI re-sorts its
    /// views when this returns true.
    pub fn take_profile_dirty(&self) -> bool {
        self.profile_dirty.swap(false, Ordering::Relaxed)
    }

    pub fn profile_dirty(&self) -> bool {
        self.profile_dirty.load(Ordering::Relaxed)
    }

    /// Roll the per-frame statistics: source first, then functions
    /// against the source, then lines against both.
    pub fn new_frame(&mut self) {
        self.frames_seen += 1;
        let frames = self.frames_seen;

        self.stats.new_frame(frames, None, None);
        let source_stats = self.stats;

        for function in &mut self.functions {
            function.flat.new_frame(frames, None, Some(&source_stats));
            function
                .cumulative
                .new_frame(frames, None, Some(&source_stats));
        }

        for line in &mut self.lines {
            let function_stats = line.function.map(|f| self.functions[f].flat);
            line.stats
                .new_frame(frames, function_stats.as_ref(), Some(&source_stats));
        }
    }

    /// Populate the sorted views with their default orderings. Called
    /// once, after construction.
    pub fn init_sorted_views(&mut self) {
        self.sorted_lines.lines = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.disassembly.is_empty())
            .map(|(id, _)| id)
            .collect();
        self.sorted_functions.functions = (0..self.functions.len()).collect();
        self.sorted_globals.variables = (0..self.globals.len()).collect();

        let (lm, ld, lp) = (
            self.sorted_lines.method,
            self.sorted_lines.descending,
            self.sorted_lines.phase,
        );
        let mut sorted_lines = std::mem::take(&mut self.sorted_lines);
        sorted_lines.sort(self, lm, ld, lp);
        self.sorted_lines = sorted_lines;

        let (fm, fd, fp, fc) = (
            self.sorted_functions.method,
            self.sorted_functions.descending,
            self.sorted_functions.phase,
            self.sorted_functions.cumulative,
        );
        let mut sorted_functions = std::mem::take(&mut self.sorted_functions);
        sorted_functions.sort(self, fm, fd, fp, fc);
        self.sorted_functions = sorted_functions;

        let (vm, vd) = (
            self.sorted_globals.method,
            self.sorted_globals.descending,
        );
        let mut sorted_globals = std::mem::take(&mut self.sorted_globals);
        sorted_globals.sort(self, vm, vd);
        self.sorted_globals = sorted_globals;
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn driver_always_present() {
        let source = Source::new();
        assert_eq!(
            source.functions[source.driver_function].name,
            DRIVER_FUNCTION
        );
        assert!(source.functions[source.driver_function].is_stub());
        assert_eq!(
            source.lines[source.driver_line].function,
            Some(source.driver_function)
        );
    }

    #[test]
    fn function_commit_is_idempotent() {
        let mut source = Source::new();

        let mut f = SourceFunction::new("f");
        f.add_range(SourceRange {
            start: 0x8000,
            end: 0x80ff,
            inline: false,
        });
        let id = source.add_function(f);

        let mut f2 = SourceFunction::new("f");
        f2.add_range(SourceRange {
            start: 0x9000,
            end: 0x90ff,
            inline: true,
        });
        let id2 = source.add_function(f2);

        assert_eq!(id, id2);
        assert_eq!(source.functions[id].ranges.len(), 2);
    }

    #[test]
    fn smallest_range_wins() {
        let mut source = Source::new();

        let mut outer = SourceFunction::new("outer");
        outer.add_range(SourceRange {
            start: 0x8000,
            end: 0x801f,
            inline: false,
        });
        source.add_function(outer);

        let mut inner = SourceFunction::new("inner");
        inner.add_range(SourceRange {
            start: 0x8008,
            end: 0x800f,
            inline: true,
        });
        source.add_function(inner);

        let (id, range) = source.function_range_at(0x800a).unwrap();
        assert_eq!(source.functions[id].name, "inner");
        assert!(range.inline);

        let (id, _) = source.function_range_at(0x8000).unwrap();
        assert_eq!(source.functions[id].name, "outer");
    }
}
