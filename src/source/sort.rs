//! Stable multi-key orderings over lines, functions and variables.
//!
//! The sorted views hold indices into the model arenas and are re-sorted
//! from the UI thread whenever the execution profile is observed dirty.
//! Sorts are stable: equal primary keys keep the file/line (or name)
//! order.

use crate::profile::Phase;
use crate::source::{FunctionId, GlobalId, LineId, Source};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSort {
    ByFile,
    ByFrameCycles,
    ByAvgCycles,
    ByMaxCycles,
}

/// Lines with executable content, ordered for presentation.
pub struct SortedLines {
    pub lines: Vec<LineId>,
    pub method: LineSort,
    pub descending: bool,
    pub phase: Phase,
}

impl Default for SortedLines {
    fn default() -> Self {
        SortedLines {
            lines: vec![],
            method: LineSort::ByFile,
            descending: false,
            phase: Phase::All,
        }
    }
}

impl SortedLines {
    pub fn sort(&mut self, source: &Source, method: LineSort, descending: bool, phase: Phase) {
        self.method = method;
        self.descending = descending;
        self.phase = phase;

        let position = |&id: &LineId| {
            let line = &source.lines[id];
            (line.file, line.number)
        };

        self.lines.sort_by(|a, b| {
            let primary = match method {
                LineSort::ByFile => Ordering::Equal,
                LineSort::ByFrameCycles => cmp_f32(
                    source.lines[*a].stats.by_phase(phase).frame,
                    source.lines[*b].stats.by_phase(phase).frame,
                ),
                LineSort::ByAvgCycles => cmp_f32(
                    source.lines[*a].stats.by_phase(phase).avg,
                    source.lines[*b].stats.by_phase(phase).avg,
                ),
                LineSort::ByMaxCycles => cmp_f32(
                    source.lines[*a].stats.by_phase(phase).max,
                    source.lines[*b].stats.by_phase(phase).max,
                ),
            };
            let primary = if descending { primary.reverse() } else { primary };
            primary.then_with(|| position(a).cmp(&position(b)))
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSort {
    ByName,
    ByFrameCycles,
    ByAvgCycles,
    ByMaxCycles,
}

pub struct SortedFunctions {
    pub functions: Vec<FunctionId>,
    pub method: FunctionSort,
    pub descending: bool,
    pub phase: Phase,

    /// Order by cumulative rather than flat statistics.
    pub cumulative: bool,
}

impl Default for SortedFunctions {
    fn default() -> Self {
        SortedFunctions {
            functions: vec![],
            method: FunctionSort::ByName,
            descending: false,
            phase: Phase::All,
            cumulative: false,
        }
    }
}

impl SortedFunctions {
    pub fn sort(
        &mut self,
        source: &Source,
        method: FunctionSort,
        descending: bool,
        phase: Phase,
        cumulative: bool,
    ) {
        self.method = method;
        self.descending = descending;
        self.phase = phase;
        self.cumulative = cumulative;

        let stats = |id: FunctionId| {
            let f = &source.functions[id];
            if cumulative {
                &f.cumulative
            } else {
                &f.flat
            }
        };

        self.functions.sort_by(|&a, &b| {
            let primary = match method {
                FunctionSort::ByName => Ordering::Equal,
                FunctionSort::ByFrameCycles => {
                    cmp_f32(stats(a).by_phase(phase).frame, stats(b).by_phase(phase).frame)
                }
                FunctionSort::ByAvgCycles => {
                    cmp_f32(stats(a).by_phase(phase).avg, stats(b).by_phase(phase).avg)
                }
                FunctionSort::ByMaxCycles => {
                    cmp_f32(stats(a).by_phase(phase).max, stats(b).by_phase(phase).max)
                }
            };
            let primary = if descending { primary.reverse() } else { primary };
            primary.then_with(|| source.functions[a].name.cmp(&source.functions[b].name))
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSort {
    ByName,
    ByAddress,
}

pub struct SortedVariables {
    pub variables: Vec<GlobalId>,
    pub method: VariableSort,
    pub descending: bool,
}

impl Default for SortedVariables {
    fn default() -> Self {
        SortedVariables {
            variables: vec![],
            method: VariableSort::ByName,
            descending: false,
        }
    }
}

impl SortedVariables {
    pub fn sort(&mut self, source: &Source, method: VariableSort, descending: bool) {
        self.method = method;
        self.descending = descending;

        self.variables.sort_by(|&a, &b| {
            let primary = match method {
                VariableSort::ByName => Ordering::Equal,
                VariableSort::ByAddress => source.globals[a]
                    .address()
                    .cmp(&source.globals[b].address()),
            };
            let primary = if descending { primary.reverse() } else { primary };
            primary.then_with(|| source.globals[a].name.cmp(&source.globals[b].name))
        });
    }
}

fn cmp_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::function::SourceFunction;

    #[test]
    fn functions_by_cycles_with_name_tiebreak() {
        let mut source = Source::new();
        for name in ["zeta", "alpha", "mid"] {
            source.add_function(SourceFunction::new(name));
        }
        let alpha = source.function_by_name("alpha").unwrap();
        let zeta = source.function_by_name("zeta").unwrap();
        source.functions[zeta].flat.accumulate(Phase::Screen, 10.0);
        source.functions[alpha].flat.accumulate(Phase::Screen, 10.0);
        source.new_frame();

        let mut sorted = SortedFunctions::default();
        sorted.functions = (0..source.functions.len()).collect();
        sorted.sort(&source, FunctionSort::ByFrameCycles, true, Phase::Screen, false);

        let names: Vec<&str> = sorted
            .functions
            .iter()
            .map(|&f| source.functions[f].name.as_str())
            .collect();

        // equal cycle counts fall back to name order
        assert_eq!(names, vec!["alpha", "zeta", "<driver>", "mid"]);
    }
}
