//! The active call chain and per-batch profiling.
//!
//! The emulator does not report calls and returns; the chain is inferred
//! from the stream of executed addresses. A new function appearing at the
//! top of the stream either pushes a frame or, if it is already somewhere
//! on the stack, pops back to it. Popping more than one frame at once
//! means the compiler collapsed the chain (tail calls, inlining beyond
//! what the DWARF admits) and the popped functions are flagged.

use crate::profile::Phase;
use crate::source::{LineId, Source};
use std::collections::BTreeMap;

/// The active call chain, top of stack last, and the map of observed
/// callers per function.
#[derive(Default)]
pub struct CallStack {
    pub stack: Vec<LineId>,

    /// Function name to the source lines observed calling it. Ordered by
    /// function name.
    pub callers: BTreeMap<String, Vec<LineId>>,
}

impl CallStack {
    /// Reset the chain to the driver alone.
    pub fn reset(&mut self, driver_line: LineId) {
        self.stack.clear();
        self.stack.push(driver_line);
    }

    fn record_caller(&mut self, function: &str, caller: LineId) {
        let callers = self.callers.entry(function.to_string()).or_default();
        if !callers.contains(&caller) {
            callers.push(caller);
        }
    }
}

/// Accumulate one batch of `(address, cycles)` pairs emitted by the
/// emulator, classified by television phase.
pub fn profile_batch(
    source: &mut Source,
    callstack: &mut CallStack,
    entries: &[(u32, f32)],
    phase: Phase,
    stable: bool,
) {
    for &(addr, cycles) in entries {
        let line = match source.lines_by_address.get(&addr) {
            Some(&line) => line,
            None => {
                // an address the DWARF never covered: bind it to the
                // driver line from now on
                source.lines_by_address.insert(addr, source.driver_line);
                source.driver_line
            }
        };

        let function = source.lines[line].function.unwrap_or(source.driver_function);

        maintain_stack(source, callstack, line, function);

        // flat accumulation
        source.lines[line].stats.accumulate(phase, cycles);
        source.lines[line].kernel.record(phase, stable);
        source.functions[function].flat.accumulate(phase, cycles);
        source.functions[function].kernel.record(phase, stable);
        source.stats.accumulate(phase, cycles);

        // cumulative accumulation over the whole chain. recursion must
        // not count a function twice
        let mut seen = vec![function];
        source.functions[function].cumulative.accumulate(phase, cycles);
        for &frame in &callstack.stack {
            let f = source.lines[frame].function.unwrap_or(source.driver_function);
            if !seen.contains(&f) {
                seen.push(f);
                source.functions[f].cumulative.accumulate(phase, cycles);
            }
        }

        source.set_profile_dirty();
    }
}

fn maintain_stack(
    source: &mut Source,
    callstack: &mut CallStack,
    line: LineId,
    function: usize,
) {
    if source.functions[function].is_stub() {
        return;
    }

    let top_function = callstack
        .stack
        .last()
        .and_then(|&l| source.lines[l].function)
        .unwrap_or(source.driver_function);
    if function == top_function {
        return;
    }

    // pop attempt: is the function already somewhere on the stack?
    let found = callstack.stack.iter().rposition(|&frame| {
        source.lines[frame].function.unwrap_or(source.driver_function) == function
    });

    match found {
        Some(at) => {
            let popped: Vec<LineId> = callstack.stack.split_off(at + 1);
            if popped.len() >= 2 {
                for frame in popped {
                    if let Some(f) = source.lines[frame].function {
                        source.functions[f].optimised_callstack = true;
                    }
                }
            }
        }
        None => {
            if let Some(&caller) = callstack.stack.last() {
                let name = source.functions[function].name.clone();
                callstack.record_caller(&name, caller);
            }
            callstack.stack.push(line);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::function::{SourceFunction, SourceRange};
    use crate::source::Source;

    // a source with functions main, f, g, h at separate addresses
    fn harness() -> (Source, CallStack, Vec<u32>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut source = Source::new();

        let mut addrs = vec![];
        for (i, name) in ["main", "f", "g", "h"].iter().enumerate() {
            let addr = 0x8000 + (i as u32) * 0x100;
            let function = source.add_function(SourceFunction::new(*name));
            source.functions[function].add_range(SourceRange {
                start: addr,
                end: addr + 0xff,
                inline: false,
            });
            let line = source.add_stub_line(format!("{name}:"));
            source.lines[line].function = Some(function);
            source.lines_by_address.insert(addr, line);
            addrs.push(addr);
        }
        source.main_function = source.function_by_name("main");

        let mut callstack = CallStack::default();
        callstack.reset(source.driver_line);

        (source, callstack, addrs)
    }

    fn names(source: &Source, callstack: &CallStack) -> Vec<String> {
        callstack
            .stack
            .iter()
            .map(|&l| {
                let f = source.lines[l].function.unwrap_or(source.driver_function);
                source.functions[f].name.clone()
            })
            .collect()
    }

    #[test]
    fn push_and_pop() {
        let (mut source, mut callstack, addrs) = harness();
        let (a_main, a_f, a_g) = (addrs[0], addrs[1], addrs[2]);

        for (addr, expect) in [
            (a_main, vec!["<driver>", "main"]),
            (a_f, vec!["<driver>", "main", "f"]),
            (a_g, vec!["<driver>", "main", "f", "g"]),
            (a_f, vec!["<driver>", "main", "f"]),
            (a_main, vec!["<driver>", "main"]),
        ] {
            profile_batch(
                &mut source,
                &mut callstack,
                &[(addr, 1.0)],
                Phase::All,
                true,
            );
            assert_eq!(names(&source, &callstack), expect);
        }

        let f = source.function_by_name("f").unwrap();
        assert!(!source.functions[f].optimised_callstack);
    }

    #[test]
    fn collapsed_chain_marks_functions() {
        let (mut source, mut callstack, addrs) = harness();
        let (a_f, a_g, a_h) = (addrs[1], addrs[2], addrs[3]);

        for addr in [a_f, a_g, a_h, a_f] {
            profile_batch(
                &mut source,
                &mut callstack,
                &[(addr, 1.0)],
                Phase::All,
                true,
            );
        }

        assert_eq!(names(&source, &callstack), vec!["<driver>", "f"]);
        let g = source.function_by_name("g").unwrap();
        let h = source.function_by_name("h").unwrap();
        let f = source.function_by_name("f").unwrap();
        assert!(source.functions[g].optimised_callstack);
        assert!(source.functions[h].optimised_callstack);
        assert!(!source.functions[f].optimised_callstack);
    }

    #[test]
    fn callers_recorded() {
        let (mut source, mut callstack, addrs) = harness();
        profile_batch(
            &mut source,
            &mut callstack,
            &[(addrs[1], 1.0)],
            Phase::All,
            true,
        );
        assert_eq!(callstack.callers["f"], vec![source.driver_line]);
    }

    #[test]
    fn unknown_address_memoised_to_driver() {
        let (mut source, mut callstack, _) = harness();
        profile_batch(
            &mut source,
            &mut callstack,
            &[(0x100, 2.0)],
            Phase::Screen,
            true,
        );
        assert_eq!(source.lines_by_address[&0x100], source.driver_line);
        assert!(source.lines[source.driver_line].stats.has_executed());
    }
}
