//! The borrow orchestrator: the one object both threads talk to.
//!
//! Four independent locks protect the model: `source`, `callstack`,
//! `yield_state` and `breakpoints` (plus one for the illegal access
//! log). Each is held for the duration of a user supplied closure and
//! released on every exit path. Locks nest only in the order
//! `source -> callstack -> yield_state`; everything else copies what it
//! needs and releases before taking the next lock.
//!
//! The UI thread never touches the coprocessor. Reading a variable's
//! live location posts a closure onto the emulator thread through
//! [`Cart::push_function`]; the result lands in the variable's location
//! cell, which the UI reads without blocking the emulator.

use crate::breakpoints::Breakpoints;
use crate::coproc::{Cart, CoProc, Disassembler, Tv, YieldReason};
use crate::dwarf;
use crate::error::LoadError;
use crate::illegal_access::{AccessEvent, IllegalAccessLog};
use crate::profile::phase_from_tv;
use crate::source::callstack::{profile_batch, CallStack};
use crate::source::variable::SourceVariable;
use crate::source::{LineId, LocalId, Source};
use crate::yield_state::YieldState;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Behavioural options. Nothing here persists.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Allow breakpoints on any line with disassembly, not only on lines
    /// whose addresses are statement starts.
    pub relaxed_breakpoints: bool,
}

pub struct Overlay {
    source: Mutex<Source>,
    callstack: Mutex<CallStack>,
    yield_state: Mutex<YieldState>,
    breakpoints: Mutex<Breakpoints>,
    illegal_access: Mutex<IllegalAccessLog>,

    cart: Arc<dyn Cart>,
    coproc: Arc<dyn CoProc>,
    tv: Arc<dyn Tv>,
    options: Options,
}

impl Overlay {
    /// Build the model from the ELF at (or under) `elf_path` and wire up
    /// the collaborators. Construction errors mean no overlay at all.
    pub fn new(
        elf_path: &Path,
        rom_dir: &Path,
        cart: Arc<dyn Cart>,
        coproc: Arc<dyn CoProc>,
        disassembler: &dyn Disassembler,
        tv: Arc<dyn Tv>,
        options: Options,
    ) -> Result<Overlay, LoadError> {
        let source = dwarf::build(elf_path, rom_dir, &*cart, &*coproc, disassembler)?;

        let mut callstack = CallStack::default();
        callstack.reset(source.driver_line);

        Ok(Overlay {
            source: Mutex::new(source),
            callstack: Mutex::new(callstack),
            yield_state: Mutex::new(YieldState::default()),
            breakpoints: Mutex::new(Breakpoints::default()),
            illegal_access: Mutex::new(IllegalAccessLog::default()),
            cart,
            coproc,
            tv,
            options,
        })
    }

    pub fn options(&self) -> Options {
        self.options
    }

    // ------------------------------- borrowing accessors ----------------

    pub fn borrow_source<T>(&self, f: impl FnOnce(&mut Source) -> T) -> T {
        f(&mut self.source.lock())
    }

    pub fn borrow_call_stack<T>(&self, f: impl FnOnce(&mut CallStack) -> T) -> T {
        f(&mut self.callstack.lock())
    }

    pub fn borrow_yield_state<T>(&self, f: impl FnOnce(&mut YieldState) -> T) -> T {
        f(&mut self.yield_state.lock())
    }

    pub fn borrow_breakpoints<T>(&self, f: impl FnOnce(&mut Breakpoints) -> T) -> T {
        f(&mut self.breakpoints.lock())
    }

    pub fn borrow_illegal_access<T>(&self, f: impl FnOnce(&mut IllegalAccessLog) -> T) -> T {
        f(&mut self.illegal_access.lock())
    }

    // ------------------------------- UI thread ---------------------------

    /// Toggle a breakpoint on a line, over all of the line's addresses.
    pub fn toggle_breakpoint(&self, line: LineId) {
        let addresses: Vec<u32> = {
            let source = self.source.lock();
            let l = &source.lines[line];
            if !(l.breakable || (self.options.relaxed_breakpoints && !l.disassembly.is_empty())) {
                return;
            }
            l.break_addresses.to_vec()
        };
        self.breakpoints.lock().toggle(&addresses);
    }

    pub fn check_breakpoint(&self, line: LineId) -> bool {
        let addresses: Vec<u32> = {
            let source = self.source.lock();
            source.lines[line].break_addresses.to_vec()
        };
        self.breakpoints.lock().check(&addresses)
    }

    /// Request a fresh resolution of a variable's location. The work runs
    /// on the emulator thread; the result appears in the variable's cell.
    pub fn request_variable_update(&self, var: &SourceVariable) {
        var.post_update(&*self.cart, Arc::clone(&self.coproc));
    }

    // ------------------------------- emulator thread ---------------------

    /// Record a yield. Bug reasons mark the source line; locals in scope
    /// at the machine's actual program counter are collected and
    /// refreshed.
    pub fn on_yield(&self, instruction_pc: u32, current_pc: u32, reason: YieldReason) {
        if reason == YieldReason::SyncWithVcs {
            let mut yield_state = self.yield_state.lock();
            yield_state.instruction_pc = instruction_pc;
            yield_state.reason = reason;
            yield_state.local_variables.clear();
            return;
        }

        let mut source = self.source.lock();

        if reason.is_bug() {
            if let Some(line) = source.line_for_addr(instruction_pc) {
                source.lines[line].bug = true;
            }
        }

        let in_scope: Vec<LocalId> = source
            .locals
            .iter()
            .enumerate()
            .filter(|(_, local)| local.in_scope(current_pc))
            .map(|(i, _)| i)
            .collect();

        for global in &source.globals {
            global.update_recursive(&*self.coproc);
        }

        let mut yield_state = self.yield_state.lock();
        yield_state.instruction_pc = instruction_pc;
        yield_state.reason = reason;
        yield_state.local_variables = in_scope;

        for &local in &yield_state.local_variables {
            source.locals[local].var.update_recursive(&*self.coproc);
        }
    }

    /// Reset the call stack for a fresh run. Only honoured when the
    /// previous yield said the program ended.
    pub fn start_profiling(&self) {
        let reason = self.yield_state.lock().reason;
        if reason != YieldReason::ProgramEnded {
            return;
        }

        let source = self.source.lock();
        let mut callstack = self.callstack.lock();
        callstack.reset(source.driver_line);
    }

    /// Accumulate a batch of `(address, cycles)` pairs. The phase is
    /// decided per batch from the television state.
    pub fn profile(&self, entries: &[(u32, f32)]) {
        if entries.is_empty() {
            return;
        }
        let (phase, stable) = phase_from_tv(&*self.tv);

        let mut source = self.source.lock();
        let mut callstack = self.callstack.lock();
        profile_batch(&mut source, &mut callstack, entries, phase, stable);
    }

    /// Television frame boundary: roll the statistics.
    pub fn on_frame(&self) {
        self.source.lock().new_frame();
    }

    /// Breakpoint check for the emulator loop.
    pub fn should_break(&self, addr: u32) -> bool {
        let line = { self.source.lock().line_for_addr(addr) };
        self.breakpoints.lock().should_break(addr, line)
    }

    /// Record an illegal memory access observed by the emulator.
    pub fn log_access(&self, event: AccessEvent, pc: u32, addr: u32) {
        let line = { self.source.lock().line_for_addr(pc) };
        self.illegal_access.lock().record(event, pc, addr, line);
    }
}
