//! Interfaces onto the running emulation.
//!
//! The overlay never owns the coprocessor, the disassembler, the cartridge
//! or the television. It consumes them through the traits below. All trait
//! objects are shared with the emulator thread and must therefore be
//! `Send + Sync`.

use strum_macros::Display;

/// ARM program counter register number.
pub const PC_REGISTER: u32 = 15;

/// ARM stack pointer register number.
pub const SP_REGISTER: u32 = 13;

/// Live coprocessor state. Reads may fail, for example when an address is
/// outside any mapped memory area.
pub trait CoProc: Send + Sync {
    /// Value of register `n` from the register file.
    fn read_reg(&self, n: u32) -> Option<u32>;

    /// 32bit read from coprocessor memory.
    fn read_u32(&self, addr: u32) -> Option<u32>;
}

/// Decodes a 16bit opcode into a mnemonic. A Thumb-2 instruction that
/// occupies two halfwords reports `is_32bit` true for the leading halfword.
pub trait Disassembler: Send + Sync {
    /// Returns the instruction text and whether the opcode is the first
    /// halfword of a 32bit instruction.
    fn disassemble(&self, opcode: u16) -> (String, bool);
}

/// The cartridge hosting the coprocessor program.
pub trait Cart: Send + Sync {
    /// Load origin of a named ELF section. Only meaningful when the ELF is
    /// relocatable; a non-relocatable ELF carries its own addresses.
    fn elf_section(&self, name: &str) -> Option<u32>;

    /// Run `f` on the emulator thread at the next safe opportunity.
    fn push_function(&self, f: Box<dyn FnOnce() + Send>);
}

/// Television frame geometry, as known at the time of the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfo {
    pub visible_top: u32,
    pub visible_bottom: u32,
    pub stable: bool,
    pub total_clocks: u32,
}

/// Current television beam position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Coords {
    pub scanline: u32,
    pub clock: u32,
}

/// Bit in the [`Tv::last_signal`] mask indicating VBLANK is asserted.
pub const SIGNAL_VBLANK: u32 = 0b1;

/// The television attached to the console.
pub trait Tv: Send + Sync {
    fn frame_info(&self) -> FrameInfo;
    fn coords(&self) -> Coords;
    fn last_signal(&self) -> u32;
}

/// Why the emulator yielded to the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum YieldReason {
    #[strum(serialize = "program ended")]
    ProgramEnded,
    #[strum(serialize = "sync with VCS")]
    SyncWithVcs,
    #[strum(serialize = "memory access error")]
    MemoryAccessError,
    #[strum(serialize = "execution error")]
    ExecutionError,
    #[strum(serialize = "unimplemented feature")]
    UnimplementedFeature,
    #[strum(serialize = "undefined behaviour")]
    UndefinedBehaviour,
    #[strum(serialize = "breakpoint")]
    Breakpoint,
    #[strum(serialize = "step over")]
    StepOver,
    #[strum(serialize = "step into")]
    StepInto,
}

impl YieldReason {
    /// True for reasons that indicate a bug in the coprocessor program.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            YieldReason::MemoryAccessError
                | YieldReason::ExecutionError
                | YieldReason::UnimplementedFeature
                | YieldReason::UndefinedBehaviour
        )
    }
}
