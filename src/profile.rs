//! Execution statistics, classified by the television phase in which the
//! coprocessor instruction ran.
//!
//! Statistics accumulate per source line, per function (flat and
//! cumulative) and for the source overall. A rollup happens once per
//! television frame: the accumulated count becomes the frame count, feeds
//! the running average and the maximum, and percentage views are computed
//! against the containing function and the source total.

use crate::coproc::{Tv, SIGNAL_VBLANK};
use strum_macros::Display;

/// Classification of when an instruction ran relative to the television
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    #[strum(serialize = "all")]
    All,
    #[strum(serialize = "VBLANK")]
    Vblank,
    #[strum(serialize = "screen")]
    Screen,
    #[strum(serialize = "overscan")]
    Overscan,
}

/// Decide the phase for a profile batch from the television state.
pub fn phase_from_tv(tv: &dyn Tv) -> (Phase, bool) {
    let frame = tv.frame_info();
    let coords = tv.coords();

    let phase = if tv.last_signal() & SIGNAL_VBLANK != 0 || coords.scanline < frame.visible_top {
        Phase::Vblank
    } else if coords.scanline > frame.visible_bottom {
        Phase::Overscan
    } else {
        Phase::Screen
    };

    (phase, frame.stable)
}

/// Bitset of phases that have executed an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Phases(u8);

impl Phases {
    pub const VBLANK: u8 = 0b0001;
    pub const SCREEN: u8 = 0b0010;
    pub const OVERSCAN: u8 = 0b0100;
    pub const UNSTABLE: u8 = 0b1000;

    pub fn record(&mut self, phase: Phase, stable: bool) {
        match phase {
            Phase::All => {}
            Phase::Vblank => self.0 |= Self::VBLANK,
            Phase::Screen => self.0 |= Self::SCREEN,
            Phase::Overscan => self.0 |= Self::OVERSCAN,
        }
        if !stable {
            self.0 |= Self::UNSTABLE;
        }
    }

    pub fn contains(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    /// True when nothing has been recorded yet.
    pub fn is_any(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// A percentage with a validity bit. Invalid when the denominator was zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pct {
    pub value: f32,
    pub valid: bool,
}

impl Pct {
    fn of(n: f32, d: f32) -> Pct {
        if d > 0.0 {
            Pct {
                value: n / d * 100.0,
                valid: true,
            }
        } else {
            Pct::default()
        }
    }
}

/// Cycle counts for one phase class of one entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Load {
    accum: f32,
    cumulative: f32,

    /// Count over the most recent frame.
    pub frame: f32,

    /// Running average count per frame.
    pub avg: f32,

    /// Highest frame count seen.
    pub max: f32,

    pub frame_of_function: Pct,
    pub avg_of_function: Pct,
    pub max_of_function: Pct,
    pub frame_of_source: Pct,
    pub avg_of_source: Pct,
    pub max_of_source: Pct,
}

impl Load {
    pub fn accumulate(&mut self, cycles: f32) {
        self.accum += cycles;
    }

    /// True when any cycles have ever been recorded.
    pub fn has_executed(&self) -> bool {
        self.cumulative > 0.0 || self.accum > 0.0
    }

    /// Roll the accumulation into frame/average/max counts and compute the
    /// percentage views. `function` and `source` must have been rolled for
    /// the same frame already.
    pub fn new_frame(&mut self, frames: u64, function: Option<&Load>, source: Option<&Load>) {
        self.frame = self.accum;
        self.cumulative += self.accum;
        self.accum = 0.0;
        if frames > 0 {
            self.avg = self.cumulative / frames as f32;
        }
        if self.frame > self.max {
            self.max = self.frame;
        }

        if let Some(function) = function {
            self.frame_of_function = Pct::of(self.frame, function.frame);
            self.avg_of_function = Pct::of(self.avg, function.avg);
            self.max_of_function = Pct::of(self.max, function.max);
        }
        if let Some(source) = source {
            self.frame_of_source = Pct::of(self.frame, source.frame);
            self.avg_of_source = Pct::of(self.avg, source.avg);
            self.max_of_source = Pct::of(self.max, source.max);
        }
    }
}

/// The four phase classes of one entity. The overall class accumulates
/// whatever the batch phase is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsGroup {
    pub overall: Load,
    pub vblank: Load,
    pub screen: Load,
    pub overscan: Load,
}

impl StatsGroup {
    pub fn accumulate(&mut self, phase: Phase, cycles: f32) {
        self.overall.accumulate(cycles);
        match phase {
            Phase::All => {}
            Phase::Vblank => self.vblank.accumulate(cycles),
            Phase::Screen => self.screen.accumulate(cycles),
            Phase::Overscan => self.overscan.accumulate(cycles),
        }
    }

    pub fn by_phase(&self, phase: Phase) -> &Load {
        match phase {
            Phase::All => &self.overall,
            Phase::Vblank => &self.vblank,
            Phase::Screen => &self.screen,
            Phase::Overscan => &self.overscan,
        }
    }

    pub fn has_executed(&self) -> bool {
        self.overall.has_executed()
    }

    pub fn new_frame(&mut self, frames: u64, function: Option<&StatsGroup>, source: Option<&StatsGroup>) {
        self.overall
            .new_frame(frames, function.map(|f| &f.overall), source.map(|s| &s.overall));
        self.vblank
            .new_frame(frames, function.map(|f| &f.vblank), source.map(|s| &s.vblank));
        self.screen
            .new_frame(frames, function.map(|f| &f.screen), source.map(|s| &s.screen));
        self.overscan.new_frame(
            frames,
            function.map(|f| &f.overscan),
            source.map(|s| &s.overscan),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rollup() {
        let mut source = StatsGroup::default();
        let mut line = StatsGroup::default();

        source.accumulate(Phase::Screen, 100.0);
        line.accumulate(Phase::Screen, 25.0);

        source.new_frame(1, None, None);
        line.new_frame(1, None, Some(&source));

        assert_eq!(line.screen.frame, 25.0);
        assert_eq!(line.screen.avg, 25.0);
        assert_eq!(line.screen.max, 25.0);
        assert!(line.screen.frame_of_source.valid);
        assert_eq!(line.screen.frame_of_source.value, 25.0);

        // an idle frame halves the average
        source.new_frame(2, None, None);
        line.new_frame(2, None, Some(&source));
        assert_eq!(line.screen.frame, 0.0);
        assert_eq!(line.screen.avg, 12.5);
        assert_eq!(line.screen.max, 25.0);
        assert!(!line.screen.frame_of_source.valid);
    }

    #[test]
    fn phase_bits() {
        let mut phases = Phases::default();
        assert!(phases.is_any());
        phases.record(Phase::Vblank, true);
        phases.record(Phase::Screen, false);
        assert!(phases.contains(Phases::VBLANK));
        assert!(phases.contains(Phases::SCREEN));
        assert!(phases.contains(Phases::UNSTABLE));
        assert!(!phases.contains(Phases::OVERSCAN));
    }
}
