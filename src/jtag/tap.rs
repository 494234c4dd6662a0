//! The IEEE 1149.1 TAP state graph and precomputed TMS paths.

use once_cell::sync::Lazy;

/// The sixteen TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

use TapState::*;

impl TapState {
    pub const ALL: [TapState; 16] = [
        TestLogicReset,
        RunTestIdle,
        SelectDrScan,
        CaptureDr,
        ShiftDr,
        Exit1Dr,
        PauseDr,
        Exit2Dr,
        UpdateDr,
        SelectIrScan,
        CaptureIr,
        ShiftIr,
        Exit1Ir,
        PauseIr,
        Exit2Ir,
        UpdateIr,
    ];

    fn index(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).unwrap()
    }

    /// The state entered when one TCK cycle is clocked with the given TMS
    /// level.
    pub fn step(self, tms: bool) -> TapState {
        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true) => TestLogicReset,
            (RunTestIdle, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,

            (SelectDrScan, false) => CaptureDr,
            (SelectDrScan, true) => SelectIrScan,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => RunTestIdle,
            (UpdateDr, true) => SelectDrScan,

            (SelectIrScan, false) => CaptureIr,
            (SelectIrScan, true) => TestLogicReset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => RunTestIdle,
            (UpdateIr, true) => SelectDrScan,
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, ShiftDr | ShiftIr)
    }
}

/// A TMS bit string, first bit in bit 0. Never longer than 7 bits, so it
/// always fits one MPSSE TMS command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TmsSequence {
    pub bits: u8,
    pub len: u8,
}

impl TmsSequence {
    fn push(self, tms: bool) -> TmsSequence {
        TmsSequence {
            bits: self.bits | ((tms as u8) << self.len),
            len: self.len + 1,
        }
    }
}

/// Shortest TMS sequence from `from` to `to`.
///
/// Paths never pass through Shift-DR or Shift-IR on the way (entering a Shift
/// state clocks data), and the sequence for `from == to` is empty.
pub fn tms_sequence(from: TapState, to: TapState) -> TmsSequence {
    static TABLE: Lazy<[[TmsSequence; 16]; 16]> = Lazy::new(build_paths);

    TABLE[from.index()][to.index()]
}

fn build_paths() -> [[TmsSequence; 16]; 16] {
    let mut table = [[TmsSequence::default(); 16]; 16];

    for from in TapState::ALL {
        let mut seen = [false; 16];
        let mut queue = std::collections::VecDeque::new();

        seen[from.index()] = true;
        queue.push_back((from, TmsSequence::default()));

        while let Some((state, path)) = queue.pop_front() {
            table[from.index()][state.index()] = path;

            // A Shift state terminates its path; walking onwards through it
            // would clock data into the scan chain.
            if state.is_shift() && state != from {
                continue;
            }

            for tms in [false, true] {
                let next = state.step(tms);
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    let next_path = path.push(tms);
                    assert!(next_path.len <= 7);
                    queue.push_back((next, next_path));
                }
            }
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(from: TapState, seq: TmsSequence) -> TapState {
        let mut state = from;
        for i in 0..seq.len {
            state = state.step(seq.bits & (1 << i) != 0);
        }
        state
    }

    #[test]
    fn idle_to_shift_dr() {
        let seq = tms_sequence(RunTestIdle, ShiftDr);
        assert_eq!(seq.len, 3);
        assert_eq!(seq.bits, 0b001); // 1, 0, 0
    }

    #[test]
    fn shift_dr_to_shift_ir() {
        let seq = tms_sequence(ShiftDr, ShiftIr);
        assert_eq!(seq.len, 6);
        assert_eq!(seq.bits, 0b001111); // 1, 1, 1, 1, 0, 0
    }

    #[test]
    fn self_paths_are_empty() {
        for state in TapState::ALL {
            assert_eq!(tms_sequence(state, state).len, 0);
        }
    }

    #[test]
    fn every_path_lands_on_its_target() {
        for from in TapState::ALL {
            for to in TapState::ALL {
                let seq = tms_sequence(from, to);
                assert_eq!(walk(from, seq), to, "{from:?} -> {to:?}");
                assert!(seq.len <= 7);
            }
        }
    }

    #[test]
    fn no_path_passes_through_a_shift_state() {
        for from in TapState::ALL {
            for to in TapState::ALL {
                let seq = tms_sequence(from, to);
                let mut state = from;
                for i in 0..seq.len {
                    state = state.step(seq.bits & (1 << i) != 0);
                    if i + 1 < seq.len {
                        assert!(!state.is_shift(), "{from:?} -> {to:?} crosses {state:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn random_walk_matches_step_function() {
        // Small LCG so the walk is reproducible.
        let mut rng = 0x2545_f491_u32;
        let mut state = TestLogicReset;
        for _ in 0..10_000 {
            rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let target = TapState::ALL[(rng >> 16) as usize % 16];
            state = walk(state, tms_sequence(state, target));
            assert_eq!(state, target);
        }
    }

    #[test]
    fn reset_from_anywhere_is_at_most_five_ones() {
        for from in TapState::ALL {
            let seq = tms_sequence(from, TestLogicReset);
            assert!(seq.len <= 5, "{from:?}");
            // All bits on the way to reset are 1.
            assert_eq!(seq.bits, (1 << seq.len) - 1, "{from:?}");
        }
    }
}
