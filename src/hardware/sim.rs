//! Simulated countdown timer for unit tests
use super::{CountdownTimer, Halt, Instrument};
use crate::timeout::TimeoutTimer;

#[derive(Debug, Default)]
pub struct SimTimer {
    pub counter: u16,
    pub pending: bool,
    pub enabled: bool,
    /// Ticks since creation.
    pub now: u64,
    /// Halted instruments with the tick they were halted at.
    pub halts: std::vec::Vec<(Instrument, u64)>,
}

impl CountdownTimer for SimTimer {
    fn counter(&self) -> u16 {
        self.counter
    }

    fn set_counter(&mut self, count: u16) {
        self.counter = count;
    }

    fn rollover_pending(&self) -> bool {
        self.pending
    }

    fn clear_rollover(&mut self) {
        self.pending = false;
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }
}

impl Halt for SimTimer {
    fn halt(&mut self, instrument: Instrument) {
        self.halts.push((instrument, self.now));
    }
}

impl SimTimer {
    /// Advance time, servicing rollovers as they occur.
    pub fn run<const N: usize>(&mut self, mux: &TimeoutTimer<N>, ticks: u64) {
        let mut left = ticks;
        while left > 0 {
            if !self.enabled {
                self.now += left;
                return;
            }
            let to_wrap = (1 << 16) - self.counter as u64;
            let step = left.min(to_wrap);
            self.now += step;
            left -= step;
            self.counter = (self.counter as u64 + step) as u16;
            if step == to_wrap {
                self.pending = true;
                mux.on_rollover(self);
            }
        }
    }
}
