//! Output instrument operations
//!
//! The DC outputs and the arbitrary waveform generator are driven by step functions following
//! the protocol in [crate::state]. Both wait on DACs in the same way: write a code once the DAC
//! accepts it, then let the analog output settle. That sequence is [DacWrite].
use fugit::{MillisDurationU32, TimerInstantU32};

use crate::state::{Error, Next};

pub mod awg;
pub mod dc;

/// Control loop millisecond clock.
pub type Instant = TimerInstantU32<1000>;
pub type Duration = MillisDurationU32;

/// Operations that can own an output instrument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Func {
    DcSet,
    AwgRun,
    AwgOffset,
}

/// Time since `since`, zero if the clock reads earlier.
pub fn elapsed(now: Instant, since: Instant) -> Duration {
    now.checked_duration_since(since)
        .unwrap_or(Duration::from_ticks(0))
}

/// A DAC accepting codes.
pub trait Dac {
    /// Whether the DAC accepts a new code.
    fn is_ready(&self) -> bool;

    fn write(&mut self, code: u16);
}

/// Linear millivolt to DAC code conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Calibration {
    /// Code at zero volts.
    pub offset: i32,
    /// Codes per `denominator` millivolts.
    pub numerator: i32,
    pub denominator: i32,
}

impl Calibration {
    pub fn code(&self, mv: i32) -> Result<u16, Error> {
        if self.denominator == 0 {
            return Err(Error::InvalidParameter);
        }
        let code = self.offset as i64
            + (mv as i64 * self.numerator as i64)
                .div_euclid(self.denominator as i64);
        u16::try_from(code).map_err(|_| Error::InvalidParameter)
    }
}

/// Phases of a DAC update.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the DAC to accept the code.
    Write,
    /// Waiting for the output to settle.
    Settle,
}

/// Side effect requested by a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    None,
    WriteDac,
}

/// The DAC update transition.
///
/// # Args
/// * `phase` - The current phase.
/// * `ready` - Whether the DAC is ready.
/// * `waited` - Time spent in the current phase.
/// * `settle` - Settling time after the write.
/// * `timeout` - Time to wait for the DAC to get ready.
pub fn transition(
    phase: Phase,
    ready: bool,
    waited: Duration,
    settle: Duration,
    timeout: Duration,
) -> (Next<Phase>, Effect) {
    match phase {
        Phase::Write if ready => (Next::Go(Phase::Settle), Effect::WriteDac),
        Phase::Write if waited >= timeout => {
            (Next::Fail(Error::HardwareTimeout), Effect::None)
        }
        Phase::Settle if waited >= settle => (Next::Done, Effect::None),
        _ => (Next::Stay, Effect::None),
    }
}

/// A DAC update in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DacWrite {
    pub phase: Phase,
    pub code: u16,
    since: Instant,
}

impl DacWrite {
    pub fn new(code: u16, now: Instant) -> Self {
        Self {
            phase: Phase::Write,
            code,
            since: now,
        }
    }

    /// Advance the update.
    ///
    /// # Returns
    /// [Next::Go] on a phase change, [Next::Done] once settled.
    pub fn poll<D: Dac + ?Sized>(
        &mut self,
        dac: &mut D,
        now: Instant,
        settle: Duration,
        timeout: Duration,
    ) -> Next<Phase> {
        let (next, effect) = transition(
            self.phase,
            dac.is_ready(),
            elapsed(now, self.since),
            settle,
            timeout,
        );
        if effect == Effect::WriteDac {
            dac.write(self.code);
        }
        if let Next::Go(phase) = next {
            self.phase = phase;
            self.since = now;
        }
        next
    }
}

#[cfg(test)]
pub mod testing {
    use super::Dac;

    /// A DAC that gets ready after a number of polls.
    #[derive(Debug, Default)]
    pub struct SimDac {
        pub busy: u32,
        pub writes: std::vec::Vec<u16>,
    }

    impl Dac for SimDac {
        fn is_ready(&self) -> bool {
            self.busy == 0
        }

        fn write(&mut self, code: u16) {
            self.writes.push(code);
        }
    }

    impl SimDac {
        pub fn tick(&mut self) {
            self.busy = self.busy.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(t: u32) -> Duration {
        Duration::millis(t)
    }

    #[test]
    fn transitions() {
        let t = |phase, ready, waited| {
            transition(phase, ready, ms(waited), ms(5), ms(100))
        };
        assert_eq!(
            t(Phase::Write, true, 0),
            (Next::Go(Phase::Settle), Effect::WriteDac)
        );
        assert_eq!(t(Phase::Write, false, 99), (Next::Stay, Effect::None));
        assert_eq!(
            t(Phase::Write, false, 100),
            (Next::Fail(Error::HardwareTimeout), Effect::None)
        );
        assert_eq!(t(Phase::Settle, false, 4), (Next::Stay, Effect::None));
        assert_eq!(t(Phase::Settle, true, 5), (Next::Done, Effect::None));
    }

    #[test]
    fn calibration() {
        // 16 bit over +-10 V
        let cal = Calibration {
            offset: 32768,
            numerator: 65536,
            denominator: 20_000,
        };
        assert_eq!(cal.code(0), Ok(32768));
        assert_eq!(cal.code(-10_000), Ok(0));
        assert_eq!(cal.code(5_000), Ok(49152));
        assert_eq!(cal.code(10_000), Err(Error::InvalidParameter));
        assert_eq!(
            Calibration {
                denominator: 0,
                ..cal
            }
            .code(0),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn clock() {
        let a = Instant::from_ticks(10);
        assert_eq!(elapsed(Instant::from_ticks(25), a), ms(15));
        assert_eq!(elapsed(Instant::from_ticks(5), a), ms(0));
    }
}
