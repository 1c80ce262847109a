//! Arbitrary waveform generator
//!
//! Running a waveform stops any running output, sets the output offset, loads the samples into
//! the DAC DMA transfer and starts the sampling timer. The offset is set by [AwgChannel::set_offset]
//! nested inside [AwgChannel::run], which can also be used on its own.
use num_enum::IntoPrimitive;

use super::{Calibration, Dac, DacWrite, Func, Instant, Phase};
use crate::buffer_index;
use crate::hardware::design_parameters::{
    AWG_MIN_PERIOD, AWG_OFFSET_SETTLE, DAC_READY_TIMEOUT, TIMER_FREQUENCY_HZ,
};
use crate::hardware::TimerSetting;
use crate::state::{Error, Next, Origin, Ownership, Status, Step};

/// Waveform output hardware.
pub trait Awg {
    type Offset: Dac + ?Sized;

    /// The output offset DAC.
    fn offset(&mut self) -> &mut Self::Offset;

    /// Point the DAC DMA transfer at `samples` and load the sampling timer.
    fn load(&mut self, samples: &[u16], timer: TimerSetting);

    fn start(&mut self);

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// A waveform to output, borrowed for the duration of the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Waveform<'a> {
    pub samples: &'a [u16],
    /// Sample rate in mSps.
    pub rate: u64,
    pub offset_mv: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum AwgStep {
    OffsetWrite = 1,
    OffsetSettle = 2,
    Load = 3,
    Start = 4,
}

impl Step for AwgStep {
    const ORIGIN: Origin = Origin::Awg;
}

impl From<Phase> for AwgStep {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Write => Self::OffsetWrite,
            Phase::Settle => Self::OffsetSettle,
        }
    }
}

/// The step after `step` in running a waveform.
fn advance(step: AwgStep) -> Option<AwgStep> {
    match step {
        AwgStep::OffsetWrite | AwgStep::OffsetSettle => Some(AwgStep::Load),
        AwgStep::Load => Some(AwgStep::Start),
        AwgStep::Start => None,
    }
}

pub struct AwgChannel {
    pub calibration: Calibration,
    owner: Ownership<Func>,
    step: Option<AwgStep>,
    timer: Option<TimerSetting>,
    offset: Option<DacWrite>,
}

impl AwgChannel {
    pub const fn new(calibration: Calibration) -> Self {
        Self {
            calibration,
            owner: Ownership::new(),
            step: None,
            timer: None,
            offset: None,
        }
    }

    pub fn owner(&mut self) -> &mut Ownership<Func> {
        &mut self.owner
    }

    /// Output a waveform.
    ///
    /// `waveform` must not change while the operation runs.
    pub fn run<A: Awg + ?Sized>(
        &mut self,
        awg: &mut A,
        waveform: &Waveform,
        now: Instant,
    ) -> Status<AwgStep> {
        if !self.owner.claim(Func::AwgRun) {
            return Status::Waiting;
        }
        let step = match self.step {
            Some(step) => step,
            None => {
                if waveform.samples.is_empty() {
                    return self.fail(Error::InvalidParameter);
                }
                let Some(timer) = TimerSetting::new(
                    TIMER_FREQUENCY_HZ,
                    waveform.rate,
                    AWG_MIN_PERIOD,
                ) else {
                    return self
                        .fail(buffer_index::Error::RateUnachievable.into());
                };
                if awg.is_running() {
                    awg.stop();
                }
                self.timer = Some(timer);
                self.owner.nest(Func::AwgRun, Func::AwgOffset);
                AwgStep::OffsetWrite
            }
        };

        match step {
            AwgStep::OffsetWrite | AwgStep::OffsetSettle => {
                match self.set_offset(awg, waveform.offset_mv, now) {
                    Status::Idle => self.owner.unnest(),
                    Status::Step(s) => {
                        self.step = Some(s);
                        return Status::Step(s);
                    }
                    Status::Waiting => return Status::Waiting,
                    Status::Error(e) => return self.fail(e),
                }
            }
            AwgStep::Load => {
                let Some(timer) = self.timer else {
                    return self.fail(Error::InvalidParameter);
                };
                awg.load(waveform.samples, timer);
            }
            AwgStep::Start => awg.start(),
        }

        match advance(step) {
            Some(next) => {
                self.step = Some(next);
                Status::Step(next)
            }
            None => {
                self.step = None;
                self.timer = None;
                self.owner.release(Func::AwgRun);
                Status::Idle
            }
        }
    }

    /// Set the output offset.
    pub fn set_offset<A: Awg + ?Sized>(
        &mut self,
        awg: &mut A,
        mv: i32,
        now: Instant,
    ) -> Status<AwgStep> {
        if !self.owner.claim(Func::AwgOffset) {
            return Status::Waiting;
        }
        if self.offset.is_none() {
            match self.calibration.code(mv) {
                Ok(code) => self.offset = Some(DacWrite::new(code, now)),
                Err(e) => {
                    self.owner.release(Func::AwgOffset);
                    return Status::Error(e);
                }
            }
        }
        let Some(offset) = self.offset.as_mut() else {
            return Status::Idle;
        };
        let next = offset.poll(
            awg.offset(),
            now,
            AWG_OFFSET_SETTLE,
            DAC_READY_TIMEOUT,
        );
        match next {
            Next::Stay => Status::Step(offset.phase.into()),
            Next::Go(phase) => Status::Step(phase.into()),
            Next::Done => {
                self.offset = None;
                self.owner.release(Func::AwgOffset);
                Status::Idle
            }
            Next::Fail(e) => {
                self.offset = None;
                self.owner.release(Func::AwgOffset);
                Status::Error(e)
            }
        }
    }

    /// Stop the output and abandon any operation in progress.
    pub fn stop<A: Awg + ?Sized>(&mut self, awg: &mut A) {
        awg.stop();
        self.step = None;
        self.timer = None;
        self.offset = None;
        self.owner.reset();
    }

    fn fail(&mut self, e: Error) -> Status<AwgStep> {
        self.step = None;
        self.timer = None;
        self.offset = None;
        self.owner.reset();
        Status::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::testing::SimDac;

    #[derive(Default)]
    struct SimAwg {
        offset: SimDac,
        loaded: Option<(usize, TimerSetting)>,
        running: bool,
        stops: u32,
    }

    impl Awg for SimAwg {
        type Offset = SimDac;

        fn offset(&mut self) -> &mut SimDac {
            &mut self.offset
        }

        fn load(&mut self, samples: &[u16], timer: TimerSetting) {
            self.loaded = Some((samples.len(), timer));
        }

        fn start(&mut self) {
            self.running = true;
        }

        fn stop(&mut self) {
            self.running = false;
            self.stops += 1;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    const CAL: Calibration = Calibration {
        offset: 2048,
        numerator: 4096,
        denominator: 10_000,
    };

    fn at(ms: u32) -> Instant {
        Instant::from_ticks(ms)
    }

    #[test]
    fn run_sequence() {
        let mut ch = AwgChannel::new(CAL);
        let mut awg = SimAwg {
            running: true,
            ..Default::default()
        };
        let samples = [0u16, 1000, 2000, 3000];
        let wf = Waveform {
            samples: &samples,
            rate: 1_000_000_000,
            offset_mv: 500,
        };
        assert_eq!(
            ch.run(&mut awg, &wf, at(0)),
            Status::Step(AwgStep::OffsetSettle)
        );
        assert_eq!(awg.stops, 1);
        assert_eq!(awg.offset.writes, [2252]);
        assert_eq!(ch.owner().depth(), 1);
        // Offset still settling
        assert_eq!(
            ch.run(&mut awg, &wf, at(1)),
            Status::Step(AwgStep::OffsetSettle)
        );
        assert_eq!(ch.run(&mut awg, &wf, at(2)), Status::Step(AwgStep::Load));
        assert_eq!(ch.owner().depth(), 0);
        assert_eq!(ch.run(&mut awg, &wf, at(3)), Status::Step(AwgStep::Start));
        let (len, timer) = awg.loaded.unwrap();
        assert_eq!(len, 4);
        assert_eq!(timer.period, 100);
        assert!(!awg.running);
        assert_eq!(ch.run(&mut awg, &wf, at(4)), Status::Idle);
        assert!(awg.running);
        assert_eq!(ch.owner().active(), None);
    }

    #[test]
    fn exclusive_with_offset() {
        let mut ch = AwgChannel::new(CAL);
        let mut awg = SimAwg::default();
        let wf = Waveform {
            samples: &[1, 2],
            rate: 1_000_000_000,
            offset_mv: 0,
        };
        assert_eq!(
            ch.set_offset(&mut awg, 0, at(0)),
            Status::Step(AwgStep::OffsetSettle)
        );
        assert_eq!(ch.run(&mut awg, &wf, at(0)), Status::Waiting);
        assert_eq!(ch.set_offset(&mut awg, 0, at(2)), Status::Idle);
        assert_eq!(
            ch.run(&mut awg, &wf, at(2)),
            Status::Step(AwgStep::OffsetSettle)
        );
    }

    #[test]
    fn invalid_waveform() {
        let mut ch = AwgChannel::new(CAL);
        let mut awg = SimAwg::default();
        let wf = Waveform {
            samples: &[],
            rate: 1_000_000_000,
            offset_mv: 0,
        };
        assert_eq!(
            ch.run(&mut awg, &wf, at(0)),
            Status::Error(Error::InvalidParameter)
        );
        let wf = Waveform {
            samples: &[1],
            rate: 20_000_000_000,
            offset_mv: 0,
        };
        assert_eq!(
            ch.run(&mut awg, &wf, at(0)),
            Status::Error(Error::BufferIndex(
                buffer_index::Error::RateUnachievable
            ))
        );
        assert_eq!(ch.owner().active(), None);
    }

    #[test]
    fn offset_dac_timeout() {
        let mut ch = AwgChannel::new(CAL);
        let mut awg = SimAwg::default();
        awg.offset.busy = u32::MAX;
        let wf = Waveform {
            samples: &[1],
            rate: 1_000_000_000,
            offset_mv: 0,
        };
        assert_eq!(
            ch.run(&mut awg, &wf, at(0)),
            Status::Step(AwgStep::OffsetWrite)
        );
        assert_eq!(
            ch.run(&mut awg, &wf, at(100)),
            Status::Error(Error::HardwareTimeout)
        );
        assert_eq!(ch.owner().active(), None);
        assert_eq!(ch.owner().depth(), 0);
        ch.stop(&mut awg);
        assert_eq!(awg.stops, 1);
    }
}
