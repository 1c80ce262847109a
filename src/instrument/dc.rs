//! DC output voltage
use num_enum::IntoPrimitive;

use super::{Calibration, Dac, DacWrite, Func, Instant, Phase};
use crate::hardware::design_parameters::{DAC_READY_TIMEOUT, DC_SETTLE};
use crate::state::{Next, Origin, Ownership, Status, Step};

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum DcStep {
    Write = 1,
    Settle = 2,
}

impl Step for DcStep {
    const ORIGIN: Origin = Origin::Dc;
}

impl From<Phase> for DcStep {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Write => Self::Write,
            Phase::Settle => Self::Settle,
        }
    }
}

/// One calibrated DC output.
#[derive(Copy, Clone, Debug)]
pub struct DcOutput {
    pub calibration: Calibration,
    owner: Ownership<Func>,
    /// Requested voltage and its write in progress.
    update: Option<(i32, DacWrite)>,
    millivolts: Option<i32>,
}

impl DcOutput {
    pub const fn new(calibration: Calibration) -> Self {
        Self {
            calibration,
            owner: Ownership::new(),
            update: None,
            millivolts: None,
        }
    }

    /// The last voltage that settled.
    pub fn millivolts(&self) -> Option<i32> {
        self.millivolts
    }

    pub fn owner(&mut self) -> &mut Ownership<Func> {
        &mut self.owner
    }

    /// Set the output voltage.
    ///
    /// The voltage is taken on the first call, later calls continue that update until it
    /// returns [Status::Idle].
    pub fn set_voltage<D: Dac + ?Sized>(
        &mut self,
        dac: &mut D,
        mv: i32,
        now: Instant,
    ) -> Status<DcStep> {
        if !self.owner.claim(Func::DcSet) {
            return Status::Waiting;
        }
        if self.update.is_none() {
            match self.calibration.code(mv) {
                Ok(code) => self.update = Some((mv, DacWrite::new(code, now))),
                Err(e) => {
                    self.owner.release(Func::DcSet);
                    return Status::Error(e);
                }
            }
        }
        let Some((requested, update)) = self.update.as_mut() else {
            return Status::Idle;
        };
        match update.poll(dac, now, DC_SETTLE, DAC_READY_TIMEOUT) {
            Next::Stay => Status::Step(update.phase.into()),
            Next::Go(phase) => Status::Step(phase.into()),
            Next::Done => {
                self.millivolts = Some(*requested);
                self.update = None;
                self.owner.release(Func::DcSet);
                Status::Idle
            }
            Next::Fail(e) => {
                self.update = None;
                self.owner.release(Func::DcSet);
                Status::Error(e)
            }
        }
    }
}
