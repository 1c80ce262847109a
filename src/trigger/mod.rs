//! Trigger engine
//!
//! # Design
//! All capture channels sample continuously into their circular buffers. Once each channel has
//! acquired enough samples ahead of its trigger position the trigger interrupt is enabled. The
//! interrupt fires some time after the actual crossing, so [Trigger::on_interrupt] first
//! snapshots every channel's DMA write pointer, then walks the source buffer backwards to the
//! crossing. The time elapsed since the crossing follows from the number of samples acquired after
//! it. Every channel is then scheduled to be halted by the countdown timer once it has recorded
//! the samples it needs after the trigger, with the elapsed time taken off.
//!
//! The control loop drives the capture through [Trigger::poll] and collects the [Capture]
//! results once all channels have stopped.
use heapless::Vec;
use num_enum::IntoPrimitive;
use serde::{Deserialize, Serialize};

use crate::buffer_index::BufferIndex;
use crate::hardware::{Board, Instrument};
use crate::state::{Origin, Status, Step};
use crate::timeout::{self, TimeoutTimer};

mod search;
pub use search::{search, search_interleaved, Condition, Found};

/// The trigger source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Osc1,
    Osc2,
    LogicAnalyzer,
    /// No hardware trigger. The capture is triggered by [Trigger::force].
    Force,
}

impl Source {
    pub fn instrument(&self) -> Option<Instrument> {
        match self {
            Self::Osc1 => Some(Instrument::Osc1),
            Self::Osc2 => Some(Instrument::Osc2),
            Self::LogicAnalyzer => Some(Instrument::LogicAnalyzer),
            Self::Force => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub source: Source,
    pub condition: Condition,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("A capture is in progress")]
    Busy,
    #[error("No capture channels")]
    NoTargets,
    #[error("Too many capture channels")]
    TooManyTargets,
    #[error("Channel listed twice")]
    DuplicateTarget,
    #[error("Trigger source is not captured")]
    SourceNotTargeted,
    #[error("Invalid trigger levels")]
    InvalidLevels,
    #[error("Condition does not match the source")]
    ConditionMismatch,
    #[error("Instrument not available")]
    UnknownInstrument,
    #[error("Scheduling: {0}")]
    Timeout(#[from] timeout::Error),
}

impl Error {
    pub fn code(&self) -> u16 {
        match self {
            Self::Busy => 1,
            Self::NoTargets => 2,
            Self::TooManyTargets => 3,
            Self::DuplicateTarget => 4,
            Self::SourceNotTargeted => 5,
            Self::InvalidLevels => 6,
            Self::ConditionMismatch => 7,
            Self::UnknownInstrument => 8,
            Self::Timeout(e) => 0x10 + *e as u16,
        }
    }
}

/// Capture lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum TriggerState {
    Idle = 0,
    /// Armed with a configuration, not acquiring.
    Configured = 1,
    /// Acquiring the samples needed ahead of the trigger.
    Filling = 2,
    /// Waiting for the trigger interrupt.
    Listening = 3,
    /// Triggered, waiting for the channels to be halted.
    Stopping = 4,
    Complete = 5,
}

impl Step for TriggerState {
    const ORIGIN: Origin = Origin::Trigger;
}

/// A channel taking part in the capture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub instrument: Instrument,
    pub bidx: BufferIndex,
    /// Physical (combined) index of the trigger sample.
    pub trigger: u32,
    /// Countdown ticks from the interrupt until the channel is halted.
    pub remaining_ticks: u64,
    pub degraded: bool,
}

/// Where a completed capture sits in a channel's circular buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub instrument: Instrument,
    /// Physical (combined) trigger index.
    pub trigger: u32,
    /// Physical (combined) index of logical sample zero.
    pub start: u32,
    /// Converter write pointer at the trigger interrupt.
    pub pointer: u32,
    /// The trigger crossing was not found and the interrupt time was used.
    pub degraded: bool,
}

/// Trigger and capture sequencing for up to `N` channels.
pub struct Trigger<const N: usize = 3> {
    config: Option<Config>,
    targets: Vec<Target, N>,
    captures: Vec<Capture, N>,
    state: TriggerState,
    fault: Option<Error>,
}

impl<const N: usize> Default for Trigger<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Trigger<N> {
    pub const fn new() -> Self {
        Self {
            config: None,
            targets: Vec::new(),
            captures: Vec::new(),
            state: TriggerState::Idle,
            fault: None,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Results of the last completed capture.
    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub fn capture(&self, instrument: Instrument) -> Option<&Capture> {
        self.captures.iter().find(|c| c.instrument == instrument)
    }

    /// Configure a capture.
    ///
    /// # Args
    /// * `config` - Source and condition.
    /// * `targets` - The channels to capture with their placement.
    pub fn arm(
        &mut self,
        config: Config,
        targets: &[(Instrument, BufferIndex)],
    ) -> Result<(), Error> {
        if matches!(
            self.state,
            TriggerState::Filling
                | TriggerState::Listening
                | TriggerState::Stopping
        ) {
            return Err(Error::Busy);
        }
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        if !config.condition.is_valid() {
            return Err(Error::InvalidLevels);
        }
        match config.source {
            Source::Osc1 | Source::Osc2 if !config.condition.is_analog() => {
                return Err(Error::ConditionMismatch)
            }
            Source::LogicAnalyzer if config.condition.is_analog() => {
                return Err(Error::ConditionMismatch)
            }
            _ => {}
        }

        let mut list: Vec<Target, N> = Vec::new();
        for (instrument, bidx) in targets.iter().copied() {
            if list.iter().any(|t| t.instrument == instrument) {
                return Err(Error::DuplicateTarget);
            }
            list.push(Target {
                instrument,
                bidx,
                trigger: 0,
                remaining_ticks: 0,
                degraded: false,
            })
            .map_err(|_| Error::TooManyTargets)?;
        }
        if let Some(source) = config.source.instrument() {
            if !list.iter().any(|t| t.instrument == source) {
                return Err(Error::SourceNotTargeted);
            }
        }

        self.config = Some(config);
        self.targets = list;
        self.captures.clear();
        self.fault = None;
        self.state = TriggerState::Configured;
        Ok(())
    }

    /// Start acquiring for a single capture.
    ///
    /// # Returns
    /// False if the trigger is already active or nothing is configured.
    pub fn single<B: Board + ?Sized>(&mut self, board: &mut B) -> bool {
        if board.is_listening()
            || !matches!(
                self.state,
                TriggerState::Configured | TriggerState::Complete
            )
            || self.config.is_none()
        {
            return false;
        }
        if self
            .targets
            .iter()
            .any(|t| board.acquisition(t.instrument).is_none())
        {
            self.fault = Some(Error::UnknownInstrument);
            return false;
        }
        for target in self.targets.iter_mut() {
            let Some(acq) = board.acquisition(target.instrument) else {
                continue;
            };
            target.bidx.dma_pointer = None;
            target.degraded = false;
            acq.configure(target.bidx.timer, target.bidx.interleave);
            acq.start();
        }
        self.captures.clear();
        self.state = TriggerState::Filling;
        true
    }

    /// Advance the capture from the control loop.
    pub fn poll<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
    ) -> Status<TriggerState> {
        if let Some(fault) = self.fault.take() {
            return Status::Error(fault.into());
        }
        match self.state {
            TriggerState::Idle | TriggerState::Complete => Status::Idle,
            TriggerState::Filling => {
                let mut filled = true;
                for target in self.targets.iter() {
                    let Some(acq) = board.acquisition(target.instrument) else {
                        self.state = TriggerState::Idle;
                        return Status::Error(Error::UnknownInstrument.into());
                    };
                    let available =
                        target.bidx.samples_available(acq.samples_written());
                    filled &= available >= target.bidx.before_trigger as u64;
                }
                if filled {
                    if let Some(Config { source, condition }) = self.config {
                        if source.instrument().is_some() {
                            board.listen(source, condition);
                        }
                    }
                    self.state = TriggerState::Listening;
                }
                Status::Step(self.state)
            }
            TriggerState::Stopping => {
                let mut stopped = true;
                for target in self.targets.iter() {
                    stopped &= board
                        .acquisition(target.instrument)
                        .map_or(true, |acq| !acq.is_running());
                }
                if !stopped {
                    return Status::Step(self.state);
                }
                self.captures.clear();
                for target in self.targets.iter() {
                    if target.degraded {
                        log::warn!(
                            "{:?}: crossing not found, using interrupt time",
                            target.instrument
                        );
                    }
                    self.captures
                        .push(Capture {
                            instrument: target.instrument,
                            trigger: target.trigger,
                            start: target.bidx.logical_start(target.trigger),
                            pointer: target.bidx.dma_pointer.unwrap_or(0),
                            degraded: target.degraded,
                        })
                        .ok();
                }
                self.state = TriggerState::Complete;
                Status::Idle
            }
            state => Status::Step(state),
        }
    }

    /// Trigger interrupt handler.
    pub fn on_interrupt<B: Board + ?Sized, const M: usize>(
        &mut self,
        board: &mut B,
        timeouts: &TimeoutTimer<M>,
    ) {
        if self.state != TriggerState::Listening {
            board.unlisten();
            return;
        }
        if self.snapshot(board) {
            board.unlisten();
            self.schedule(board, timeouts, true);
        } else {
            self.abort(board, timeouts);
        }
    }

    /// Trigger now.
    ///
    /// # Returns
    /// False unless waiting for the trigger.
    pub fn force<B: Board + ?Sized, const M: usize>(
        &mut self,
        board: &mut B,
        timeouts: &TimeoutTimer<M>,
    ) -> bool {
        if self.state != TriggerState::Listening {
            return false;
        }
        if !self.snapshot(board) {
            self.abort(board, timeouts);
            return false;
        }
        board.unlisten();
        self.schedule(board, timeouts, false);
        true
    }

    /// Stop listening and halt every channel.
    pub fn abort<B: Board + ?Sized, const M: usize>(
        &mut self,
        board: &mut B,
        timeouts: &TimeoutTimer<M>,
    ) {
        board.unlisten();
        timeouts.abort(board);
        for target in self.targets.iter() {
            if let Some(acq) = board.acquisition(target.instrument) {
                acq.stop();
            }
        }
        self.state = TriggerState::Idle;
    }

    fn snapshot<B: Board + ?Sized>(&mut self, board: &mut B) -> bool {
        for target in self.targets.iter_mut() {
            let Some(acq) = board.acquisition(target.instrument) else {
                self.fault = Some(Error::UnknownInstrument);
                return false;
            };
            target.bidx.dma_pointer = Some(acq.write_pointer() as u32);
        }
        true
    }

    /// Locate the trigger in every channel and hand the halt schedule to the countdown timer.
    fn schedule<B: Board + ?Sized, const M: usize>(
        &mut self,
        board: &mut B,
        timeouts: &TimeoutTimer<M>,
        locate: bool,
    ) {
        let source = self
            .config
            .filter(|_| locate)
            .and_then(|c| c.source.instrument().map(|i| (i, c.condition)));

        // Countdown ticks since the trigger.
        let mut elapsed = 0;
        for target in self.targets.iter_mut() {
            let latest = latest(&target.bidx);
            target.trigger = latest;
            target.degraded = false;
            let Some((instrument, condition)) = source else {
                continue;
            };
            if target.instrument != instrument {
                continue;
            }
            let Some(acq) = board.acquisition(instrument) else {
                self.fault = Some(Error::UnknownInstrument);
                continue;
            };
            let pointer = target.bidx.dma_pointer.unwrap_or(0) as usize;
            let window = target.bidx.search_window();
            let found = if target.bidx.interleave {
                search_interleaved(
                    acq.buffer(0),
                    acq.buffer(1),
                    pointer,
                    window,
                    &condition,
                )
            } else {
                search(acq.buffer(0), pointer, window, &condition)
            };
            if let Some(found) = found {
                target.trigger = found.index;
                target.degraded = found.degraded;
                // Interleaved distances are in samples of both converters.
                elapsed =
                    target.bidx.ticks_for(found.distance as u64).unwrap_or(0);
            }
        }
        if self.fault.is_some() {
            self.abort(board, timeouts);
            return;
        }

        for target in self.targets.iter_mut() {
            if source.map_or(true, |(i, _)| i != target.instrument) {
                let len = target.bidx.dma_len as u64;
                let back = target.bidx.samples_in(elapsed) % len;
                target.trigger =
                    ((target.trigger as u64 + len - back) % len) as u32;
            }
            target.remaining_ticks =
                target.bidx.delay_ticks.saturating_sub(elapsed).max(1);
        }
        self.targets.sort_unstable_by_key(|t| t.remaining_ticks);

        for target in self.targets.iter() {
            if let Err(e) =
                timeouts.add(board, target.instrument, target.remaining_ticks)
            {
                self.fault = Some(e.into());
                self.abort(board, timeouts);
                return;
            }
        }
        timeouts.start(board);
        self.state = TriggerState::Stopping;
    }
}

/// Physical (combined) index of the latest sample at the snapshotted write pointer.
fn latest(bidx: &BufferIndex) -> u32 {
    let pointer = bidx.dma_pointer.unwrap_or(0);
    if bidx.interleave {
        let len = bidx.dma_len / 2;
        2 * ((pointer % len + len - 1) % len)
    } else {
        let len = bidx.dma_len;
        (pointer % len + len - 1) % len
    }
}
