//! Hardware abstraction of the acquisition core
//!
//! The core never touches registers directly. Timers, DMA channels, comparators and change
//! notice logic are reached through the traits below, implemented by the board support for the
//! real microcontroller and by simulations in the tests.
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter};

use crate::trigger::{Condition, Source};

pub mod design_parameters;
pub mod timers;

#[cfg(test)]
pub mod sim;

pub use timers::{Prescaler, TimerSetting};

/// Acquisition instruments whose capture can be stopped by the countdown timer.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    EnumCount,
    Serialize,
    Deserialize,
)]
pub enum Instrument {
    Osc1,
    Osc2,
    LogicAnalyzer,
}

/// The shared 16-bit countdown timer.
///
/// The timer counts up at the timer clock and raises its rollover interrupt when it wraps from
/// `0xffff` to zero. Scheduling a rollover `n` ticks ahead is done by writing `0x10000 - n`.
pub trait CountdownTimer {
    /// The current count.
    fn counter(&self) -> u16;

    /// Overwrite the count.
    fn set_counter(&mut self, count: u16);

    /// Whether a rollover interrupt is pending but not yet serviced.
    fn rollover_pending(&self) -> bool;

    /// Acknowledge the rollover interrupt.
    fn clear_rollover(&mut self);

    /// Start counting and enable the rollover interrupt.
    fn enable(&mut self);

    /// Stop counting and disable the rollover interrupt.
    fn disable(&mut self);
}

/// The action taken when an instrument's deadline expires.
pub trait Halt {
    /// Stop the sampling timer and DMA transfer of an instrument.
    fn halt(&mut self, instrument: Instrument);
}

/// A sampling timer and the DMA channel(s) filling an instrument's circular buffer.
pub trait Acquisition {
    /// Load the sampling timer. Interleaving runs both converters at opposite phase.
    fn configure(&mut self, setting: TimerSetting, interleave: bool);

    /// Enable the DMA transfer and start the sampling timer.
    fn start(&mut self);

    /// Stop the sampling timer and disable the transfer.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// The index in the converter buffer the DMA engine writes next.
    fn write_pointer(&self) -> usize;

    /// Samples written into the first converter buffer since the last start.
    fn samples_written(&self) -> u64;

    /// A converter's circular buffer. Converter 1 only exists while interleaving.
    fn buffer(&self, converter: usize) -> &[u16];
}

/// Comparator and change notice trigger inputs.
pub trait TriggerInput {
    /// Program the trigger hardware and enable its interrupt.
    fn listen(&mut self, source: Source, condition: Condition);

    /// Disable the trigger interrupt and the comparator / change notice logic.
    fn unlisten(&mut self);

    fn is_listening(&self) -> bool;
}

/// Everything the trigger engine drives.
pub trait Board: CountdownTimer + Halt + TriggerInput {
    fn acquisition(
        &mut self,
        instrument: Instrument,
    ) -> Option<&mut dyn Acquisition>;
}
