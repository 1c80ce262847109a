//! Capture settings
//!
//! The settings tree is exposed to the command layer through `miniconf`. Nothing in it is applied
//! until [Settings::arm] validates it into buffer indices and a trigger configuration.
use heapless::Vec;
use miniconf::Tree;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::buffer_index::{self, BufferIndex, ChannelConstants};
use crate::hardware::design_parameters::{LA, OSC};
use crate::hardware::Instrument;
use crate::state;
use crate::trigger::{self, Condition, Config, Source, Trigger};

/// Capture channels with their buffer placement.
pub type Targets = Vec<(Instrument, BufferIndex), { Instrument::COUNT }>;

/// Capture placement of one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct ChannelSettings {
    /// Sample rate in mSps (millisamples per second).
    pub rate: u64,

    /// Trigger delay in ps. Positive delays place the capture after the trigger.
    pub delay: i64,

    /// Number of samples to capture.
    pub length: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            rate: 1_000_000_000,
            delay: 0,
            length: 1000,
        }
    }
}

impl ChannelSettings {
    pub fn buffer_index(
        &self,
        channel: &ChannelConstants,
    ) -> Result<BufferIndex, buffer_index::Error> {
        BufferIndex::new(self.rate, self.delay, self.length, channel)
    }
}

/// Trigger edge selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    Rising,
    Falling,
    /// Either edge. Logic analyzer only.
    Change,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct TriggerSettings {
    /// Channel the trigger is taken from, `Force` to trigger by command.
    #[tree(with=miniconf::leaf)]
    pub source: Source,

    #[tree(with=miniconf::leaf)]
    pub edge: Edge,

    /// Lower analog hysteresis level in ADC codes.
    pub low: u16,

    /// Upper analog hysteresis level in ADC codes.
    pub high: u16,

    /// Logic analyzer lines taking part in the trigger.
    pub mask: u16,

    /// Channels captured, in the order oscilloscope 1, oscilloscope 2, logic analyzer.
    pub targets: [bool; Instrument::COUNT],
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            source: Source::Osc1,
            edge: Edge::Rising,
            low: 2000,
            high: 2100,
            mask: 1,
            targets: [true, false, false],
        }
    }
}

impl TriggerSettings {
    /// The trigger condition for the configured source.
    pub fn condition(&self) -> Result<Condition, trigger::Error> {
        let (low, high, mask) = (self.low, self.high, self.mask);
        let condition = match (self.source, self.edge) {
            (Source::LogicAnalyzer, Edge::Rising) => Condition::Edge {
                rising: mask,
                falling: 0,
            },
            (Source::LogicAnalyzer, Edge::Falling) => Condition::Edge {
                rising: 0,
                falling: mask,
            },
            (Source::LogicAnalyzer, Edge::Change) => Condition::Edge {
                rising: mask,
                falling: mask,
            },
            (_, Edge::Rising) => Condition::Rising { low, high },
            (_, Edge::Falling) => Condition::Falling { low, high },
            (_, Edge::Change) => return Err(trigger::Error::ConditionMismatch),
        };
        Ok(condition)
    }

    pub fn config(&self) -> Result<Config, trigger::Error> {
        Ok(Config {
            source: self.source,
            condition: self.condition()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct Settings {
    /// Oscilloscope channels.
    pub osc: [ChannelSettings; 2],

    /// Logic analyzer.
    pub la: ChannelSettings,

    pub trigger: TriggerSettings,
}

impl Settings {
    pub fn channel(&self, instrument: Instrument) -> &ChannelSettings {
        match instrument {
            Instrument::Osc1 => &self.osc[0],
            Instrument::Osc2 => &self.osc[1],
            Instrument::LogicAnalyzer => &self.la,
        }
    }

    /// The captured channels with their buffer placement.
    pub fn targets(&self) -> Result<Targets, buffer_index::Error> {
        let mut targets = Vec::new();
        for (instrument, _) in Instrument::iter()
            .zip(self.trigger.targets)
            .filter(|(_, enabled)| *enabled)
        {
            let constants = match instrument {
                Instrument::LogicAnalyzer => &LA,
                _ => &OSC,
            };
            let bidx = self.channel(instrument).buffer_index(constants)?;
            // At most one entry per instrument.
            targets.push((instrument, bidx)).ok();
        }
        Ok(targets)
    }

    /// Validate the settings and arm `trigger` with them.
    pub fn arm<const N: usize>(
        &self,
        trigger: &mut Trigger<N>,
    ) -> Result<(), state::Error> {
        let config = self.trigger.config()?;
        let targets = self.targets()?;
        trigger.arm(config, &targets)?;
        Ok(())
    }
}
