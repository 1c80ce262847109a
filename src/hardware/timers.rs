//! Sampling timer configuration
//!
//! Each sampling timer counts the peripheral clock divided by a power-of-two prescaler and
//! generates a DMA request every `period` counts. The period register is 16 bits wide.
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Largest timer period (the register holds `period - 1`).
pub const MAX_PERIOD: u32 = 1 << 16;

/// Prescalers of the sampling timers, by register encoding.
///
/// The hardware has no divide-by-128 setting, the encoding after 64 selects 256.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Prescaler {
    Div1 = 0b000,
    Div2 = 0b001,
    Div4 = 0b010,
    Div8 = 0b011,
    Div16 = 0b100,
    Div32 = 0b101,
    Div64 = 0b110,
    Div256 = 0b111,
}

impl Prescaler {
    /// All prescalers in ascending order of division.
    pub const ALL: [Self; 8] = [
        Self::Div1,
        Self::Div2,
        Self::Div4,
        Self::Div8,
        Self::Div16,
        Self::Div32,
        Self::Div64,
        Self::Div256,
    ];

    pub const fn divider(self) -> u32 {
        match self {
            Self::Div1 => 1,
            Self::Div2 => 2,
            Self::Div4 => 4,
            Self::Div8 => 8,
            Self::Div16 => 16,
            Self::Div32 => 32,
            Self::Div64 => 64,
            Self::Div256 => 256,
        }
    }
}

/// A sampling timer prescaler and period pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSetting {
    pub prescaler: Prescaler,
    /// Timer counts per sample, `1..=MAX_PERIOD`.
    pub period: u32,
}

impl TimerSetting {
    /// Find the finest timer setting for a sample rate.
    ///
    /// # Args
    /// * `clock` - The timer input clock in Hz.
    /// * `rate` - The requested rate in mSps.
    /// * `min_period` - The shortest period the converter supports.
    ///
    /// # Returns
    /// The setting with the smallest prescaler whose rounded period fits the period register,
    /// or `None` if the rate is zero, faster than `min_period` allows, or slower than the largest
    /// prescaler can reach.
    pub fn new(clock: u32, rate: u64, min_period: u32) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        let clock = clock as u128 * 1000;
        for prescaler in Prescaler::ALL {
            let div = prescaler.divider() as u128 * rate as u128;
            let period = (clock + div / 2) / div;
            if period > MAX_PERIOD as u128 {
                continue;
            }
            if period < min_period.max(1) as u128 {
                // Larger prescalers only shorten the period further.
                return None;
            }
            return Some(Self {
                prescaler,
                period: period as u32,
            });
        }
        None
    }

    /// The period register value.
    pub fn register(&self) -> u16 {
        (self.period - 1) as u16
    }

    /// Timer input clock cycles per sample.
    pub fn ticks(&self) -> u64 {
        self.prescaler.divider() as u64 * self.period as u64
    }

    /// The delivered sample rate in mSps.
    pub fn rate(&self, clock: u32) -> u64 {
        let ticks = self.ticks();
        (clock as u64 * 1000 + ticks / 2) / ticks
    }
}
