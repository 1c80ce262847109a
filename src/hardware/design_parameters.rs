use crate::buffer_index::ChannelConstants;
use fugit::MillisDurationU32;

/// The counting frequency of the sampling timers and the countdown timer.
pub const TIMER_FREQUENCY_HZ: u32 = 100_000_000;

/// The number of samples in each converter's circular DMA buffer.
pub const DMA_BUFFER_SIZE: u32 = 2048;

/// The part of the DMA buffer reserved for the backward trigger search and the stop latency.
pub const DMA_BUFFER_SLOP: u32 = 64;

/// Minimum sampling timer period of the scope converters (6.25 MSps).
pub const ADC_MIN_PERIOD: u32 = 16;

/// Minimum sampling timer period of the logic analyzer (10 MSps).
pub const LA_MIN_PERIOD: u32 = 10;

/// Minimum sampling timer period of the waveform generator DAC (10 MSps).
pub const AWG_MIN_PERIOD: u32 = 10;

/// Requested scope rates at or above this (in mSps) interleave both converters of a channel.
pub const ADC_INTERLEAVE_MSPS: u64 = 6_250_000_000;

/// Countdown timer ticks allowed for the final DMA transfers to land after the last sample.
// Two transfers of the slowest bus master at the timer clock.
pub const DMA_DRAIN_TICKS: u64 = 20;

/// Minimum distance of a freshly programmed countdown to the next rollover.
pub const ROLLOVER_MARGIN: u16 = 200;

/// Time for the DC output amplifier to settle after a DAC update.
pub const DC_SETTLE: MillisDurationU32 = MillisDurationU32::millis(5);

/// Time for the waveform generator offset DAC to settle.
pub const AWG_OFFSET_SETTLE: MillisDurationU32 = MillisDurationU32::millis(2);

/// Maximum time to wait for a DAC to accept a new code.
pub const DAC_READY_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(100);

/// Scope channel parameters.
pub const OSC: ChannelConstants = ChannelConstants {
    timer_clock_hz: TIMER_FREQUENCY_HZ,
    min_period: ADC_MIN_PERIOD,
    dma_len: DMA_BUFFER_SIZE,
    slop: DMA_BUFFER_SLOP,
    interleave_msps: Some(ADC_INTERLEAVE_MSPS),
};

/// Logic analyzer parameters.
pub const LA: ChannelConstants = ChannelConstants {
    timer_clock_hz: TIMER_FREQUENCY_HZ,
    min_period: LA_MIN_PERIOD,
    dma_len: DMA_BUFFER_SIZE,
    slop: DMA_BUFFER_SLOP,
    interleave_msps: None,
};
