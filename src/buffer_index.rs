//! Capture buffer placement
//!
//! Every acquisition channel records continuously into a circular DMA buffer. Before a capture
//! is armed, [BufferIndex] decides the sampling timer setting for the requested rate and where
//! in the returned buffer the trigger and the point of interest (POI) end up for the requested
//! delay. The delay is positive when the POI comes after the trigger.
//!
//! Once the trigger is located at some physical index `T` of the circular buffer, logical sample
//! zero of the capture is at `(T + scroll) % dma_len`. The channel has to keep sampling for
//! `delay_ticks` countdown timer ticks after the trigger so that the last logical sample is in
//! the buffer.
use crate::hardware::design_parameters::DMA_DRAIN_TICKS;
use crate::hardware::TimerSetting;
use exact_math::{ps_from_samples, samples_from_ps};
use serde::Serialize;

/// Fixed properties of a channel's sampling hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConstants {
    /// Input clock of the sampling timer and the countdown timer.
    pub timer_clock_hz: u32,
    /// Shortest supported sampling timer period.
    pub min_period: u32,
    /// Physical samples in one converter's circular buffer.
    pub dma_len: u32,
    /// Buffer samples not handed out, reserved for trigger search and stop latency.
    pub slop: u32,
    /// Rate threshold in mSps for running two converters interleaved, if supported.
    pub interleave_msps: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Sample rate must be positive")]
    InvalidRate,
    #[error("Sample rate not achievable by the sampling timer")]
    RateUnachievable,
    #[error("Buffer length must be positive")]
    InvalidLength,
    #[error("Delay out of range")]
    DelayOutOfRange,
}

impl From<exact_math::Error> for Error {
    fn from(_: exact_math::Error) -> Self {
        Self::DelayOutOfRange
    }
}

/// Timing and buffer placement of one channel's capture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BufferIndex {
    pub requested_rate: u64,
    pub requested_delay: i64,
    pub requested_length: u32,

    /// Delivered sample rate in mSps.
    pub rate: u64,
    /// Delivered delay in ps, an integer number of samples at `rate`.
    pub delay: i64,
    pub delay_samples: i64,
    /// Returned buffer length after clamping to the usable buffer.
    pub length: u32,

    pub poi: Option<u32>,
    pub trigger: Option<u32>,

    pub timer: TimerSetting,
    pub interleave: bool,
    /// Modulus of the combined circular buffer (both converters when interleaved).
    pub dma_len: u32,
    pub slop: u32,

    pub scroll: u32,
    /// Samples that must be in the buffer before the trigger can be accepted.
    pub before_trigger: u32,
    /// Logical samples still to be acquired after the trigger sample.
    pub after_trigger: u64,
    /// Countdown timer ticks from the trigger until the channel can be halted.
    pub delay_ticks: u64,

    /// Converter DMA write pointer snapshotted at trigger time.
    pub dma_pointer: Option<u32>,
}

impl BufferIndex {
    /// Compute timer settings and placement.
    ///
    /// # Args
    /// * `rate` - Requested sample rate in mSps.
    /// * `delay` - Requested delay of the POI after the trigger in ps.
    /// * `length` - Requested number of samples returned.
    /// * `channel` - The channel's hardware constants.
    pub fn new(
        rate: u64,
        delay: i64,
        length: u32,
        channel: &ChannelConstants,
    ) -> Result<Self, Error> {
        if rate == 0 {
            return Err(Error::InvalidRate);
        }
        let interleave = channel.interleave_msps.is_some_and(|t| rate >= t);
        let converters = if interleave { 2 } else { 1 };
        let timer = TimerSetting::new(
            channel.timer_clock_hz,
            rate.div_ceil(converters),
            channel.min_period,
        )
        .ok_or(Error::RateUnachievable)?;
        let actual_rate = timer.rate(channel.timer_clock_hz) * converters;

        let delay_samples = samples_from_ps(actual_rate, delay)?;
        let actual_delay = ps_from_samples(actual_rate, delay_samples)?;

        let requested_length = length;
        let length = length.min(channel.dma_len.saturating_sub(channel.slop));
        if length == 0 {
            return Err(Error::InvalidLength);
        }
        let (poi, trigger) = place(length, delay_samples);

        let dma_len = channel.dma_len * converters as u32;
        // Logical trigger position, negative or beyond the buffer if the trigger is not in it.
        let virtual_trigger = match (trigger, poi) {
            (Some(t), _) => t as i64,
            (None, Some(p)) => (p as i64)
                .checked_sub(delay_samples)
                .ok_or(Error::DelayOutOfRange)?,
            (None, None) => return Err(Error::DelayOutOfRange),
        };
        let scroll = (dma_len as i64
            - virtual_trigger.rem_euclid(dma_len as i64))
            % dma_len as i64;

        let before_trigger =
            channel.slop / 2 + virtual_trigger.clamp(0, length as i64) as u32;
        let after_trigger = u64::try_from(length as i64 - 1 - virtual_trigger)
            .map_err(|_| Error::DelayOutOfRange)?;

        let mut bidx = Self {
            requested_rate: rate,
            requested_delay: delay,
            requested_length,
            rate: actual_rate,
            delay: actual_delay,
            delay_samples,
            length,
            poi,
            trigger,
            timer,
            interleave,
            dma_len,
            slop: channel.slop,
            scroll: scroll as u32,
            before_trigger,
            after_trigger,
            delay_ticks: 0,
            dma_pointer: None,
        };
        bidx.delay_ticks = bidx
            .ticks_for(after_trigger)
            .and_then(|t| t.checked_add(DMA_DRAIN_TICKS))
            .ok_or(Error::DelayOutOfRange)?
            .max(1);
        Ok(bidx)
    }

    /// The POI index, `-1` if it is not in the buffer.
    pub fn poi_raw(&self) -> i32 {
        self.poi.map_or(-1, |p| p as i32)
    }

    /// The trigger index, `-1` if it is not in the buffer.
    pub fn trigger_raw(&self) -> i32 {
        self.trigger.map_or(-1, |t| t as i32)
    }

    /// Countdown timer ticks per logical sample, rounded up when interleaved.
    pub fn ticks_per_sample(&self) -> u64 {
        if self.interleave {
            self.timer.ticks().div_ceil(2)
        } else {
            self.timer.ticks()
        }
    }

    /// Countdown timer ticks spanned by a number of logical samples.
    pub fn ticks_for(&self, samples: u64) -> Option<u64> {
        samples.checked_mul(self.ticks_per_sample())
    }

    /// Logical samples acquired in a number of countdown timer ticks, rounded to nearest.
    pub fn samples_in(&self, ticks: u64) -> u64 {
        let tps = self.ticks_per_sample();
        (ticks + tps / 2) / tps
    }

    /// Logical samples in the buffer after the first converter has written `written`.
    pub fn samples_available(&self, written: u64) -> u64 {
        if self.interleave {
            written * 2
        } else {
            written
        }
    }

    /// Backward trigger search distance in converter samples.
    pub fn search_window(&self) -> u32 {
        if self.interleave {
            self.slop / 2
        } else {
            self.slop
        }
    }

    /// The combined physical index of logical sample zero for a trigger at `trigger`.
    pub fn logical_start(&self, trigger: u32) -> u32 {
        ((trigger as u64 + self.scroll as u64) % self.dma_len as u64) as u32
    }

    /// Copy a capture out of the circular converter buffers.
    ///
    /// An interleaved combined index `c` is sample `c / 2` of converter `c % 2`.
    ///
    /// # Args
    /// * `buffers` - The converter buffers, one or two.
    /// * `start` - Combined physical index of logical sample zero, see [Self::logical_start].
    /// * `out` - Destination, filled up to the capture length.
    ///
    /// # Returns
    /// The number of samples copied.
    pub fn linearize(
        &self,
        buffers: &[&[u16]],
        start: u32,
        out: &mut [u16],
    ) -> usize {
        let mut copied = 0;
        for (i, dst) in out.iter_mut().take(self.length as usize).enumerate() {
            let c = (start as usize + i) % self.dma_len as usize;
            let sample = if self.interleave {
                buffers.get(c % 2).and_then(|b| b.get(c / 2))
            } else {
                buffers.first().and_then(|b| b.get(c))
            };
            let Some(sample) = sample else {
                break;
            };
            *dst = *sample;
            copied += 1;
        }
        copied
    }
}

/// POI and trigger indices for a buffer length and a delay in samples.
fn place(length: u32, delay: i64) -> (Option<u32>, Option<u32>) {
    let len = length as i64;
    let center = len / 2;
    if delay >= len {
        (Some(center as u32), None)
    } else if delay <= -len {
        (None, Some(length - 1))
    } else {
        let trigger = center - delay;
        // Shift both so the trigger sits at the boundary it overshot.
        let shift = if trigger < 0 {
            -trigger
        } else if trigger >= len {
            len - 1 - trigger
        } else {
            0
        };
        (
            Some((center + shift) as u32),
            Some((trigger + shift) as u32),
        )
    }
}
