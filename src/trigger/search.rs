use serde::{Deserialize, Serialize};

/// A trigger condition on consecutive samples.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Analog crossing from below `low` to at least `high`.
    Rising { low: u16, high: u16 },
    /// Analog crossing from above `high` to at most `low`.
    Falling { low: u16, high: u16 },
    /// Digital change, rising in any bit of `rising` or falling in any bit of `falling`.
    Edge { rising: u16, falling: u16 },
}

impl Condition {
    /// Whether the condition triggers between `earlier` and the following sample `later`.
    pub fn crossed(&self, earlier: u16, later: u16) -> bool {
        match *self {
            Self::Rising { low, high } => earlier < low && later >= high,
            Self::Falling { low, high } => earlier > high && later <= low,
            Self::Edge { rising, falling } => {
                (earlier ^ later) & ((later & rising) | (!later & falling)) != 0
            }
        }
    }

    /// Whether a sample is already past an analog threshold.
    ///
    /// Always false for [Condition::Edge].
    pub fn reached(&self, sample: u16) -> bool {
        match *self {
            Self::Rising { high, .. } => sample >= high,
            Self::Falling { low, .. } => sample <= low,
            Self::Edge { .. } => false,
        }
    }

    pub fn is_analog(&self) -> bool {
        !matches!(self, Self::Edge { .. })
    }

    /// Hysteresis ordered and at least one edge bit.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Rising { low, high } | Self::Falling { low, high } => {
                low <= high
            }
            Self::Edge { rising, falling } => rising | falling != 0,
        }
    }
}

/// A located trigger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Found {
    /// Physical buffer index of the first sample past the trigger.
    pub index: u32,
    /// Samples acquired after that sample, up to the write pointer.
    pub distance: u32,
    /// No crossing was found, the latest sample stands in for it.
    pub degraded: bool,
}

/// Search backwards from the write pointer for the most recent crossing.
///
/// # Args
/// * `buf` - The circular buffer.
/// * `pointer` - The index the DMA engine writes next.
/// * `window` - Number of sample pairs to examine.
/// * `condition` - The trigger condition.
///
/// # Returns
/// The crossing, or the latest sample marked degraded if there is none within the window.
/// `None` for an empty buffer.
pub fn search(
    buf: &[u16],
    pointer: usize,
    window: u32,
    condition: &Condition,
) -> Option<Found> {
    let len = buf.len();
    if len == 0 {
        return None;
    }
    let latest = (pointer % len + len - 1) % len;
    for distance in 0..(window as usize).min(len - 1) {
        let later = (latest + len - distance) % len;
        let earlier = (later + len - 1) % len;
        if condition.crossed(buf[earlier], buf[later]) {
            return Some(Found {
                index: later as u32,
                distance: distance as u32,
                degraded: false,
            });
        }
    }
    Some(Found {
        index: latest as u32,
        distance: 0,
        degraded: true,
    })
}

/// Search an interleaved pair of converter buffers.
///
/// The crossing is located in the primary converter's samples. The secondary converter sample
/// acquired in between decides whether the combined index is the primary sample `2k` or the
/// secondary sample `2k - 1` before it.
///
/// # Returns
/// [Found] with combined indices and distance.
pub fn search_interleaved(
    primary: &[u16],
    secondary: &[u16],
    pointer: usize,
    window: u32,
    condition: &Condition,
) -> Option<Found> {
    let found = search(primary, pointer, window, condition)?;
    let mut index = 2 * found.index;
    let mut distance = 2 * found.distance;
    if !found.degraded {
        let len = primary.len() as u32;
        let k = (found.index + len - 1) % len;
        if secondary
            .get(k as usize)
            .is_some_and(|s| condition.reached(*s))
        {
            index = (index + 2 * len - 1) % (2 * len);
            distance += 1;
        }
    }
    Some(Found {
        index,
        distance,
        degraded: found.degraded,
    })
}
