//! Rate conversion from a monitor's native sampling rate to a target rate.
//!
//! Raw samples are appended to a pending buffer and leave it in contiguous
//! blocks; every block becomes one decimated measurement (the block mean).
//! Block sizes are integers and the fractional part of the rate ratio is
//! carried in an integer accumulator, so nothing drifts over long runs.
//!
//! Two block-sizing rules are supported:
//!
//! * [`DecimationMode::FixedWindow`]: every block holds `floor(Rn / Rt)`
//!   samples. Used for measurement windows, where each measurement must be
//!   the mean of an equal-sized block.
//! * [`DecimationMode::Exact`]: a generalized Bresenham walk. The block size
//!   alternates so that the number of emitted measurements tracks
//!   `consumed * Rt / Rn` exactly. Used for streaming output.

use core::fmt;
use std::collections::VecDeque;

use heapless::Deque;

/// Smallest target rate; a requested rate of zero is treated as this.
pub const MIN_TARGET_RATE_HZ: u32 = 1;

/// Block-sizing rule applied by a [`RateConverter`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DecimationMode {
    #[default]
    FixedWindow,
    Exact,
}

/// Accumulator bookkeeping exposed for diagnostics.
///
/// `pending_offset` is the fractional-tick carry. It always satisfies
/// `0 <= pending_offset < native_rate_hz`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AccumulatorState {
    pub native_rate_hz: u32,
    pub target_rate_hz: u32,
    pub pending_offset: u64,
}

/// Errors raised while constructing a [`RateConverter`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RateError {
    /// The monitor reported a native rate of zero.
    ZeroNativeRate,
}

impl fmt::Display for RateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateError::ZeroNativeRate => f.write_str("native sampling rate must be non-zero"),
        }
    }
}

impl std::error::Error for RateError {}

/// Stateful decimator from `native_rate_hz` to `target_rate_hz`.
#[derive(Clone, Debug)]
pub struct RateConverter {
    mode: DecimationMode,
    native_rate_hz: u32,
    target_rate_hz: u32,
    decimate_by: usize,
    offset: u64,
    pending: VecDeque<f64>,
}

impl RateConverter {
    /// Creates a converter.
    ///
    /// A target of zero is treated as [`MIN_TARGET_RATE_HZ`]. A target above
    /// the native rate is clamped to it: every raw sample becomes one output
    /// and nothing is interpolated.
    pub fn new(
        native_rate_hz: u32,
        target_rate_hz: u32,
        mode: DecimationMode,
    ) -> Result<Self, RateError> {
        if native_rate_hz == 0 {
            return Err(RateError::ZeroNativeRate);
        }

        let target_rate_hz = target_rate_hz.max(MIN_TARGET_RATE_HZ).min(native_rate_hz);
        let decimate_by = usize::try_from(native_rate_hz / target_rate_hz)
            .unwrap_or(usize::MAX)
            .max(1);

        Ok(Self {
            mode,
            native_rate_hz,
            target_rate_hz,
            decimate_by,
            offset: 0,
            pending: VecDeque::new(),
        })
    }

    /// Returns `true` when `target_rate_hz` would be clamped to the native rate.
    pub const fn exceeds_native(native_rate_hz: u32, target_rate_hz: u32) -> bool {
        target_rate_hz > native_rate_hz
    }

    /// Nominal raw samples per output tick, `floor(Rn / Rt)` (at least 1).
    pub const fn decimate_by(&self) -> usize {
        self.decimate_by
    }

    /// Block-sizing rule in use.
    pub const fn mode(&self) -> DecimationMode {
        self.mode
    }

    /// Current accumulator bookkeeping.
    pub const fn state(&self) -> AccumulatorState {
        AccumulatorState {
            native_rate_hz: self.native_rate_hz,
            target_rate_hz: self.target_rate_hz,
            pending_offset: self.offset,
        }
    }

    /// Raw samples buffered but not yet folded into a measurement.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Appends a batch of raw samples, preserving order.
    pub fn push(&mut self, batch: &[f64]) {
        self.pending.extend(batch.iter().copied());
    }

    /// Raw samples required for the next output tick.
    fn need(&self) -> usize {
        match self.mode {
            DecimationMode::FixedWindow => self.decimate_by,
            DecimationMode::Exact => {
                let native = u64::from(self.native_rate_hz);
                let target = u64::from(self.target_rate_hz);
                let need = (native - self.offset).div_ceil(target);
                usize::try_from(need).unwrap_or(usize::MAX)
            }
        }
    }

    fn advance(&mut self, consumed: usize) {
        let native = u64::from(self.native_rate_hz);
        let step = (consumed as u64).saturating_mul(u64::from(self.target_rate_hz));
        match self.mode {
            DecimationMode::FixedWindow => {
                self.offset = (self.offset + step % native) % native;
            }
            DecimationMode::Exact => {
                // `need` guarantees exactly one native cycle was crossed.
                self.offset = self.offset + step - native;
            }
        }
    }

    /// Emits the next measurement if enough raw samples are buffered.
    #[allow(clippy::cast_precision_loss)]
    pub fn next_measurement(&mut self) -> Option<f64> {
        let need = self.need();
        if self.pending.len() < need {
            return None;
        }

        let sum: f64 = self.pending.drain(..need).sum();
        self.advance(need);
        Some(sum / need as f64)
    }

    /// Lazily yields every measurement the buffered samples allow.
    pub fn ready(&mut self) -> Ready<'_> {
        Ready { converter: self }
    }
}

/// Iterator returned by [`RateConverter::ready`].
pub struct Ready<'a> {
    converter: &'a mut RateConverter,
}

impl Iterator for Ready<'_> {
    type Item = f64;

    fn next(&mut self) -> Option<Self::Item> {
        self.converter.next_measurement()
    }
}

/// Largest window supported by [`RollingAverage`].
pub const MAX_ROLLING_WINDOW: usize = 1024;

/// Mean over the most recent `window` values.
pub struct RollingAverage {
    window: usize,
    history: Deque<f64, MAX_ROLLING_WINDOW>,
}

impl RollingAverage {
    /// Creates an average over the last `window` values, clamped to
    /// `1..=MAX_ROLLING_WINDOW`.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.clamp(1, MAX_ROLLING_WINDOW),
            history: Deque::new(),
        }
    }

    /// Effective window length.
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Records `value` and returns the updated average.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: f64) -> f64 {
        while self.history.len() >= self.window {
            self.history.pop_back();
        }
        // Room was made above; the window never exceeds the capacity.
        let _ = self.history.push_front(value);

        let sum: f64 = self.history.iter().sum();
        sum / self.history.len() as f64
    }
}
