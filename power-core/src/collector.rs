//! Fault-tolerant collection of decimated measurements.
//!
//! A [`RetryingCollector`] owns a [`PowerMonitor`] handle and keeps pulling
//! raw batches through a [`RateConverter`] until the requested number of
//! measurements exists. Monitors occasionally stall and return nothing after
//! a passthrough toggle; each empty pull counts against a budget and triggers
//! a collection restart after a short backoff. Any non-empty pull refills the
//! budget.

use core::fmt;
use core::time::Duration;

use tracing::{debug, trace, warn};

use crate::monitor::{Delay, PowerMonitor};
use crate::rate::{DecimationMode, RateConverter, RateError};

/// Consecutive empty pulls tolerated before giving up.
pub const MAX_EMPTY_PULLS: u32 = 5;
/// Pause before restarting collection after an empty pull.
pub const EMPTY_PULL_BACKOFF: Duration = Duration::from_secs(1);

/// Retry budget for stalled monitors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_empty_pulls: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_empty_pulls: MAX_EMPTY_PULLS,
            backoff: EMPTY_PULL_BACKOFF,
        }
    }
}

/// Errors surfaced by [`RetryingCollector::collect`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CollectError {
    /// A collection of zero measurements was requested.
    ZeroCount,
    /// The collector was built with a native rate of zero.
    InvalidNativeRate,
    /// The retry budget ran out before enough measurements were produced.
    InsufficientData { requested: usize, collected: usize },
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::ZeroCount => f.write_str("requested zero measurements"),
            CollectError::InvalidNativeRate => f.write_str("monitor native rate is zero"),
            CollectError::InsufficientData {
                requested,
                collected,
            } => write!(
                f,
                "power monitor stopped delivering data: collected {collected} of {requested} measurements"
            ),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<RateError> for CollectError {
    fn from(error: RateError) -> Self {
        match error {
            RateError::ZeroNativeRate => CollectError::InvalidNativeRate,
        }
    }
}

/// Stops the monitor's collection when dropped, so every exit path out of a
/// collection (success, exhaustion, panic) leaves the monitor idle.
struct CollectionSession<'a, M: PowerMonitor + ?Sized> {
    monitor: &'a mut M,
}

impl<'a, M: PowerMonitor + ?Sized> CollectionSession<'a, M> {
    fn start(monitor: &'a mut M) -> Self {
        monitor.start_collection();
        Self { monitor }
    }

    fn restart(&mut self) {
        self.monitor.stop_collection();
        self.monitor.start_collection();
    }

    fn pull(&mut self) -> Option<Vec<f64>> {
        self.monitor.collect()
    }
}

impl<M: PowerMonitor + ?Sized> Drop for CollectionSession<'_, M> {
    fn drop(&mut self) {
        self.monitor.stop_collection();
    }
}

/// Pulls raw batches from a monitor and returns decimated measurements.
pub struct RetryingCollector<M, D> {
    monitor: M,
    delay: D,
    native_rate_hz: u32,
    policy: RetryPolicy,
    mode: DecimationMode,
}

impl<M, D> RetryingCollector<M, D>
where
    M: PowerMonitor,
    D: Delay,
{
    /// Creates a collector with the default retry policy and fixed-window
    /// decimation.
    pub fn new(monitor: M, delay: D, native_rate_hz: u32) -> Self {
        Self::with_policy(monitor, delay, native_rate_hz, RetryPolicy::default())
    }

    /// Creates a collector with an explicit retry policy.
    pub fn with_policy(monitor: M, delay: D, native_rate_hz: u32, policy: RetryPolicy) -> Self {
        Self {
            monitor,
            delay,
            native_rate_hz,
            policy,
            mode: DecimationMode::FixedWindow,
        }
    }

    /// Switches the decimation rule used by subsequent collections.
    #[must_use]
    pub fn with_mode(mut self, mode: DecimationMode) -> Self {
        self.mode = mode;
        self
    }

    pub const fn native_rate_hz(&self) -> u32 {
        self.native_rate_hz
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn monitor_mut(&mut self) -> &mut M {
        &mut self.monitor
    }

    pub fn delay_mut(&mut self) -> &mut D {
        &mut self.delay
    }

    /// Borrows the monitor and delay together.
    pub fn parts_mut(&mut self) -> (&mut M, &mut D) {
        (&mut self.monitor, &mut self.delay)
    }

    /// Releases the monitor and delay.
    pub fn into_parts(self) -> (M, D) {
        (self.monitor, self.delay)
    }

    /// Collects exactly `count` measurements at `rate_hz`.
    pub fn collect(&mut self, count: usize, rate_hz: u32) -> Result<Vec<f64>, CollectError> {
        self.collect_with(count, rate_hz, |_, _| {})
    }

    /// Collects exactly `count` measurements at `rate_hz`, reporting each one
    /// as `(index, value)` as soon as it is produced.
    ///
    /// Measurements produced beyond `count` by the final batch are discarded.
    /// The monitor's collection is always stopped before returning.
    pub fn collect_with<F>(
        &mut self,
        count: usize,
        rate_hz: u32,
        mut on_measurement: F,
    ) -> Result<Vec<f64>, CollectError>
    where
        F: FnMut(usize, f64),
    {
        if count == 0 {
            return Err(CollectError::ZeroCount);
        }
        if RateConverter::exceeds_native(self.native_rate_hz, rate_hz) {
            warn!(
                requested = rate_hz,
                native = self.native_rate_hz,
                "sample rate above native rate, measurements are raw samples"
            );
        }

        let mut converter = RateConverter::new(self.native_rate_hz, rate_hz, self.mode)?;
        let mut measurements = Vec::with_capacity(count);
        let mut empty_pulls = 0_u32;
        let policy = self.policy;
        let delay = &mut self.delay;
        let mut session = CollectionSession::start(&mut self.monitor);

        while measurements.len() < count && empty_pulls < policy.max_empty_pulls {
            if empty_pulls > 0 {
                delay.sleep(policy.backoff);
                debug!(empty_pulls, "restarting stalled collection");
                session.restart();
            }

            match session.pull() {
                Some(batch) if !batch.is_empty() => {
                    empty_pulls = 0;
                    trace!(len = batch.len(), "raw batch");
                    converter.push(&batch);
                    for value in converter.ready() {
                        if measurements.len() == count {
                            break;
                        }
                        on_measurement(measurements.len(), value);
                        measurements.push(value);
                    }
                }
                _ => empty_pulls += 1,
            }
        }
        drop(session);

        if measurements.len() < count {
            warn!(
                requested = count,
                collected = measurements.len(),
                "power monitor stopped delivering data"
            );
            return Err(CollectError::InsufficientData {
                requested: count,
                collected: measurements.len(),
            });
        }

        Ok(measurements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MonitorStatus, UsbPassthrough};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedMonitor {
        pulls: VecDeque<Option<Vec<f64>>>,
        pull_count: usize,
        starts: usize,
        stops: usize,
    }

    impl ScriptedMonitor {
        fn new(pulls: impl IntoIterator<Item = Option<Vec<f64>>>) -> Self {
            Self {
                pulls: pulls.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl PowerMonitor for ScriptedMonitor {
        fn start_collection(&mut self) {
            self.starts += 1;
        }

        fn stop_collection(&mut self) {
            self.stops += 1;
        }

        fn collect(&mut self) -> Option<Vec<f64>> {
            self.pull_count += 1;
            self.pulls.pop_front().flatten()
        }

        fn status(&mut self) -> Option<MonitorStatus> {
            Some(MonitorStatus::new(0.1))
        }

        fn set_usb_passthrough(&mut self, _: UsbPassthrough) {}

        fn set_voltage(&mut self, _: f64) {}

        fn set_max_current(&mut self, _: f64) {}

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct Sleeps(Vec<Duration>);

    impl Delay for Sleeps {
        fn sleep(&mut self, duration: Duration) {
            self.0.push(duration);
        }
    }

    #[test]
    fn collects_requested_count_and_discards_surplus() {
        let monitor = ScriptedMonitor::new([Some(vec![0.5; 30])]);
        let mut collector = RetryingCollector::new(monitor, Sleeps::default(), 100);

        let measurements = collector.collect(25, 100).unwrap();

        assert_eq!(measurements.len(), 25);
        assert!(measurements.iter().all(|value| (value - 0.5).abs() < 1e-12));
        let (monitor, sleeps) = collector.into_parts();
        assert_eq!(monitor.starts, 1);
        assert_eq!(monitor.stops, 1);
        assert!(sleeps.0.is_empty());
    }

    #[test]
    fn non_empty_pull_refills_the_budget() {
        let monitor = ScriptedMonitor::new([
            None,
            None,
            None,
            None,
            Some(vec![1.0; 10]),
        ]);
        let mut collector = RetryingCollector::new(monitor, Sleeps::default(), 1000);

        let measurements = collector.collect(1, 100).unwrap();

        assert_eq!(measurements, [1.0]);
        let (monitor, sleeps) = collector.into_parts();
        assert_eq!(monitor.pull_count, 5);
        assert_eq!(sleeps.0, [EMPTY_PULL_BACKOFF; 4]);
        // One stop per restart plus the final stop.
        assert_eq!(monitor.stops, 5);
    }

    #[test]
    fn gives_up_after_consecutive_empty_pulls() {
        let monitor = ScriptedMonitor::new([
            None,
            None,
            Some(vec![0.2]),
            None,
            Some(Vec::new()),
            None,
            None,
            None,
        ]);
        let mut collector = RetryingCollector::new(monitor, Sleeps::default(), 100);

        let error = collector.collect(10, 100).unwrap_err();

        assert_eq!(
            error,
            CollectError::InsufficientData {
                requested: 10,
                collected: 1,
            }
        );
        let (monitor, sleeps) = collector.into_parts();
        assert_eq!(monitor.pull_count, 8);
        assert_eq!(sleeps.0.len(), 6);
        assert_eq!(monitor.stops, monitor.starts);
    }

    #[test]
    fn reports_each_measurement_in_order() {
        let monitor = ScriptedMonitor::new([Some(vec![1.0, 3.0]), Some(vec![5.0, 7.0])]);
        let mut collector = RetryingCollector::new(monitor, Sleeps::default(), 200);
        let mut seen = Vec::new();

        collector
            .collect_with(2, 100, |index, value| seen.push((index, value)))
            .unwrap();

        assert_eq!(seen, [(0, 2.0), (1, 6.0)]);
    }

    #[test]
    fn zero_count_is_rejected_without_touching_the_monitor() {
        let mut collector = RetryingCollector::new(ScriptedMonitor::default(), Sleeps::default(), 100);

        assert_eq!(collector.collect(0, 100), Err(CollectError::ZeroCount));
        assert_eq!(collector.monitor_mut().starts, 0);
    }

    #[test]
    fn zero_native_rate_is_rejected() {
        let mut collector = RetryingCollector::new(ScriptedMonitor::default(), Sleeps::default(), 0);

        assert_eq!(collector.collect(1, 100), Err(CollectError::InvalidNativeRate));
    }
}
