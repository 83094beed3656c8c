//! Detection of the DUT's quiescent (screen off, processor suspended) state.

use core::fmt;
use core::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::{CollectError, RetryingCollector};
use crate::evaluate::mean;
use crate::monitor::{Delay, PowerMonitor};

/// Consecutive low-power measurements required to declare suspend.
pub const SUSPEND_WINDOW: usize = 100;
/// Current below which a measurement counts as low power.
pub const LOW_POWER_THRESHOLD_AMPS: f64 = 0.060;
/// Windows examined before giving up.
pub const MAX_SUSPEND_ATTEMPTS: u32 = 30;
/// Nominal rate at which detection windows are sampled.
pub const SUSPEND_SAMPLE_RATE_HZ: u32 = 100;
/// Settle time added after a successful detection.
pub const SUSPEND_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Fixed wait used instead of detection in strict-delay mode. One second
/// longer than the DUT's screen-off timeout.
pub const STRICT_SUSPEND_DELAY: Duration = Duration::from_secs(30);

/// Tunables for measurement based detection.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeasuredSuspend {
    pub window: usize,
    pub threshold_amps: f64,
    pub max_attempts: u32,
    pub rate_hz: u32,
    pub settle_delay: Duration,
}

impl Default for MeasuredSuspend {
    fn default() -> Self {
        Self {
            window: SUSPEND_WINDOW,
            threshold_amps: LOW_POWER_THRESHOLD_AMPS,
            max_attempts: MAX_SUSPEND_ATTEMPTS,
            rate_hz: SUSPEND_SAMPLE_RATE_HZ,
            settle_delay: SUSPEND_SETTLE_DELAY,
        }
    }
}

/// How the harness decides the DUT has suspended.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SuspendStrategy {
    /// Sample windows until one is entirely below the low-power threshold.
    Measured(MeasuredSuspend),
    /// Sleep for a fixed duration without measuring.
    FixedDelay(Duration),
}

impl SuspendStrategy {
    /// Strategy selected by the strict-delay configuration switch.
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::FixedDelay(STRICT_SUSPEND_DELAY)
        } else {
            Self::Measured(MeasuredSuspend::default())
        }
    }
}

impl Default for SuspendStrategy {
    fn default() -> Self {
        Self::Measured(MeasuredSuspend::default())
    }
}

/// Outcome of a successful wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SuspendReport {
    /// Windows sampled before detection; zero for the fixed-delay strategy.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SuspendError {
    /// No window qualified within the attempt budget.
    Timeout {
        attempts: u32,
        last_average_amps: f64,
    },
    /// A detection window could not be collected.
    Collect(CollectError),
}

impl fmt::Display for SuspendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendError::Timeout {
                attempts,
                last_average_amps,
            } => write!(
                f,
                "Unable to determine application processor suspend mode status after {attempts} windows (last average {:.2} mA)",
                last_average_amps * 1000.0
            ),
            SuspendError::Collect(error) => write!(f, "suspend detection failed: {error}"),
        }
    }
}

impl std::error::Error for SuspendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuspendError::Collect(error) => Some(error),
            SuspendError::Timeout { .. } => None,
        }
    }
}

impl From<CollectError> for SuspendError {
    fn from(error: CollectError) -> Self {
        SuspendError::Collect(error)
    }
}

/// Returns `true` when `window` holds at least `required` values and every
/// one of them is strictly below `threshold`.
pub fn window_is_quiescent(window: &[f64], required: usize, threshold: f64) -> bool {
    window.len() >= required && window.iter().filter(|value| **value < threshold).count() >= required
}

/// Blocks until the DUT is judged suspended.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SuspendDetector {
    strategy: SuspendStrategy,
}

impl SuspendDetector {
    pub const fn new(strategy: SuspendStrategy) -> Self {
        Self { strategy }
    }

    pub const fn strategy(&self) -> SuspendStrategy {
        self.strategy
    }

    /// Waits for suspend using `collector` for measurements and its delay for
    /// sleeps. `progress` receives `(attempt, average_amps)` after every
    /// window that did not qualify.
    pub fn wait<M, D, F>(
        &self,
        collector: &mut RetryingCollector<M, D>,
        mut progress: F,
    ) -> Result<SuspendReport, SuspendError>
    where
        M: PowerMonitor,
        D: Delay,
        F: FnMut(u32, f64),
    {
        let measured = match self.strategy {
            SuspendStrategy::FixedDelay(delay) => {
                debug!(?delay, "fixed suspend delay");
                collector.delay_mut().sleep(delay);
                return Ok(SuspendReport { attempts: 0 });
            }
            SuspendStrategy::Measured(measured) => measured,
        };

        let mut attempts = 0;
        loop {
            let window = collector.collect(measured.window, measured.rate_hz)?;
            attempts += 1;

            if window_is_quiescent(&window, measured.window, measured.threshold_amps) {
                collector.delay_mut().sleep(measured.settle_delay);
                info!(attempts, "device suspended");
                return Ok(SuspendReport { attempts });
            }

            let average = mean(&window).unwrap_or(0.0);
            progress(attempts, average);

            if attempts >= measured.max_attempts {
                warn!(attempts, average, "device never reached suspend");
                return Err(SuspendError::Timeout {
                    attempts,
                    last_average_amps: average,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MonitorStatus, UsbPassthrough};
    use std::collections::VecDeque;

    /// Replays fixed windows; one raw sample per measurement at 100 Hz.
    #[derive(Default)]
    struct WindowMonitor {
        windows: VecDeque<Vec<f64>>,
    }

    impl PowerMonitor for WindowMonitor {
        fn start_collection(&mut self) {}

        fn stop_collection(&mut self) {}

        fn collect(&mut self) -> Option<Vec<f64>> {
            self.windows.pop_front()
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

    fn collector(windows: Vec<Vec<f64>>) -> RetryingCollector<WindowMonitor, Sleeps> {
        let monitor = WindowMonitor {
            windows: windows.into(),
        };
        RetryingCollector::new(monitor, Sleeps::default(), SUSPEND_SAMPLE_RATE_HZ)
    }

    fn one_spike() -> Vec<f64> {
        let mut window = vec![0.010; SUSPEND_WINDOW];
        window[42] = 0.200;
        window
    }

    #[test]
    fn full_low_power_window_is_quiescent() {
        assert!(window_is_quiescent(
            &[0.010; SUSPEND_WINDOW],
            SUSPEND_WINDOW,
            LOW_POWER_THRESHOLD_AMPS
        ));
    }

    #[test]
    fn one_high_value_breaks_the_window() {
        assert!(!window_is_quiescent(
            &one_spike(),
            SUSPEND_WINDOW,
            LOW_POWER_THRESHOLD_AMPS
        ));
        assert!(!window_is_quiescent(
            &[LOW_POWER_THRESHOLD_AMPS; SUSPEND_WINDOW],
            SUSPEND_WINDOW,
            LOW_POWER_THRESHOLD_AMPS
        ));
    }

    #[test]
    fn detects_suspend_on_first_clean_window() {
        let mut collector = collector(vec![one_spike(), vec![0.010; SUSPEND_WINDOW]]);
        let detector = SuspendDetector::default();
        let mut progress = Vec::new();

        let report = detector
            .wait(&mut collector, |attempt, average| progress.push((attempt, average)))
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].0, 1);
        assert_eq!(collector.delay_mut().0, [SUSPEND_SETTLE_DELAY]);
    }

    #[test]
    fn times_out_after_attempt_budget() {
        let windows = vec![vec![0.100; SUSPEND_WINDOW]; 3];
        let mut collector = collector(windows);
        let detector = SuspendDetector::new(SuspendStrategy::Measured(MeasuredSuspend {
            max_attempts: 3,
            ..MeasuredSuspend::default()
        }));

        let error = detector.wait(&mut collector, |_, _| {}).unwrap_err();

        match error {
            SuspendError::Timeout {
                attempts,
                last_average_amps,
            } => {
                assert_eq!(attempts, 3);
                assert!((last_average_amps - 0.100).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(collector.delay_mut().0.is_empty());
    }

    #[test]
    fn stalled_monitor_surfaces_collect_error() {
        let mut collector = collector(Vec::new());

        let error = SuspendDetector::default()
            .wait(&mut collector, |_, _| {})
            .unwrap_err();

        assert!(matches!(
            error,
            SuspendError::Collect(CollectError::InsufficientData { collected: 0, .. })
        ));
    }

    #[test]
    fn fixed_delay_sleeps_without_measuring() {
        let mut collector = collector(Vec::new());
        let detector = SuspendDetector::new(SuspendStrategy::from_strict(true));

        let report = detector.wait(&mut collector, |_, _| {}).unwrap();

        assert_eq!(report.attempts, 0);
        assert_eq!(collector.delay_mut().0, [STRICT_SUSPEND_DELAY]);
    }
}
