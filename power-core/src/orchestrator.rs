//! Test orchestration: drives the DUT through one power test per planned
//! sensor/scenario pair and reports each verdict back to it.
//!
//! A test walks a fixed phase sequence:
//!
//! ```text
//! Idle -> AllSensorsOff -> ScreenOffAndSuspended(Background) -> BackgroundMeasured
//!      -> SensorEnabled [-> UserMotionAcknowledged] -> ScreenOffAndSuspended(Active)
//!      -> ActiveMeasured -> Evaluated -> Reported -> Idle
//! ```
//!
//! A sensor the DUT reports as unavailable goes straight from `Idle` to
//! `Reported` with a skipped verdict. Cancellation is cooperative: the
//! [`AbortToken`] is polled on test entry and just before the sensor is
//! powered.

use core::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, error, info, warn};

use crate::channel::{BridgeError, ChannelError, Connector, ControlChannel, DeviceBridge};
use crate::collector::{CollectError, RetryPolicy, RetryingCollector};
use crate::evaluate::{EvaluateError, evaluate, mean};
use crate::monitor::{
    Delay, MonitorStatus, PassthroughRetry, PowerMonitor, UsbPassthrough, apply_passthrough,
};
use crate::plan::{CONNECTED_MESSAGE, PlannedTest};
use crate::protocol::{ALL_SENSORS, Request, Response, SensorPower};
use crate::report::{LedgerSummary, ResultLedger, TestResult, Verdict};
use crate::suspend::{SuspendDetector, SuspendError, SuspendStrategy};

/// Measurements taken per window.
pub const SAMPLE_COUNT: usize = 1000;
/// Rate measurements are decimated to.
pub const SAMPLE_RATE_HZ: u32 = 100;

/// Which of a test's two measurement windows is being taken.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MeasurementWindow {
    Background,
    Active,
}

impl MeasurementWindow {
    /// Label used in artifact names.
    pub const fn label(self) -> &'static str {
        match self {
            MeasurementWindow::Background => "background",
            MeasurementWindow::Active => "sensor",
        }
    }
}

/// Phases of a single test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestPhase {
    Idle,
    AllSensorsOff,
    ScreenOffAndSuspended(MeasurementWindow),
    BackgroundMeasured,
    SensorEnabled,
    UserMotionAcknowledged,
    ActiveMeasured,
    Evaluated,
    Reported,
}

impl TestPhase {
    /// Returns `true` when `next` directly follows `self`.
    pub const fn can_transition_to(self, next: TestPhase) -> bool {
        use MeasurementWindow::{Active, Background};
        use TestPhase::{
            ActiveMeasured, AllSensorsOff, BackgroundMeasured, Evaluated, Idle, Reported,
            ScreenOffAndSuspended, SensorEnabled, UserMotionAcknowledged,
        };

        matches!(
            (self, next),
            (Idle, AllSensorsOff | Reported)
                | (AllSensorsOff, ScreenOffAndSuspended(Background))
                | (ScreenOffAndSuspended(Background), BackgroundMeasured)
                | (BackgroundMeasured, SensorEnabled)
                | (
                    SensorEnabled,
                    UserMotionAcknowledged | ScreenOffAndSuspended(Active)
                )
                | (UserMotionAcknowledged, ScreenOffAndSuspended(Active))
                | (ScreenOffAndSuspended(Active), ActiveMeasured)
                | (ActiveMeasured, Evaluated)
                | (Evaluated, Reported)
                | (Reported, Idle)
        )
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestPhase::ScreenOffAndSuspended(window) => {
                write!(f, "ScreenOffAndSuspended({})", window.label())
            }
            other => write!(f, "{other:?}"),
        }
    }
}

/// Rejected phase change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransitionError {
    pub from: TestPhase,
    pub to: TestPhase,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Sending half of the abort hand-off. Cloneable and `Send`, so a listener
/// thread can own one.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    sender: Sender<String>,
}

impl AbortHandle {
    /// Requests cancellation. Returns `false` once the token is gone.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.sender.send(reason.into()).is_ok()
    }
}

/// Receiving half of the abort hand-off, polled by the orchestrator.
#[derive(Debug)]
pub struct AbortToken {
    receiver: Receiver<String>,
}

impl AbortToken {
    /// Token that never fires.
    pub fn inert() -> Self {
        abort_channel().1
    }

    /// Returns the pending abort reason, if any.
    pub fn poll(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

/// Creates a connected abort handle/token pair.
pub fn abort_channel() -> (AbortHandle, AbortToken) {
    let (sender, receiver) = mpsc::channel();
    (AbortHandle { sender }, AbortToken { receiver })
}

/// Progress callbacks for operator-facing output. Every method defaults to
/// doing nothing.
#[allow(unused_variables)]
pub trait RunObserver {
    fn test_started(&mut self, test: &PlannedTest) {}

    fn phase_changed(&mut self, phase: TestPhase) {}

    fn suspend_progress(&mut self, attempt: u32, average_amps: f64) {}

    fn measurement(&mut self, window: MeasurementWindow, index: usize, value: f64) {}

    fn motion_requested(&mut self, test: &PlannedTest) {}

    fn test_finished(&mut self, result: &TestResult) {}
}

/// Observer that ignores every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct SilentObserver;

impl RunObserver for SilentObserver {}

/// Destination for raw measurement windows.
pub trait ArtifactSink {
    /// Persists a window, returning the local file written if any.
    fn store(
        &mut self,
        test: &PlannedTest,
        window: MeasurementWindow,
        measurements: &[f64],
    ) -> io::Result<Option<PathBuf>>;
}

/// Sink that keeps nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoArtifacts;

impl ArtifactSink for NoArtifacts {
    fn store(&mut self, _: &PlannedTest, _: MeasurementWindow, _: &[f64]) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Run-wide tunables.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub sample_count: usize,
    pub sample_rate_hz: u32,
    pub retry: RetryPolicy,
    pub passthrough_retry: PassthroughRetry,
    pub suspend: SuspendStrategy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_count: SAMPLE_COUNT,
            sample_rate_hz: SAMPLE_RATE_HZ,
            retry: RetryPolicy::default(),
            passthrough_retry: PassthroughRetry::default(),
            suspend: SuspendStrategy::default(),
        }
    }
}

#[derive(Debug)]
pub enum RunError {
    Channel(ChannelError),
    Bridge(BridgeError),
    /// The monitor never reported a usable status.
    MonitorUnavailable,
    Collect(CollectError),
    Suspend(SuspendError),
    Evaluate(EvaluateError),
    /// The DUT answered a command with something other than success.
    Rejected {
        context: String,
        response: Response,
    },
    Transition(TransitionError),
    Aborted(String),
    Artifact(io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Channel(error) => write!(f, "{error}"),
            RunError::Bridge(error) => write!(f, "{error}"),
            RunError::MonitorUnavailable => f.write_str("power monitor did not report its status"),
            RunError::Collect(error) => write!(f, "{error}"),
            RunError::Suspend(error) => write!(f, "{error}"),
            RunError::Evaluate(error) => write!(f, "{error}"),
            RunError::Rejected { context, response } => {
                write!(f, "{context} (device replied `{response}`)")
            }
            RunError::Transition(error) => write!(f, "{error}"),
            RunError::Aborted(reason) => write!(f, "aborted: {reason}"),
            RunError::Artifact(error) => write!(f, "unable to store measurements: {error}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Channel(error) => Some(error),
            RunError::Bridge(error) => Some(error),
            RunError::Collect(error) => Some(error),
            RunError::Suspend(error) => Some(error),
            RunError::Evaluate(error) => Some(error),
            RunError::Transition(error) => Some(error),
            RunError::Artifact(error) => Some(error),
            RunError::MonitorUnavailable
            | RunError::Rejected { .. }
            | RunError::Aborted(_) => None,
        }
    }
}

impl From<ChannelError> for RunError {
    fn from(error: ChannelError) -> Self {
        RunError::Channel(error)
    }
}

impl From<BridgeError> for RunError {
    fn from(error: BridgeError) -> Self {
        RunError::Bridge(error)
    }
}

impl From<CollectError> for RunError {
    fn from(error: CollectError) -> Self {
        RunError::Collect(error)
    }
}

impl From<SuspendError> for RunError {
    fn from(error: SuspendError) -> Self {
        RunError::Suspend(error)
    }
}

impl From<EvaluateError> for RunError {
    fn from(error: EvaluateError) -> Self {
        RunError::Evaluate(error)
    }
}

impl From<TransitionError> for RunError {
    fn from(error: TransitionError) -> Self {
        RunError::Transition(error)
    }
}

/// Owns every resource of a run: the monitor (inside the collector), the
/// control channel, the results ledger and the current phase.
pub struct PowerTestRunner<M, D, C, B, O = SilentObserver, S = NoArtifacts> {
    collector: RetryingCollector<M, D>,
    channel: ControlChannel<C, B>,
    config: RunConfig,
    observer: O,
    artifacts: S,
    abort: AbortToken,
    ledger: ResultLedger,
    phase: TestPhase,
    external_storage: Option<String>,
    finalized: bool,
}

impl<M, D, C, B> PowerTestRunner<M, D, C, B>
where
    M: PowerMonitor,
    D: Delay,
    C: Connector,
    B: DeviceBridge,
{
    /// Powers the DUT through the monitor, reads the monitor's native rate
    /// and asks the DUT for its external storage path.
    ///
    /// On failure every resource handed in is released before returning.
    pub fn connect(
        mut monitor: M,
        mut delay: D,
        mut channel: ControlChannel<C, B>,
        config: RunConfig,
    ) -> Result<Self, RunError> {
        info!("establishing connection to device");
        let status = apply_passthrough(
            &mut monitor,
            &mut delay,
            UsbPassthrough::On,
            config.passthrough_retry,
        );
        let Some(native_rate_hz) = status.as_ref().and_then(MonitorStatus::native_rate_hz) else {
            error!("power monitor status unavailable");
            monitor.close();
            channel.close();
            return Err(RunError::MonitorUnavailable);
        };

        let mut runner = Self {
            collector: RetryingCollector::with_policy(monitor, delay, native_rate_hz, config.retry),
            channel,
            config,
            observer: SilentObserver,
            artifacts: NoArtifacts,
            abort: AbortToken::inert(),
            ledger: ResultLedger::new(),
            phase: TestPhase::Idle,
            external_storage: None,
            finalized: false,
        };

        if let Err(error) = runner.handshake() {
            runner.finalize();
            return Err(error);
        }
        Ok(runner)
    }
}

impl<M, D, C, B, O, S> PowerTestRunner<M, D, C, B, O, S>
where
    M: PowerMonitor,
    D: Delay,
    C: Connector,
    B: DeviceBridge,
    O: RunObserver,
    S: ArtifactSink,
{
    /// Replaces the progress observer.
    pub fn with_observer<O2: RunObserver>(self, observer: O2) -> PowerTestRunner<M, D, C, B, O2, S> {
        PowerTestRunner {
            collector: self.collector,
            channel: self.channel,
            config: self.config,
            observer,
            artifacts: self.artifacts,
            abort: self.abort,
            ledger: self.ledger,
            phase: self.phase,
            external_storage: self.external_storage,
            finalized: self.finalized,
        }
    }

    /// Replaces the artifact sink.
    pub fn with_artifacts<S2: ArtifactSink>(self, artifacts: S2) -> PowerTestRunner<M, D, C, B, O, S2> {
        PowerTestRunner {
            collector: self.collector,
            channel: self.channel,
            config: self.config,
            observer: self.observer,
            artifacts,
            abort: self.abort,
            ledger: self.ledger,
            phase: self.phase,
            external_storage: self.external_storage,
            finalized: self.finalized,
        }
    }

    /// Installs the cancellation token polled between phases.
    #[must_use]
    pub fn with_abort(mut self, abort: AbortToken) -> Self {
        self.abort = abort;
        self
    }

    pub const fn phase(&self) -> TestPhase {
        self.phase
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    pub fn external_storage(&self) -> Option<&str> {
        self.external_storage.as_deref()
    }

    pub fn native_rate_hz(&self) -> u32 {
        self.collector.native_rate_hz()
    }

    pub fn channel_mut(&mut self) -> &mut ControlChannel<C, B> {
        &mut self.channel
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    fn handshake(&mut self) -> Result<(), RunError> {
        self.channel.bridge_mut().wait_for_device()?;
        let response = self.channel.send(&Request::ExternalStorage)?;
        match response.payload() {
            Some(path) if !path.is_empty() => {
                info!(path, "device external storage");
                self.external_storage = Some(path.to_string());
            }
            _ => warn!(%response, "device did not report external storage"),
        }
        Ok(())
    }

    /// Shows the connection banner on the DUT and runs `plan` in order,
    /// stopping at the first fatal error.
    pub fn run_plan(&mut self, plan: &[PlannedTest]) -> Result<LedgerSummary, RunError> {
        self.channel.send(&Request::ShowMessage {
            message: CONNECTED_MESSAGE,
        })?;
        for test in plan {
            self.run_test(test)?;
        }
        let summary = self.ledger.summary();
        info!(%summary, "tests complete");
        Ok(summary)
    }

    /// Runs one test. On a fatal error the failure is raised on the DUT,
    /// recorded as a failed result, and returned.
    pub fn run_test(&mut self, test: &PlannedTest) -> Result<TestResult, RunError> {
        self.observer.test_started(test);
        match self.execute(test) {
            Ok(result) => Ok(result),
            Err(RunError::Aborted(reason)) => {
                warn!(%reason, "run aborted");
                self.phase = TestPhase::Idle;
                Err(RunError::Aborted(reason))
            }
            Err(run_error) => {
                let name = test.test_name();
                let message = run_error.to_string();
                error!(test = %name, error = %message, "exiting on error");
                // The DUT is only reachable while its USB link is powered.
                if let Err(usb_error) = self.set_usb_enabled(true) {
                    warn!(error = %usb_error, "unable to restore usb before reporting failure");
                }
                let _ = self.channel.send_best_effort(&Request::Raise {
                    test: &name,
                    message: &message,
                });
                let _ = self.channel.send_best_effort(&Request::SetTestResult {
                    test: &name,
                    verdict: Verdict::Fail,
                    message: &message,
                });
                let result = TestResult {
                    test_name: name,
                    sensor: test.sensor.name,
                    scenario: test.scenario,
                    verdict: Verdict::Fail,
                    message,
                };
                if self.ledger.record(result.clone()).is_err() {
                    warn!("results ledger full, failure not recorded");
                }
                self.observer.test_finished(&result);
                self.phase = TestPhase::Idle;
                Err(run_error)
            }
        }
    }

    fn execute(&mut self, test: &PlannedTest) -> Result<TestResult, RunError> {
        self.poll_abort()?;
        let name = test.test_name();
        let sensor = test.sensor.name;
        info!(test = %name, "running power test");

        let availability = self
            .channel
            .send(&Request::SensorAvailability { sensor })?;
        match availability {
            Response::Unavailable => {
                info!(sensor, "sensor unavailable, skipping");
                self.enter(TestPhase::Reported)?;
                let message = format!("Sensor {sensor} not available on this device");
                return self.report(test, name, Verdict::Skipped, message);
            }
            Response::Ok => {}
            other => {
                return Err(RunError::Rejected {
                    context: format!("Unable to query availability of sensor {sensor}"),
                    response: other,
                });
            }
        }

        self.enter(TestPhase::AllSensorsOff)?;
        self.switch_sensor(ALL_SENSORS, SensorPower::Off)?;

        self.enter(TestPhase::ScreenOffAndSuspended(MeasurementWindow::Background))?;
        let background = self.measure_window(MeasurementWindow::Background)?;
        self.store(test, MeasurementWindow::Background, &background)?;
        let background_amps = mean(&background).ok_or(EvaluateError::EmptyWindow)?;
        self.enter(TestPhase::BackgroundMeasured)?;

        self.set_usb_enabled(true)?;
        self.poll_abort()?;
        self.switch_sensor(sensor, SensorPower::On)?;
        self.enter(TestPhase::SensorEnabled)?;

        if let Some(prompt) = test.motion_prompt() {
            self.observer.motion_requested(test);
            self.expect_ok(
                &Request::UserResponse { message: prompt },
                "Unable to request user acknowledgment",
            )?;
            self.enter(TestPhase::UserMotionAcknowledged)?;
        }

        self.enter(TestPhase::ScreenOffAndSuspended(MeasurementWindow::Active))?;
        let active = self.measure_window(MeasurementWindow::Active)?;
        self.enter(TestPhase::ActiveMeasured)?;
        if let Some(path) = self.store(test, MeasurementWindow::Active, &active)? {
            self.push_artifact(&path)?;
        }

        self.set_usb_enabled(true)?;
        let evaluation = evaluate(&active, background_amps, test.sensor.threshold.amps())?;
        self.enter(TestPhase::Evaluated)?;
        self.report(test, name, evaluation.verdict, evaluation.message())
    }

    fn report(
        &mut self,
        test: &PlannedTest,
        name: String,
        verdict: Verdict,
        message: String,
    ) -> Result<TestResult, RunError> {
        self.expect_ok(
            &Request::SetTestResult {
                test: &name,
                verdict,
                message: &message,
            },
            "Unable to send test status to Verifier",
        )?;

        let result = TestResult {
            test_name: name,
            sensor: test.sensor.name,
            scenario: test.scenario,
            verdict,
            message,
        };
        if self.ledger.record(result.clone()).is_err() {
            warn!(test = %result.test_name, "results ledger full, result not recorded");
        }
        if self.phase != TestPhase::Reported {
            self.enter(TestPhase::Reported)?;
        }
        info!(test = %result.test_name, %verdict, "test result reported");
        self.observer.test_finished(&result);
        self.enter(TestPhase::Idle)?;
        Ok(result)
    }

    fn enter(&mut self, next: TestPhase) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        info!(from = %self.phase, to = %next, "phase change");
        self.phase = next;
        self.observer.phase_changed(next);
        Ok(())
    }

    fn poll_abort(&self) -> Result<(), RunError> {
        match self.abort.poll() {
            Some(reason) => Err(RunError::Aborted(reason)),
            None => Ok(()),
        }
    }

    fn expect_ok(&mut self, request: &Request<'_>, context: &str) -> Result<(), RunError> {
        let response = self.channel.send(request)?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(RunError::Rejected {
                context: context.to_string(),
                response,
            })
        }
    }

    fn switch_sensor(&mut self, sensor: &str, power: SensorPower) -> Result<(), RunError> {
        let response = self.channel.send(&Request::SensorSwitch { power, sensor })?;
        if response == Response::Err {
            let context = match power {
                SensorPower::On => format!("Unable to set sensor {sensor} ON"),
                SensorPower::Off => format!("Unable to set sensor {sensor} OFF"),
            };
            return Err(RunError::Rejected { context, response });
        }
        debug!(sensor, power = power.as_token(), "sensor switched");
        Ok(())
    }

    /// Cuts or restores DUT USB power through the monitor. Restoring power
    /// waits for the DUT and re-applies the port forward.
    pub fn set_usb_enabled(&mut self, enabled: bool) -> Result<(), RunError> {
        let (monitor, delay) = self.collector.parts_mut();
        let status = apply_passthrough(
            monitor,
            delay,
            UsbPassthrough::for_usb(enabled),
            self.config.passthrough_retry,
        );
        if status.is_none() {
            warn!(enabled, "monitor status unavailable after passthrough change");
        }

        if enabled {
            self.channel.bridge_mut().wait_for_device()?;
            self.channel.refresh_forwarding()?;
            debug!("usb enabled, device online");
        } else {
            debug!("usb disabled");
        }
        Ok(())
    }

    /// Blanks the screen, cuts USB power, waits for suspend and collects one
    /// measurement window.
    fn measure_window(&mut self, window: MeasurementWindow) -> Result<Vec<f64>, RunError> {
        self.channel.send(&Request::ScreenOff)?;
        self.set_usb_enabled(false)?;

        let observer = &mut self.observer;
        SuspendDetector::new(self.config.suspend).wait(&mut self.collector, |attempt, average| {
            observer.suspend_progress(attempt, average);
        })?;

        info!(window = window.label(), "taking measurements");
        let measurements = self.collector.collect_with(
            self.config.sample_count,
            self.config.sample_rate_hz,
            |index, value| observer.measurement(window, index, value),
        )?;
        Ok(measurements)
    }

    fn store(
        &mut self,
        test: &PlannedTest,
        window: MeasurementWindow,
        measurements: &[f64],
    ) -> Result<Option<PathBuf>, RunError> {
        self.artifacts
            .store(test, window, measurements)
            .map_err(RunError::Artifact)
    }

    /// Copies a stored window to the DUT. Bridge failures are logged only.
    fn push_artifact(&mut self, path: &Path) -> Result<(), RunError> {
        let Some(storage) = self.external_storage.clone() else {
            return Ok(());
        };

        self.set_usb_enabled(true)?;
        let bridge = self.channel.bridge_mut();
        if let Err(error) = bridge.make_dir(&storage) {
            warn!(%error, "unable to create storage directory on device");
        }
        match bridge.push_file(path, &storage) {
            Ok(()) => info!(path = %path.display(), "raw data saved to device"),
            Err(error) => warn!(%error, "unable to push raw data to device"),
        }
        self.set_usb_enabled(false)
    }

    /// Tears down the channel and releases the monitor. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.channel.close();
        self.collector.monitor_mut().close();
        self.finalized = true;
        debug!("runner finalized");
    }
}
