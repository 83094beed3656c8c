//! Power monitor capability and DUT power-path helpers.
//!
//! The monitor driver itself lives outside this crate. Everything here talks
//! to it through [`PowerMonitor`], which mirrors the small command surface
//! every supported monitor exposes: start/stop a collection, pull whatever
//! raw current samples have accumulated, report status, and drive the USB
//! passthrough that powers the device under test.

use core::fmt;
use core::time::Duration;
use std::collections::BTreeMap;

use tracing::{debug, warn};

/// USB passthrough modes understood by the power monitor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsbPassthrough {
    Off,
    On,
    Auto,
}

impl UsbPassthrough {
    /// Numeric level sent to the monitor.
    pub const fn level(self) -> u8 {
        match self {
            UsbPassthrough::Off => 0,
            UsbPassthrough::On => 1,
            UsbPassthrough::Auto => 2,
        }
    }

    /// Parses an operator supplied mode (`on`, `off`, `auto`).
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag.eq_ignore_ascii_case("off") {
            Some(Self::Off)
        } else if tag.eq_ignore_ascii_case("on") {
            Some(Self::On)
        } else if tag.eq_ignore_ascii_case("auto") {
            Some(Self::Auto)
        } else {
            None
        }
    }

    /// Passthrough mode that powers (or cuts) the DUT's USB link.
    pub const fn for_usb(enabled: bool) -> Self {
        if enabled { Self::On } else { Self::Off }
    }
}

impl fmt::Display for UsbPassthrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbPassthrough::Off => f.write_str("off"),
            UsbPassthrough::On => f.write_str("on"),
            UsbPassthrough::Auto => f.write_str("auto"),
        }
    }
}

/// Snapshot returned by a successful status poll.
///
/// `sample_rate_khz` is the only field the harness depends on; the rest are
/// monitor-specific and only ever printed.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorStatus {
    pub sample_rate_khz: f64,
    pub fields: BTreeMap<String, String>,
}

impl MonitorStatus {
    /// Creates a status snapshot with no extra fields.
    #[must_use]
    pub fn new(sample_rate_khz: f64) -> Self {
        Self {
            sample_rate_khz,
            fields: BTreeMap::new(),
        }
    }

    /// Attaches a monitor-specific field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Native sampling rate in Hz, or `None` when the monitor reported
    /// something that cannot be a rate.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn native_rate_hz(&self) -> Option<u32> {
        let hz = (self.sample_rate_khz * 1000.0).round();
        if hz.is_finite() && hz >= 1.0 && hz <= f64::from(u32::MAX) {
            Some(hz as u32)
        } else {
            None
        }
    }

    /// All fields, `sampleRate` included, sorted by name.
    pub fn sorted_fields(&self) -> Vec<(String, String)> {
        let mut fields: BTreeMap<String, String> = self.fields.clone();
        fields.insert("sampleRate".to_string(), self.sample_rate_khz.to_string());
        fields.into_iter().collect()
    }
}

/// Capability interface to an external power monitor.
///
/// `collect` returning `None` signals a stalled or faulted monitor and is
/// distinct from a batch of zero readings. `status` returning `None` signals
/// a communication fault.
pub trait PowerMonitor {
    /// Begins streaming raw samples.
    fn start_collection(&mut self);

    /// Stops streaming raw samples. Must be safe to call when idle.
    fn stop_collection(&mut self);

    /// Pulls the raw current samples (amps) accumulated since the last call.
    fn collect(&mut self) -> Option<Vec<f64>>;

    /// Polls the monitor status.
    fn status(&mut self) -> Option<MonitorStatus>;

    /// Sets the USB passthrough mode.
    fn set_usb_passthrough(&mut self, mode: UsbPassthrough);

    /// Sets the main output voltage (0 disables output).
    fn set_voltage(&mut self, volts: f64);

    /// Sets the maximum output current.
    fn set_max_current(&mut self, amps: f64);

    /// Releases the monitor. Must be idempotent.
    fn close(&mut self);
}

impl<M> PowerMonitor for Box<M>
where
    M: PowerMonitor + ?Sized,
{
    fn start_collection(&mut self) {
        (**self).start_collection();
    }

    fn stop_collection(&mut self) {
        (**self).stop_collection();
    }

    fn collect(&mut self) -> Option<Vec<f64>> {
        (**self).collect()
    }

    fn status(&mut self) -> Option<MonitorStatus> {
        (**self).status()
    }

    fn set_usb_passthrough(&mut self, mode: UsbPassthrough) {
        (**self).set_usb_passthrough(mode);
    }

    fn set_voltage(&mut self, volts: f64) {
        (**self).set_voltage(volts);
    }

    fn set_max_current(&mut self, amps: f64) {
        (**self).set_max_current(amps);
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// Blocking delay source. Tests substitute a recorder so nothing sleeps.
pub trait Delay {
    fn sleep(&mut self, duration: Duration);
}

/// [`Delay`] backed by `std::thread::sleep`.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadSleep;

impl Delay for ThreadSleep {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Number of status re-polls after a passthrough change.
pub const PASSTHROUGH_STATUS_RETRIES: u8 = 5;
/// Pause between passthrough status re-polls.
pub const PASSTHROUGH_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded retry applied when the monitor stops answering after a
/// passthrough change (common right after a data collection).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PassthroughRetry {
    pub max_attempts: u8,
    pub backoff: Duration,
}

impl Default for PassthroughRetry {
    fn default() -> Self {
        Self {
            max_attempts: PASSTHROUGH_STATUS_RETRIES,
            backoff: PASSTHROUGH_RETRY_BACKOFF,
        }
    }
}

/// Applies `mode` and re-polls status until the monitor answers or the retry
/// budget runs out. Each retry stops any collection and re-applies the mode.
pub fn apply_passthrough<M, D>(
    monitor: &mut M,
    delay: &mut D,
    mode: UsbPassthrough,
    retry: PassthroughRetry,
) -> Option<MonitorStatus>
where
    M: PowerMonitor + ?Sized,
    D: Delay + ?Sized,
{
    monitor.set_usb_passthrough(mode);
    let mut status = monitor.status();
    let mut attempts = 0;

    while status.is_none() && attempts < retry.max_attempts {
        attempts += 1;
        delay.sleep(retry.backoff);
        warn!(attempt = attempts, %mode, "retrying monitor status poll");
        monitor.stop_collection();
        monitor.set_usb_passthrough(mode);
        status = monitor.status();
    }

    debug!(%mode, answered = status.is_some(), attempts, "passthrough applied");
    status
}
