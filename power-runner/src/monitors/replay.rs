//! Power monitor that replays a capture of raw current samples.
//!
//! The capture is a text file with one current reading (amps) per line;
//! blank lines and lines starting with `#` are ignored. Samples are handed
//! out in fixed-size batches and the capture wraps around when exhausted.

use std::fs;
use std::path::{Path, PathBuf};

use power_core::monitor::{MonitorStatus, PowerMonitor, UsbPassthrough};
use thiserror::Error;
use tracing::debug;

/// Samples handed out per `collect` call.
pub const DEFAULT_BATCH: usize = 500;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unable to read capture {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sample `{text}` on line {line}")]
    InvalidSample { line: usize, text: String },
    #[error("capture contains no samples")]
    Empty,
    #[error("native rate {0} kHz is not a usable sample rate")]
    InvalidRate(f64),
}

/// Parses a capture, one sample per line.
pub fn parse_capture(text: &str) -> Result<Vec<f64>, ReplayError> {
    let mut samples = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let value = line.parse::<f64>().ok().filter(|value| value.is_finite());
        match value {
            Some(value) => samples.push(value),
            None => {
                return Err(ReplayError::InvalidSample {
                    line: index + 1,
                    text: line.to_string(),
                });
            }
        }
    }

    if samples.is_empty() {
        return Err(ReplayError::Empty);
    }
    Ok(samples)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplayMonitor {
    samples: Vec<f64>,
    cursor: usize,
    batch: usize,
    sample_rate_khz: f64,
    collecting: bool,
    passthrough: UsbPassthrough,
    voltage: f64,
    max_current: f64,
    closed: bool,
}

impl ReplayMonitor {
    pub fn new(samples: Vec<f64>, sample_rate_khz: f64) -> Result<Self, ReplayError> {
        if samples.is_empty() {
            return Err(ReplayError::Empty);
        }
        if !(sample_rate_khz.is_finite() && sample_rate_khz > 0.0) {
            return Err(ReplayError::InvalidRate(sample_rate_khz));
        }
        Ok(Self {
            samples,
            cursor: 0,
            batch: DEFAULT_BATCH,
            sample_rate_khz,
            collecting: false,
            passthrough: UsbPassthrough::Auto,
            voltage: 0.0,
            max_current: 0.0,
            closed: false,
        })
    }

    pub fn open(path: &Path, sample_rate_khz: f64) -> Result<Self, ReplayError> {
        let text = fs::read_to_string(path).map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let samples = parse_capture(&text)?;
        debug!(path = %path.display(), samples = samples.len(), "capture loaded");
        Self::new(samples, sample_rate_khz)
    }

    #[must_use]
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn passthrough(&self) -> UsbPassthrough {
        self.passthrough
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PowerMonitor for ReplayMonitor {
    fn start_collection(&mut self) {
        self.collecting = true;
    }

    fn stop_collection(&mut self) {
        self.collecting = false;
    }

    fn collect(&mut self) -> Option<Vec<f64>> {
        if !self.collecting || self.closed {
            return None;
        }
        let batch = (0..self.batch)
            .map(|offset| self.samples[(self.cursor + offset) % self.samples.len()])
            .collect();
        self.cursor = (self.cursor + self.batch) % self.samples.len();
        Some(batch)
    }

    fn status(&mut self) -> Option<MonitorStatus> {
        if self.closed {
            return None;
        }
        Some(
            MonitorStatus::new(self.sample_rate_khz)
                .with_field("usbPassthroughMode", self.passthrough.level().to_string())
                .with_field("outputVoltage", format!("{:.3}", self.voltage))
                .with_field("maxCurrent", format!("{:.3}", self.max_current))
                .with_field("captureSamples", self.samples.len().to_string()),
        )
    }

    fn set_usb_passthrough(&mut self, mode: UsbPassthrough) {
        self.passthrough = mode;
    }

    fn set_voltage(&mut self, volts: f64) {
        self.voltage = volts;
    }

    fn set_max_current(&mut self, amps: f64) {
        self.max_current = amps;
    }

    fn close(&mut self) {
        self.collecting = false;
        self.closed = true;
    }
}
