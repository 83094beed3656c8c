//! Power monitor back-ends selectable from the command line.

pub mod replay;

use power_core::monitor::PowerMonitor;

use crate::config::MonitorSpec;

pub use replay::{ReplayError, ReplayMonitor};

/// Opens the monitor described by `spec`.
pub fn open(spec: &MonitorSpec) -> Result<Box<dyn PowerMonitor>, ReplayError> {
    match spec {
        MonitorSpec::Replay {
            path,
            sample_rate_khz,
        } => Ok(Box::new(ReplayMonitor::open(path, *sample_rate_khz)?)),
    }
}
