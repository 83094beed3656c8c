//! Host-side runner for the sensor power tests: command-line configuration,
//! power monitor back-ends, the `adb` device bridge and operator console.

pub mod abort;
pub mod artifacts;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod console;
pub mod monitors;
pub mod transport;
