#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use power_core::channel::{BridgeError, Connector, ControlChannel, DeviceBridge};
use power_core::monitor::{Delay, MonitorStatus, PowerMonitor, UsbPassthrough};
use power_core::orchestrator::{
    ArtifactSink, MeasurementWindow, PowerTestRunner, RunConfig, RunError,
};
use power_core::plan::PlannedTest;
use power_core::protocol::{Request, Response, SensorPower};

pub const PORT: u16 = 5555;
pub const STORAGE: &str = "/sdcard/cts-power";
pub const BACKGROUND_AMPS: f64 = 0.020;
pub const ACTIVE_AMPS: f64 = 0.050;

/// Observable side effects of the monitor.
#[derive(Default)]
pub struct MonitorLog {
    pub passthrough: Vec<UsbPassthrough>,
    pub pulls: usize,
    pub closes: usize,
}

/// 100 Hz monitor whose draw depends on whether the fake DUT has a sensor on.
pub struct FakeMonitor {
    pub log: Rc<RefCell<MonitorLog>>,
    pub sensor_on: Rc<Cell<bool>>,
    /// Pulls answered with data before the monitor stalls for good.
    pub pulls_before_stall: Option<usize>,
}

impl PowerMonitor for FakeMonitor {
    fn start_collection(&mut self) {}

    fn stop_collection(&mut self) {}

    fn collect(&mut self) -> Option<Vec<f64>> {
        let mut log = self.log.borrow_mut();
        log.pulls += 1;
        if self.pulls_before_stall.is_some_and(|limit| log.pulls > limit) {
            return None;
        }
        let level = if self.sensor_on.get() {
            ACTIVE_AMPS
        } else {
            BACKGROUND_AMPS
        };
        Some(vec![level; 100])
    }

    fn status(&mut self) -> Option<MonitorStatus> {
        Some(MonitorStatus::new(0.1).with_field("voltage", "4.2"))
    }

    fn set_usb_passthrough(&mut self, mode: UsbPassthrough) {
        self.log.borrow_mut().passthrough.push(mode);
    }

    fn set_voltage(&mut self, _: f64) {}

    fn set_max_current(&mut self, _: f64) {}

    fn close(&mut self) {
        self.log.borrow_mut().closes += 1;
    }
}

#[derive(Clone, Default)]
pub struct RecordingDelay(pub Rc<RefCell<Vec<Duration>>>);

impl Delay for RecordingDelay {
    fn sleep(&mut self, duration: Duration) {
        self.0.borrow_mut().push(duration);
    }
}

/// Device-side state of the fake DUT.
#[derive(Default)]
pub struct DutState {
    pub requests: Vec<String>,
    pub unavailable: BTreeSet<String>,
    pub storage: Option<String>,
    pub reject_user_response: bool,
}

impl DutState {
    fn respond(&mut self, line: &str, sensor_on: &Cell<bool>) -> Response {
        self.requests.push(line.to_string());
        match Request::decode(line) {
            Ok(Request::ExternalStorage) => match &self.storage {
                Some(path) => Response::Payload(path.clone()),
                None => Response::Err,
            },
            Ok(Request::SensorAvailability { sensor }) => {
                if self.unavailable.contains(sensor) {
                    Response::Unavailable
                } else {
                    Response::Ok
                }
            }
            Ok(Request::SensorSwitch { power, .. }) => {
                sensor_on.set(power == SensorPower::On);
                Response::Ok
            }
            Ok(Request::UserResponse { .. }) if self.reject_user_response => Response::Err,
            Ok(_) => Response::Ok,
            Err(_) => Response::Err,
        }
    }
}

pub struct FakeStream {
    dut: Rc<RefCell<DutState>>,
    sensor_on: Rc<Cell<bool>>,
    line: Vec<u8>,
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        let reply = self.dut.borrow_mut().respond(&line, &self.sensor_on).to_string();
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply.as_bytes()[..len]);
        Ok(len)
    }
}

pub struct FakeConnector {
    pub dut: Rc<RefCell<DutState>>,
    pub sensor_on: Rc<Cell<bool>>,
    pub monitor: Rc<RefCell<MonitorLog>>,
    /// Refuse connections unless the monitor last switched USB on, like a
    /// bridge whose device is only reachable over the powered USB link.
    pub require_usb: bool,
}

impl Connector for FakeConnector {
    type Stream = FakeStream;

    fn reserve_port(&mut self) -> io::Result<u16> {
        Ok(PORT)
    }

    fn connect(&mut self, _port: u16) -> io::Result<FakeStream> {
        let usb_on = self.monitor.borrow().passthrough.last() == Some(&UsbPassthrough::On);
        if self.require_usb && !usb_on {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        Ok(FakeStream {
            dut: Rc::clone(&self.dut),
            sensor_on: Rc::clone(&self.sensor_on),
            line: Vec::new(),
        })
    }
}

#[derive(Clone, Default)]
pub struct FakeBridge(pub Rc<RefCell<Vec<String>>>);

impl FakeBridge {
    fn log(&self, call: String) -> Result<(), BridgeError> {
        self.0.borrow_mut().push(call);
        Ok(())
    }
}

impl DeviceBridge for FakeBridge {
    fn forward(&mut self, port: u16, endpoint: &str) -> Result<(), BridgeError> {
        self.log(format!("forward {port} {endpoint}"))
    }

    fn remove_forward(&mut self, port: u16) -> Result<(), BridgeError> {
        self.log(format!("remove {port}"))
    }

    fn wait_for_device(&mut self) -> Result<(), BridgeError> {
        self.log("wait".to_string())
    }

    fn make_dir(&mut self, remote_dir: &str) -> Result<(), BridgeError> {
        self.log(format!("mkdir {remote_dir}"))
    }

    fn push_file(&mut self, local: &Path, remote_dir: &str) -> Result<(), BridgeError> {
        self.log(format!("push {} {remote_dir}", local.display()))
    }
}

/// Artifact sink that keeps windows in memory and pretends to write files.
#[derive(Clone, Default)]
pub struct MemoryArtifacts(pub Rc<RefCell<Vec<(String, MeasurementWindow, usize)>>>);

impl ArtifactSink for MemoryArtifacts {
    fn store(
        &mut self,
        test: &PlannedTest,
        window: MeasurementWindow,
        measurements: &[f64],
    ) -> io::Result<Option<PathBuf>> {
        self.0
            .borrow_mut()
            .push((test.test_name(), window, measurements.len()));
        Ok(Some(PathBuf::from(format!(
            "/tmp/{}-{}.log",
            test.test_name(),
            window.label()
        ))))
    }
}

pub type Runner = PowerTestRunner<FakeMonitor, RecordingDelay, FakeConnector, FakeBridge>;

/// Shared handles into every fake, kept by the test after the runner takes
/// ownership of the fakes themselves.
pub struct Harness {
    pub monitor: Rc<RefCell<MonitorLog>>,
    pub sensor_on: Rc<Cell<bool>>,
    pub dut: Rc<RefCell<DutState>>,
    pub bridge: FakeBridge,
    pub delay: RecordingDelay,
    pub pulls_before_stall: Option<usize>,
    pub require_usb: bool,
}

impl Harness {
    pub fn new() -> Self {
        let dut = DutState {
            storage: Some(STORAGE.to_string()),
            ..DutState::default()
        };
        Self {
            monitor: Rc::default(),
            sensor_on: Rc::default(),
            dut: Rc::new(RefCell::new(dut)),
            bridge: FakeBridge::default(),
            delay: RecordingDelay::default(),
            pulls_before_stall: None,
            require_usb: false,
        }
    }

    pub fn config() -> RunConfig {
        RunConfig {
            sample_count: 50,
            ..RunConfig::default()
        }
    }

    pub fn connect(&self) -> Result<Runner, RunError> {
        let monitor = FakeMonitor {
            log: Rc::clone(&self.monitor),
            sensor_on: Rc::clone(&self.sensor_on),
            pulls_before_stall: self.pulls_before_stall,
        };
        let connector = FakeConnector {
            dut: Rc::clone(&self.dut),
            sensor_on: Rc::clone(&self.sensor_on),
            monitor: Rc::clone(&self.monitor),
            require_usb: self.require_usb,
        };
        let channel = ControlChannel::new(connector, self.bridge.clone());
        PowerTestRunner::connect(monitor, self.delay.clone(), channel, Self::config())
    }

    pub fn requests(&self) -> Vec<String> {
        self.dut.borrow().requests.clone()
    }

    pub fn bridge_calls(&self) -> Vec<String> {
        self.bridge.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.dut.borrow_mut().requests.clear();
        self.bridge.0.borrow_mut().clear();
    }
}
