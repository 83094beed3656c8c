//! [`DeviceBridge`] backed by the `adb` command-line tool.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use power_core::channel::{BridgeError, DeviceBridge};
use tracing::{debug, error};

/// Runs `adb` sub-commands and maps a non-zero exit status to an error.
#[derive(Clone, Debug)]
pub struct AdbBridge {
    program: PathBuf,
}

impl AdbBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Argument list for forwarding `port` to the DUT's abstract socket.
    pub fn forward_args(port: u16, endpoint: &str) -> [String; 3] {
        [
            "forward".to_string(),
            format!("tcp:{port}"),
            format!("localabstract:{endpoint}"),
        ]
    }

    fn run<I, S>(&self, operation: &'static str, args: I) -> Result<(), BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args).stdin(Stdio::null());
        debug!(?command, "executing");

        let status = command
            .status()
            .map_err(|err| BridgeError::new(operation, err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            error!(?command, %status, "bridge command failed");
            Err(BridgeError::new(operation, status.to_string()))
        }
    }
}

impl DeviceBridge for AdbBridge {
    fn forward(&mut self, port: u16, endpoint: &str) -> Result<(), BridgeError> {
        self.run("forward", Self::forward_args(port, endpoint))
    }

    fn remove_forward(&mut self, port: u16) -> Result<(), BridgeError> {
        self.run("remove forward", ["forward".to_string(), "--remove".to_string(), format!("tcp:{port}")])
    }

    fn wait_for_device(&mut self) -> Result<(), BridgeError> {
        self.run("wait-for-device", ["wait-for-device"])
    }

    fn make_dir(&mut self, remote_dir: &str) -> Result<(), BridgeError> {
        self.run("mkdir", ["shell", "mkdir", "-p", remote_dir])
    }

    fn push_file(&mut self, local: &Path, remote_dir: &str) -> Result<(), BridgeError> {
        let target = format!("{remote_dir}/.");
        self.run(
            "push",
            [OsStr::new("push"), local.as_os_str(), OsStr::new(&target)],
        )
    }
}
