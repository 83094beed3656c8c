//! Runner configuration: environment defaults overridden by command-line
//! arguments.

use std::env;
use std::path::PathBuf;

use power_core::channel::DEFAULT_ENDPOINT;
use power_core::orchestrator::{SAMPLE_COUNT, SAMPLE_RATE_HZ};
use thiserror::Error;

/// Default streaming output rate.
pub const DEFAULT_STREAM_HZ: u32 = 5000;
/// Native rate assumed for replayed captures.
pub const DEFAULT_REPLAY_KHZ: f64 = 5.0;

pub const USAGE: &str = "\
Usage: power-runner <command> --power-monitor replay:<file> [options]

Commands:
  run      run the sensor power test plan against the connected device
  stream   print decimated samples (--samples N|-1 --hz H [--avg K] [--timestamp])
  status   print monitor status
  set      change monitor output ([--voltage V] [--current A] [--usb on|off|auto])

Options:
  --native-khz <rate>   native rate of a replayed capture (default 5.0)
  --adb <path>          device bridge executable (POWER_TEST_ADB)
  --endpoint <name>     DUT endpoint to forward to (POWER_TEST_ENDPOINT)
  --dump-dir <dir>      where raw windows are written (POWER_TEST_DUMP_DIR)
  --strict-delay        wait a fixed delay instead of detecting suspend
  --no-log-data         do not write raw windows to files
  --rate <hz>           measurement rate for test runs (POWER_TEST_RATE)";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing command")]
    MissingCommand,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("expected value after {0}")]
    MissingValue(String),
    #[error("invalid value `{value}` for {name}")]
    InvalidValue { name: String, value: String },
    #[error("you must specify a power monitor with --power-monitor replay:<file>")]
    MissingMonitor,
    #[error("unsupported power monitor `{0}`")]
    UnsupportedMonitor(String),
    #[error("--avg must be greater than 0")]
    InvalidAverage,
}

/// Power monitor selected on the command line.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorSpec {
    /// Replays a capture file of raw current samples.
    Replay { path: PathBuf, sample_rate_khz: f64 },
}

impl MonitorSpec {
    fn parse(value: &str, sample_rate_khz: f64) -> Result<Self, ConfigError> {
        match value.split_once(':') {
            Some(("replay", path)) if !path.is_empty() => Ok(MonitorSpec::Replay {
                path: PathBuf::from(path),
                sample_rate_khz,
            }),
            _ => Err(ConfigError::UnsupportedMonitor(value.to_string())),
        }
    }
}

/// Options of the `stream` command.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Samples to print; `None` streams until the monitor runs dry.
    pub samples: Option<u64>,
    pub hz: u32,
    pub average_over: Option<usize>,
    pub timestamp: bool,
}

/// Options of the `set` command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    /// Raw passthrough tag; validated once the monitor is open.
    pub usb: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Run,
    Stream(StreamOptions),
    Status,
    Set(SetOptions),
}

/// Fully resolved runner configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    pub command: Command,
    pub monitor: MonitorSpec,
    pub adb: PathBuf,
    pub endpoint: String,
    pub dump_dir: PathBuf,
    pub strict_delay: bool,
    pub log_data: bool,
    pub sample_count: usize,
    pub sample_rate_hz: u32,
}

/// Values read from the environment before arguments are applied.
#[derive(Clone, Debug, PartialEq)]
struct EnvDefaults {
    adb: PathBuf,
    endpoint: String,
    dump_dir: PathBuf,
    strict_delay: bool,
    log_data: bool,
    sample_count: usize,
    sample_rate_hz: u32,
}

impl EnvDefaults {
    fn load<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            adb: lookup("POWER_TEST_ADB").map_or_else(|| PathBuf::from("adb"), PathBuf::from),
            endpoint: lookup("POWER_TEST_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            dump_dir: lookup("POWER_TEST_DUMP_DIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from),
            strict_delay: env_flag(&lookup, "POWER_TEST_STRICT_DELAY", false)?,
            log_data: env_flag(&lookup, "POWER_TEST_LOG_DATA", true)?,
            sample_count: env_number(&lookup, "POWER_TEST_SAMPLES", SAMPLE_COUNT)?,
            sample_rate_hz: env_number(&lookup, "POWER_TEST_RATE", SAMPLE_RATE_HZ)?,
        })
    }
}

fn env_flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(name, &value)),
        },
    }
}

fn env_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| invalid(name, &value)),
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(name, value))
}

/// Splits `--name=value` and `--name value` forms.
struct Args<I: Iterator<Item = String>> {
    inner: I,
}

impl<I: Iterator<Item = String>> Args<I> {
    fn value(&mut self, name: &str, inline: Option<String>) -> Result<String, ConfigError> {
        inline
            .or_else(|| self.inner.next())
            .ok_or_else(|| ConfigError::MissingValue(name.to_string()))
    }
}

impl RunnerConfig {
    /// Reads the process environment and arguments.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(env::args().skip(1), |name| env::var(name).ok())
    }

    /// Builds a configuration from `args` (without the program name) and an
    /// environment lookup.
    pub fn parse<A, F>(args: A, lookup: F) -> Result<Self, ConfigError>
    where
        A: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EnvDefaults::load(lookup)?;
        let mut args = Args {
            inner: args.into_iter(),
        };

        let command = args.inner.next().ok_or(ConfigError::MissingCommand)?;
        let mut monitor = None;
        let mut native_khz = DEFAULT_REPLAY_KHZ;
        let mut config = RunnerConfig {
            command: Command::Run,
            monitor: MonitorSpec::Replay {
                path: PathBuf::new(),
                sample_rate_khz: DEFAULT_REPLAY_KHZ,
            },
            adb: defaults.adb,
            endpoint: defaults.endpoint,
            dump_dir: defaults.dump_dir,
            strict_delay: defaults.strict_delay,
            log_data: defaults.log_data,
            sample_count: defaults.sample_count,
            sample_rate_hz: defaults.sample_rate_hz,
        };
        let mut samples: Option<i64> = None;
        let mut stream = StreamOptions {
            samples: None,
            hz: DEFAULT_STREAM_HZ,
            average_over: None,
            timestamp: false,
        };
        let mut set = SetOptions::default();

        while let Some(arg) = args.inner.next() {
            let (name, inline) = match arg.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (arg, None),
            };

            match name.as_str() {
                "--power-monitor" => monitor = Some(args.value(&name, inline)?),
                "--native-khz" => native_khz = parse_value(&name, &args.value(&name, inline)?)?,
                "--adb" => config.adb = PathBuf::from(args.value(&name, inline)?),
                "--endpoint" => config.endpoint = args.value(&name, inline)?,
                "--dump-dir" => config.dump_dir = PathBuf::from(args.value(&name, inline)?),
                "--strict-delay" => config.strict_delay = true,
                "--no-log-data" => config.log_data = false,
                "--rate" => config.sample_rate_hz = parse_value(&name, &args.value(&name, inline)?)?,
                "--samples" => samples = Some(parse_value(&name, &args.value(&name, inline)?)?),
                "--hz" => stream.hz = parse_value(&name, &args.value(&name, inline)?)?,
                "--avg" => {
                    let window: i64 = parse_value(&name, &args.value(&name, inline)?)?;
                    let window = usize::try_from(window)
                        .ok()
                        .filter(|window| *window > 0)
                        .ok_or(ConfigError::InvalidAverage)?;
                    stream.average_over = Some(window);
                }
                "--timestamp" => stream.timestamp = true,
                "--voltage" => set.voltage = Some(parse_value(&name, &args.value(&name, inline)?)?),
                "--current" => set.current = Some(parse_value(&name, &args.value(&name, inline)?)?),
                "--usb" => set.usb = Some(args.value(&name, inline)?),
                _ => return Err(ConfigError::UnknownOption(name)),
            }
        }

        config.command = match command.as_str() {
            "run" => {
                if let Some(count) = samples {
                    config.sample_count = usize::try_from(count)
                        .ok()
                        .filter(|count| *count > 0)
                        .ok_or_else(|| invalid("--samples", &count.to_string()))?;
                }
                Command::Run
            }
            "stream" => {
                stream.samples = match samples {
                    None | Some(-1) => None,
                    Some(count) => Some(
                        u64::try_from(count).map_err(|_| invalid("--samples", &count.to_string()))?,
                    ),
                };
                Command::Stream(stream)
            }
            "status" => Command::Status,
            "set" => Command::Set(set),
            other => return Err(ConfigError::UnknownCommand(other.to_string())),
        };

        let monitor = monitor.ok_or(ConfigError::MissingMonitor)?;
        config.monitor = MonitorSpec::parse(&monitor, native_khz)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn run_defaults_come_from_constants() {
        let config = RunnerConfig::parse(args("run --power-monitor replay:cap.txt"), no_env)
            .expect("valid arguments");

        assert_eq!(config.command, Command::Run);
        assert_eq!(config.sample_count, SAMPLE_COUNT);
        assert_eq!(config.sample_rate_hz, SAMPLE_RATE_HZ);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.adb, PathBuf::from("adb"));
        assert!(config.log_data);
        assert!(!config.strict_delay);
        assert_eq!(
            config.monitor,
            MonitorSpec::Replay {
                path: PathBuf::from("cap.txt"),
                sample_rate_khz: DEFAULT_REPLAY_KHZ,
            }
        );
    }

    #[test]
    fn environment_is_overridden_by_arguments() {
        let lookup = |name: &str| match name {
            "POWER_TEST_SAMPLES" => Some("300".to_string()),
            "POWER_TEST_STRICT_DELAY" => Some("yes".to_string()),
            "POWER_TEST_ADB" => Some("/opt/adb".to_string()),
            _ => None,
        };

        let config = RunnerConfig::parse(
            args("run --power-monitor=replay:cap.txt --samples=200 --adb /usr/bin/adb"),
            lookup,
        )
        .expect("valid arguments");

        assert_eq!(config.sample_count, 200);
        assert!(config.strict_delay);
        assert_eq!(config.adb, PathBuf::from("/usr/bin/adb"));
    }

    #[test]
    fn stream_accepts_unbounded_sample_count() {
        let config = RunnerConfig::parse(
            args("stream --power-monitor replay:cap.txt --native-khz 0.5 --samples -1 --hz 100 --avg 10 --timestamp"),
            no_env,
        )
        .expect("valid arguments");

        assert_eq!(
            config.command,
            Command::Stream(StreamOptions {
                samples: None,
                hz: 100,
                average_over: Some(10),
                timestamp: true,
            })
        );
        assert_eq!(
            config.monitor,
            MonitorSpec::Replay {
                path: PathBuf::from("cap.txt"),
                sample_rate_khz: 0.5,
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        let parse = |line: &str| RunnerConfig::parse(args(line), no_env).unwrap_err();

        assert_eq!(parse(""), ConfigError::MissingCommand);
        assert_eq!(parse("fly"), ConfigError::UnknownCommand("fly".into()));
        assert_eq!(parse("status"), ConfigError::MissingMonitor);
        assert_eq!(
            parse("status --power-monitor monsoon"),
            ConfigError::UnsupportedMonitor("monsoon".into())
        );
        assert_eq!(
            parse("stream --power-monitor replay:x --avg 0"),
            ConfigError::InvalidAverage
        );
        assert_eq!(
            parse("run --power-monitor replay:x --samples"),
            ConfigError::MissingValue("--samples".into())
        );
        assert_eq!(parse("run --bogus"), ConfigError::UnknownOption("--bogus".into()));
        assert!(matches!(
            parse("run --power-monitor replay:x --samples 0"),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn invalid_environment_is_reported() {
        let lookup = |name: &str| (name == "POWER_TEST_RATE").then(|| "fast".to_string());

        assert_eq!(
            RunnerConfig::parse(args("status --power-monitor replay:x"), lookup).unwrap_err(),
            ConfigError::InvalidValue {
                name: "POWER_TEST_RATE".into(),
                value: "fast".into(),
            }
        );
    }

    #[test]
    fn set_collects_output_changes() {
        let config = RunnerConfig::parse(
            args("set --power-monitor replay:x --voltage 4.2 --current=3 --usb auto"),
            no_env,
        )
        .expect("valid arguments");

        assert_eq!(
            config.command,
            Command::Set(SetOptions {
                voltage: Some(4.2),
                current: Some(3.0),
                usb: Some("auto".into()),
            })
        );
    }
}
