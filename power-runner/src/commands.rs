//! Top-level runner commands.

use std::io::{self, BufRead, BufReader, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use power_core::channel::ControlChannel;
use power_core::monitor::{PowerMonitor, ThreadSleep, UsbPassthrough};
use power_core::orchestrator::{PowerTestRunner, RunConfig, abort_channel};
use power_core::plan::default_plan;
use power_core::rate::{DecimationMode, RateConverter, RollingAverage};
use power_core::report::LedgerSummary;
use power_core::suspend::SuspendStrategy;
use tracing::{debug, info, warn};

use crate::abort::spawn_listener;
use crate::artifacts::Artifacts;
use crate::bridge::AdbBridge;
use crate::config::{RunnerConfig, SetOptions, StreamOptions};
use crate::console::Console;
use crate::monitors;
use crate::transport::TcpConnector;

/// Output voltage above which the operator is warned before confirming.
pub const HIGH_VOLTAGE_WARNING: f64 = 5.5;
/// Streamed output is flushed at least this often.
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the default test plan against the connected device.
///
/// Typing `abort [reason]` on stdin stops the run at the next abort point.
/// Returns an error when the run was cut short or any test failed.
pub fn run(config: &RunnerConfig) -> anyhow::Result<LedgerSummary> {
    let monitor = monitors::open(&config.monitor).context("unable to open power monitor")?;
    let channel = ControlChannel::with_endpoint(
        TcpConnector,
        AdbBridge::new(&config.adb),
        config.endpoint.clone(),
    );
    let run_config = RunConfig {
        sample_count: config.sample_count,
        sample_rate_hz: config.sample_rate_hz,
        suspend: SuspendStrategy::from_strict(config.strict_delay),
        ..RunConfig::default()
    };

    let (handle, token) = abort_channel();
    // Detached: the listener blocks on stdin for the lifetime of the process.
    spawn_listener(BufReader::new(io::stdin()), handle).context("unable to start abort listener")?;

    let mut runner = PowerTestRunner::connect(monitor, ThreadSleep, channel, run_config)
        .context("unable to connect to device")?
        .with_observer(Console::stdout())
        .with_artifacts(Artifacts::from_config(config.log_data, &config.dump_dir))
        .with_abort(token);

    let outcome = runner.run_plan(&default_plan());
    runner.finalize();

    let mut out = io::stdout().lock();
    writeln!(out, "\n\nPOWER TEST RESULTS")?;
    for result in runner.ledger().results() {
        writeln!(out, "  {result}")?;
    }
    let summary = runner.ledger().summary();
    writeln!(out, "{summary}")?;

    outcome.context("test run stopped")?;
    if !summary.all_passed() {
        bail!("{} of {} tests failed", summary.failed, summary.total());
    }
    Ok(summary)
}

/// Prints measurements decimated to `options.hz`, one per line, until the
/// requested count is reached or the monitor stops delivering.
///
/// The monitor is always closed on return. Returns the number of lines
/// written.
pub fn stream<M, W>(monitor: &mut M, options: &StreamOptions, mut out: W) -> anyhow::Result<u64>
where
    M: PowerMonitor + ?Sized,
    W: Write,
{
    monitor.stop_collection();
    let result = stream_measurements(monitor, options, &mut out);
    monitor.stop_collection();
    monitor.close();
    result
}

fn stream_measurements<M, W>(monitor: &mut M, options: &StreamOptions, out: &mut W) -> anyhow::Result<u64>
where
    M: PowerMonitor + ?Sized,
    W: Write,
{
    let status = monitor.status().context("power monitor did not report its status")?;
    let native_rate_hz = status
        .native_rate_hz()
        .ok_or_else(|| anyhow!("invalid native rate {} kHz", status.sample_rate_khz))?;
    if RateConverter::exceeds_native(native_rate_hz, options.hz) {
        warn!(
            requested = options.hz,
            native = native_rate_hz,
            "requested rate exceeds native rate, streaming at native rate"
        );
    }
    let mut converter = RateConverter::new(native_rate_hz, options.hz, DecimationMode::Exact)?;
    let mut average = options.average_over.map(RollingAverage::new);
    let reached = |written: u64| options.samples.is_some_and(|limit| written >= limit);

    let mut written = 0;
    let mut last_flush = Instant::now();
    monitor.start_collection();

    'pull: while !reached(written) {
        let Some(batch) = monitor.collect().filter(|batch| !batch.is_empty()) else {
            debug!(written, "monitor stopped delivering samples");
            break;
        };
        converter.push(&batch);

        for value in converter.ready() {
            if reached(written) {
                break 'pull;
            }
            if options.timestamp {
                write!(out, "{} ", unix_seconds())?;
            }
            match average.as_mut() {
                Some(average) => writeln!(out, "{value:.6} {:.6}", average.push(value))?,
                None => writeln!(out, "{value:.6}")?,
            }
            written += 1;
        }

        if last_flush.elapsed() >= STREAM_FLUSH_INTERVAL {
            out.flush()?;
            last_flush = Instant::now();
        }
    }

    out.flush()?;
    info!(written, "stream finished");
    Ok(written)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Prints every status field as `name: value`, sorted by name.
pub fn status<M, W>(monitor: &mut M, mut out: W) -> anyhow::Result<()>
where
    M: PowerMonitor + ?Sized,
    W: Write,
{
    let status = monitor.status();
    monitor.close();
    let status = status.context("power monitor did not report its status")?;

    for (name, value) in status.sorted_fields() {
        writeln!(out, "{name}: {value}")?;
    }
    out.flush()?;
    Ok(())
}

/// Applies output changes. A voltage change must be confirmed with `Y` on
/// `input`. The monitor is always closed on return.
pub fn set<M, R, W>(monitor: &mut M, options: &SetOptions, input: R, mut out: W) -> anyhow::Result<()>
where
    M: PowerMonitor + ?Sized,
    R: BufRead,
    W: Write,
{
    let result = apply_settings(monitor, options, input, &mut out);
    monitor.close();
    result
}

fn apply_settings<M, R, W>(monitor: &mut M, options: &SetOptions, mut input: R, out: &mut W) -> anyhow::Result<()>
where
    M: PowerMonitor + ?Sized,
    R: BufRead,
    W: Write,
{
    let usb = options
        .usb
        .as_deref()
        .map(|tag| {
            UsbPassthrough::from_tag(tag)
                .ok_or_else(|| anyhow!("invalid --usb value `{tag}`, expected on, off or auto"))
        })
        .transpose()?;

    if let Some(volts) = options.voltage {
        if volts > HIGH_VOLTAGE_WARNING {
            writeln!(out, "!!WARNING: Voltage higher than typical values!!!")?;
        }
        write!(out, "Voltage of {volts:.3} requested.  Confirm this is correct (Y/N)")?;
        out.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer).context("unable to read confirmation")?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            bail!("voltage change not confirmed, aborting");
        }
        info!(volts, "setting output voltage");
        monitor.set_voltage(volts);
    }

    if let Some(amps) = options.current {
        info!(amps, "setting maximum current");
        monitor.set_max_current(amps);
    }

    if let Some(mode) = usb {
        info!(%mode, "setting usb passthrough");
        monitor.set_usb_passthrough(mode);
    }
    Ok(())
}
