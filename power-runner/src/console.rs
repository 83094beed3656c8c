//! Operator-facing progress output.

use std::io::{self, Write};

use crossterm::cursor::MoveUp;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use power_core::orchestrator::{MeasurementWindow, RunObserver, TestPhase};
use power_core::plan::PlannedTest;
use power_core::report::TestResult;
use tracing::debug;

const RULE: &str = "---------------------------------";
const BANNER: &str = "===========================================";
/// Measurement lines printed when the output cannot be rewritten in place.
const PLAIN_PROGRESS_EVERY: usize = 100;

/// [`RunObserver`] printing progress to a terminal (or any writer).
///
/// On an interactive terminal the measurement counter is rewritten in place;
/// otherwise only every hundredth measurement is printed.
pub struct Console<W: Write> {
    out: W,
    interactive: bool,
    /// Sensor of the test in progress.
    sensor: Option<&'static str>,
}

impl Console<io::Stdout> {
    pub fn stdout() -> Self {
        use crossterm::tty::IsTty;

        let out = io::stdout();
        let interactive = out.is_tty();
        Self::new(out, interactive)
    }
}

impl<W: Write> Console<W> {
    pub fn new(out: W, interactive: bool) -> Self {
        Self {
            out,
            interactive,
            sensor: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit<F>(&mut self, write: F)
    where
        F: FnOnce(&mut W, bool) -> io::Result<()>,
    {
        let result = write(&mut self.out, self.interactive).and_then(|()| self.out.flush());
        if let Err(error) = result {
            debug!(%error, "console write failed");
        }
    }
}

impl<W: Write> RunObserver for Console<W> {
    fn test_started(&mut self, test: &PlannedTest) {
        self.sensor = Some(test.sensor.name);
        self.emit(|out, _| {
            writeln!(out, "\n\n{RULE}")?;
            if test.scenario.requires_motion() {
                writeln!(out, "Running power test on {} under motion.", test.sensor.name)?;
            } else {
                writeln!(
                    out,
                    "Running power test on {} while device is still.",
                    test.sensor.name
                )?;
            }
            writeln!(out, "{RULE}")
        });
    }

    fn phase_changed(&mut self, phase: TestPhase) {
        let TestPhase::ScreenOffAndSuspended(window) = phase else {
            return;
        };
        let sensor = self.sensor.unwrap_or("unknown");
        self.emit(|out, _| {
            match window {
                MeasurementWindow::Background => writeln!(out, "Collecting background measurements...")?,
                MeasurementWindow::Active => writeln!(out, "Collecting sensor {sensor} measurements...")?,
            }
            writeln!(
                out,
                "Waiting for screen off and application processor in suspend mode..."
            )
        });
    }

    fn suspend_progress(&mut self, _attempt: u32, average_amps: f64) {
        self.emit(|out, _| {
            writeln!(
                out,
                "Current usage: {:.2} mAmps. Device is probably not in suspend mode.   Waiting...",
                average_amps * 1000.0
            )
        });
    }

    fn measurement(&mut self, _window: MeasurementWindow, index: usize, value: f64) {
        self.emit(|out, interactive| {
            if index == 0 {
                writeln!(out, "...Screen off and device in suspend mode.")?;
                writeln!(out, "Taking measurements...")?;
                if interactive {
                    writeln!(out)?;
                }
            }
            if interactive {
                queue!(out, MoveUp(1), Clear(ClearType::CurrentLine))?;
            } else if (index + 1) % PLAIN_PROGRESS_EVERY != 0 {
                return Ok(());
            }
            writeln!(out, "MEASURED[{}]: {value:.6}", index + 1)
        });
    }

    fn motion_requested(&mut self, _test: &PlannedTest) {
        self.emit(|out, _| {
            writeln!(out, "{BANNER}")?;
            writeln!(out, "==> Please follow the instructions presented on the device")?;
            writeln!(out, "{BANNER}")
        });
    }

    fn test_finished(&mut self, result: &TestResult) {
        self.emit(|out, _| {
            writeln!(out, "Test {} : {}", result.test_name, result.verdict)?;
            writeln!(out, "Result: {}", result.message)
        });
    }
}
