//! Raw measurement dumps written next to the run.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use power_core::orchestrator::{ArtifactSink, MeasurementWindow};
use power_core::plan::PlannedTest;
use tracing::debug;

/// File name used for one window of one test.
pub fn artifact_name(test: &PlannedTest, window: MeasurementWindow) -> String {
    format!(
        "cts-power-tests-{}-{}-{}-data.log",
        test.sensor.name,
        test.scenario.label(),
        window.label()
    )
}

/// Writes one `%.4f` value per line.
pub fn write_measurements<W: Write>(mut out: W, measurements: &[f64]) -> io::Result<()> {
    for value in measurements {
        writeln!(out, "{value:.4}")?;
    }
    out.flush()
}

/// [`ArtifactSink`] writing every window into a directory.
#[derive(Clone, Debug)]
pub struct FileArtifacts {
    dir: PathBuf,
}

impl FileArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for FileArtifacts {
    fn store(
        &mut self,
        test: &PlannedTest,
        window: MeasurementWindow,
        measurements: &[f64],
    ) -> io::Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(artifact_name(test, window));
        write_measurements(BufWriter::new(File::create(&path)?), measurements)?;
        debug!(path = %path.display(), count = measurements.len(), "measurements written");
        Ok(Some(path))
    }
}

/// [`ArtifactSink`] used when data logging is disabled.
#[derive(Copy, Clone, Debug, Default)]
pub struct Disabled;

impl ArtifactSink for Disabled {
    fn store(&mut self, _: &PlannedTest, _: MeasurementWindow, _: &[f64]) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Either sink, chosen at start-up from configuration.
#[derive(Clone, Debug)]
pub enum Artifacts {
    Files(FileArtifacts),
    Disabled(Disabled),
}

impl Artifacts {
    pub fn from_config(enabled: bool, dir: &Path) -> Self {
        if enabled {
            Artifacts::Files(FileArtifacts::new(dir))
        } else {
            Artifacts::Disabled(Disabled)
        }
    }
}

impl ArtifactSink for Artifacts {
    fn store(
        &mut self,
        test: &PlannedTest,
        window: MeasurementWindow,
        measurements: &[f64],
    ) -> io::Result<Option<PathBuf>> {
        match self {
            Artifacts::Files(files) => files.store(test, window, measurements),
            Artifacts::Disabled(disabled) => disabled.store(test, window, measurements),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use power_core::plan::{MAGNETIC_FIELD, Scenario};

    #[test]
    fn names_follow_sensor_scenario_and_window() {
        let test = PlannedTest::new(MAGNETIC_FIELD, Scenario::UnderMotion);
        assert_eq!(
            artifact_name(&test, MeasurementWindow::Background),
            "cts-power-tests-MAGNETIC_FIELD-Under_Motion-background-data.log"
        );
        assert_eq!(
            artifact_name(&test, MeasurementWindow::Active),
            "cts-power-tests-MAGNETIC_FIELD-Under_Motion-sensor-data.log"
        );
    }

    #[test]
    fn values_use_four_decimals() {
        let mut out = Vec::new();
        write_measurements(&mut out, &[0.0123456, 1.0]).expect("in-memory write");
        assert_eq!(String::from_utf8(out).expect("ascii output"), "0.0123\n1.0000\n");
    }

    #[test]
    fn files_land_in_the_dump_directory() {
        let dir = std::env::temp_dir().join(format!("power-runner-artifacts-{}", std::process::id()));
        let mut sink = FileArtifacts::new(&dir);
        let test = PlannedTest::new(MAGNETIC_FIELD, Scenario::Still);

        let path = sink
            .store(&test, MeasurementWindow::Active, &[0.02, 0.03])
            .expect("temp dir is writable")
            .expect("file sink always reports a path");

        assert_eq!(path, dir.join("cts-power-tests-MAGNETIC_FIELD-Still-sensor-data.log"));
        assert_eq!(fs::read_to_string(&path).expect("file exists"), "0.0200\n0.0300\n");
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let mut sink = Artifacts::from_config(false, Path::new("/nonexistent"));
        let test = PlannedTest::new(MAGNETIC_FIELD, Scenario::Still);
        assert!(sink.store(&test, MeasurementWindow::Background, &[0.1]).expect("no io").is_none());
    }
}
