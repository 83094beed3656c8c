//! Sensor catalog and the default test plan.
//!
//! Each sensor is tested twice: once while the device is moved by the
//! operator and once while it rests. The plan runs every motion test first so
//! the operator is only needed during the first half of the run.

use core::fmt;

/// Scenario a sensor is measured in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Scenario {
    Still,
    UnderMotion,
}

impl Scenario {
    /// Label used in test names and artifact file names.
    pub const fn label(self) -> &'static str {
        match self {
            Scenario::Still => "Still",
            Scenario::UnderMotion => "Under_Motion",
        }
    }

    pub const fn requires_motion(self) -> bool {
        matches!(self, Scenario::UnderMotion)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maximum allowed increase in current draw, in amps.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct Threshold(pub f64);

impl Threshold {
    pub const fn amps(self) -> f64 {
        self.0
    }
}

/// Default per-sensor threshold.
pub const DEFAULT_THRESHOLD: Threshold = Threshold(0.08);

/// Prompt shown for sensors that react to general device motion.
pub const GENERIC_MOTION_PROMPT: &str = "===> Please press Next and when the screen is off, keep the device under motion with only tiny, slow movements until the screen turns on again. Please refrain from interacting with the screen or pressing any side buttons while measurements are taken.";

/// Prompt shown for step sensors.
pub const STEP_MOTION_PROMPT: &str = "===> Please press Next and when the screen is off, then move the device to simulate step motion until the screen turns on again. Please refrain from interacting with the screen or pressing any side buttons while measurements are taken.";

/// Static description of a sensor under test.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SensorSpec {
    pub name: &'static str,
    pub threshold: Threshold,
    pub motion_prompt: &'static str,
}

pub const SIGNIFICANT_MOTION: SensorSpec = SensorSpec {
    name: "SIGNIFICANT_MOTION",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: GENERIC_MOTION_PROMPT,
};

pub const STEP_DETECTOR: SensorSpec = SensorSpec {
    name: "STEP_DETECTOR",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: STEP_MOTION_PROMPT,
};

pub const STEP_COUNTER: SensorSpec = SensorSpec {
    name: "STEP_COUNTER",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: STEP_MOTION_PROMPT,
};

pub const ACCELEROMETER: SensorSpec = SensorSpec {
    name: "ACCELEROMETER",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: GENERIC_MOTION_PROMPT,
};

pub const MAGNETIC_FIELD: SensorSpec = SensorSpec {
    name: "MAGNETIC_FIELD",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: GENERIC_MOTION_PROMPT,
};

pub const GYROSCOPE: SensorSpec = SensorSpec {
    name: "GYROSCOPE",
    threshold: DEFAULT_THRESHOLD,
    motion_prompt: GENERIC_MOTION_PROMPT,
};

/// Every sensor the harness knows about.
pub const SENSOR_CATALOG: [SensorSpec; 6] = [
    SIGNIFICANT_MOTION,
    STEP_DETECTOR,
    STEP_COUNTER,
    ACCELEROMETER,
    MAGNETIC_FIELD,
    GYROSCOPE,
];

/// Looks up a catalog entry by its DUT name.
pub fn sensor_by_name(name: &str) -> Option<&'static SensorSpec> {
    SENSOR_CATALOG.iter().find(|sensor| sensor.name == name)
}

/// One sensor/scenario pair to run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlannedTest {
    pub sensor: SensorSpec,
    pub scenario: Scenario,
}

impl PlannedTest {
    pub const fn new(sensor: SensorSpec, scenario: Scenario) -> Self {
        Self { sensor, scenario }
    }

    /// Name the DUT knows the test by, e.g. `GYROSCOPE_Power_Test_While_Still`.
    pub fn test_name(&self) -> String {
        format!(
            "{}_Power_Test_While_{}",
            self.sensor.name,
            self.scenario.label()
        )
    }

    /// Prompt for the operator, present only for motion scenarios.
    pub fn motion_prompt(&self) -> Option<&'static str> {
        self.scenario
            .requires_motion()
            .then_some(self.sensor.motion_prompt)
    }
}

/// Message shown on the DUT once the harness is connected.
pub const CONNECTED_MESSAGE: &str = "Connected.  Running tests...";

/// The full plan: every sensor under motion, then every sensor still.
pub fn default_plan() -> Vec<PlannedTest> {
    let under_motion = SENSOR_CATALOG
        .iter()
        .map(|sensor| PlannedTest::new(*sensor, Scenario::UnderMotion));
    let still = [
        ACCELEROMETER,
        MAGNETIC_FIELD,
        GYROSCOPE,
        SIGNIFICANT_MOTION,
        STEP_DETECTOR,
        STEP_COUNTER,
    ]
    .into_iter()
    .map(|sensor| PlannedTest::new(sensor, Scenario::Still));

    under_motion.chain(still).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_runs_motion_tests_first() {
        let plan = default_plan();
        let names: Vec<String> = plan.iter().map(PlannedTest::test_name).collect();

        assert_eq!(plan.len(), 12);
        assert_eq!(names[0], "SIGNIFICANT_MOTION_Power_Test_While_Under_Motion");
        assert_eq!(names[5], "GYROSCOPE_Power_Test_While_Under_Motion");
        assert_eq!(names[6], "ACCELEROMETER_Power_Test_While_Still");
        assert_eq!(names[11], "STEP_COUNTER_Power_Test_While_Still");
        assert!(plan[..6].iter().all(|test| test.motion_prompt().is_some()));
        assert!(plan[6..].iter().all(|test| test.motion_prompt().is_none()));
    }

    #[test]
    fn step_sensors_use_step_prompt() {
        let step = PlannedTest::new(STEP_COUNTER, Scenario::UnderMotion);
        let gyro = PlannedTest::new(GYROSCOPE, Scenario::UnderMotion);

        assert_eq!(step.motion_prompt(), Some(STEP_MOTION_PROMPT));
        assert_eq!(gyro.motion_prompt(), Some(GENERIC_MOTION_PROMPT));
    }

    #[test]
    fn catalog_lookup() {
        assert_eq!(sensor_by_name("GYROSCOPE"), Some(&GYROSCOPE));
        assert!(sensor_by_name("BAROMETER").is_none());
        assert!(SENSOR_CATALOG.iter().all(|s| s.threshold == DEFAULT_THRESHOLD));
    }

    #[test]
    fn prompts_are_single_line() {
        assert!(!GENERIC_MOTION_PROMPT.contains('\n'));
        assert!(!STEP_MOTION_PROMPT.contains('\n'));
    }
}
