// Shared logic for the sensor power-compliance harness.
//
// Everything that talks to hardware, the device bridge, the clock or the
// operator is behind a trait so the measurement engine and the control
// protocol can be driven by fakes in tests and by std implementations in
// `power-runner`.

pub mod channel;
pub mod collector;
pub mod evaluate;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod protocol;
pub mod rate;
pub mod report;
pub mod suspend;
