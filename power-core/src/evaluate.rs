//! Reduction of a measurement window to a pass/fail verdict.

use core::fmt;

use crate::report::Verdict;

/// Arithmetic mean, `None` for an empty slice.
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Window statistics plus the verdict they imply.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub average: f64,
    pub background: f64,
    pub delta: f64,
    pub stddev: f64,
    pub peak: f64,
}

impl Evaluation {
    /// Operator and DUT facing summary, currents in milliamps.
    pub fn message(&self) -> String {
        let headline = if self.verdict == Verdict::Pass {
            "Draw is within limits."
        } else {
            "Draw is too high."
        };
        format!(
            "{headline} Current:{:.6} Background:{:.6}   Measured: {:.6} Stddev: {:.6}  Peak: {:.6}",
            self.delta * 1000.0,
            self.background * 1000.0,
            self.average * 1000.0,
            self.stddev * 1000.0,
            self.peak * 1000.0,
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvaluateError {
    EmptyWindow,
}

impl fmt::Display for EvaluateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cannot evaluate an empty measurement window")
    }
}

impl std::error::Error for EvaluateError {}

/// Evaluates `measurements` against `background`: passes iff the increase
/// in average draw is at most `threshold` amps.
///
/// `stddev` is the population standard deviation and `peak` the distance of
/// the largest measurement above the average.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate(
    measurements: &[f64],
    background: f64,
    threshold: f64,
) -> Result<Evaluation, EvaluateError> {
    let average = mean(measurements).ok_or(EvaluateError::EmptyWindow)?;
    let variance = measurements
        .iter()
        .map(|value| (value - average).powi(2))
        .sum::<f64>()
        / measurements.len() as f64;
    let max = measurements.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let delta = average - background;

    Ok(Evaluation {
        verdict: if delta <= threshold {
            Verdict::Pass
        } else {
            Verdict::Fail
        },
        average,
        background,
        delta,
        stddev: variance.sqrt(),
        peak: max - average,
    })
}
