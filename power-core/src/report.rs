//! Test results and the per-run results ledger.

use core::fmt;

use heapless::Vec;

use crate::plan::Scenario;

/// Default number of results a [`ResultLedger`] can hold.
pub const LEDGER_CAPACITY: usize = 32;

/// Outcome reported to the DUT for one sensor/scenario pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Fail,
    Skipped,
}

impl Verdict {
    /// Wire token used in `SET TEST RESULT`.
    pub const fn as_token(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Skipped => "SKIPPED",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PASS" => Some(Verdict::Pass),
            "FAIL" => Some(Verdict::Fail),
            "SKIPPED" => Some(Verdict::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Final result of one test. Never mutated once recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct TestResult {
    pub test_name: String,
    pub sensor: &'static str,
    pub scenario: Scenario,
    pub verdict: Verdict,
    pub message: String,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.test_name, self.verdict, self.message)
    }
}

/// Counts per verdict.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LedgerSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl LedgerSummary {
    pub const fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    pub const fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests: {} passed, {} failed, {} skipped",
            self.total(),
            self.passed,
            self.failed,
            self.skipped
        )
    }
}

/// Returned when the ledger has no room for another result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LedgerFull;

impl fmt::Display for LedgerFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("results ledger is full")
    }
}

impl std::error::Error for LedgerFull {}

/// Bounded, append-only record of a run's results in execution order.
#[derive(Clone, Debug, Default)]
pub struct ResultLedger<const CAPACITY: usize = LEDGER_CAPACITY> {
    results: Vec<TestResult, CAPACITY>,
}

impl<const CAPACITY: usize> ResultLedger<CAPACITY> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: TestResult) -> Result<(), LedgerFull> {
        self.results.push(result).map_err(|_| LedgerFull)
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn latest(&self) -> Option<&TestResult> {
        self.results.last()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn summary(&self) -> LedgerSummary {
        self.results
            .iter()
            .fold(LedgerSummary::default(), |mut summary, result| {
                match result.verdict {
                    Verdict::Pass => summary.passed += 1,
                    Verdict::Fail => summary.failed += 1,
                    Verdict::Skipped => summary.skipped += 1,
                }
                summary
            })
    }
}
