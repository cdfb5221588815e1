/// Output Parsers - Runner Output to Uniform Test Results
///
/// One parser per runner dialect:
/// - `vitest`: JSON reporter payload, verbose text as fallback
/// - `pytest`: verbose markers, failure sections and short summary
/// - `gotest`: `go test -v` markers and RUN blocks
/// - `cargo`: libtest markers and `---- name stdout ----` blocks
///
/// Every parser is total and pure: malformed or partial output yields
/// whatever could be recognized, possibly nothing, never an error.

pub mod cargo;
pub mod gotest;
pub mod json;
pub mod pytest;
pub mod vitest;

pub use cargo::parse_cargo_output;
pub use gotest::parse_go_test_output;
pub use pytest::parse_pytest_output;
pub use vitest::parse_vitest_output;

use blankcode_common::types::TestResult;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;

lazy_static! {
    static ref ANSI_ESCAPE: Regex = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap();
}

/// Remove terminal color codes some runners emit even when told not to.
pub(crate) fn strip_ansi(output: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(output, "")
}

/// Message used when a runner marks a test failed without any detail.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Test failed";

/// Ordered, name-deduplicated accumulation of test results.
///
/// The first occurrence of a name fixes its position and verdict. Later
/// occurrences can only contribute failure detail.
#[derive(Debug, Default)]
pub(crate) struct ResultCollector {
    results: Vec<TestResult>,
    details: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl ResultCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a test, returning its slot.
    pub(crate) fn record(&mut self, name: &str, passed: bool, duration: u64) -> usize {
        if let Some(&slot) = self.index.get(name) {
            return slot;
        }
        let slot = self.results.len();
        self.results.push(TestResult {
            name: name.to_string(),
            passed,
            message: None,
            duration,
        });
        self.details.push(Vec::new());
        self.index.insert(name.to_string(), slot);
        slot
    }

    pub(crate) fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.results
            .iter()
            .enumerate()
            .map(|(slot, r)| (r.name.as_str(), slot))
    }

    /// Set an explicit message unless one is already present.
    pub(crate) fn set_message(&mut self, slot: usize, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        if let Some(result) = self.results.get_mut(slot) {
            if result.message.is_none() {
                result.message = Some(message.to_string());
            }
        }
    }

    /// Append one detail line; blank lines are dropped.
    pub(crate) fn add_detail(&mut self, slot: usize, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(details) = self.details.get_mut(slot) {
            details.push(line.to_string());
        }
    }

    pub(crate) fn has_detail(&self, slot: usize) -> bool {
        self.details.get(slot).is_some_and(|d| !d.is_empty())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub(crate) fn finish(self) -> Vec<TestResult> {
        self.results
            .into_iter()
            .zip(self.details)
            .map(|(mut result, details)| {
                if result.passed {
                    result.message = None;
                } else if result.message.is_none() {
                    result.message = Some(if details.is_empty() {
                        DEFAULT_FAILURE_MESSAGE.to_string()
                    } else {
                        details.join("\n")
                    });
                }
                result
            })
            .collect()
    }
}

/// Parse a runner-reported duration into whole milliseconds.
pub(crate) fn duration_ms(raw: Option<&str>, seconds: bool) -> u64 {
    let Some(value) = raw.and_then(|r| r.trim().parse::<f64>().ok()) else {
        return 0;
    };
    let ms = if seconds { value * 1000.0 } else { value };
    if ms.is_finite() && ms > 0.0 {
        ms.round() as u64
    } else {
        0
    }
}
