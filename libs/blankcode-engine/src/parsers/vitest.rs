use super::json::decode_embedded;
use super::{duration_ms, strip_ansi, ResultCollector};
use blankcode_common::types::TestResult;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

const REPORT_MARKER: &str = "\"testResults\"";

lazy_static! {
    static ref PASS_LINE: Regex =
        Regex::new(r"^\s*[✓√✔]\s+(.+?)(?:\s+\(?(\d+(?:\.\d+)?)\s*ms\)?)?\s*$").unwrap();
    static ref FAIL_LINE: Regex =
        Regex::new(r"^\s*[✗×✕]\s+(.+?)(?:\s+\(?(\d+(?:\.\d+)?)\s*ms\)?)?\s*$").unwrap();
    static ref FAIL_SECTION: Regex = Regex::new(r"^\s*FAIL\s+(.+?)\s*$").unwrap();
    static ref SKIP_LINE: Regex = Regex::new(r"^\s*[↓○]\s+").unwrap();
    // " ✓ solution.test.ts (3 tests) 4ms" summarizes a file, not a test.
    static ref FILE_LINE: Regex = Regex::new(r"\(\d+ tests?[^)]*\)\s*(?:\d+(?:\.\d+)?\s*ms)?\s*$").unwrap();
    static ref FOOTER: Regex =
        Regex::new(r"^\s*(?:Test Files|Tests|Duration|Start at|Snapshots|Type Errors)\s").unwrap();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VitestReport {
    #[serde(default)]
    test_results: Vec<VitestFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VitestFile {
    #[serde(default)]
    assertion_results: Vec<VitestAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VitestAssertion {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    failure_messages: Vec<String>,
}

impl VitestAssertion {
    fn display_name(&self) -> Option<&str> {
        [&self.full_name, &self.title, &self.name]
            .into_iter()
            .filter_map(|n| n.as_deref())
            .map(str::trim)
            .find(|n| !n.is_empty())
    }

    fn verdict(&self) -> Option<bool> {
        match self.status.as_str() {
            "passed" | "pass" => Some(true),
            "failed" | "fail" => Some(false),
            // skipped, pending, todo
            _ => None,
        }
    }
}

/// Parse Vitest output: the JSON reporter payload when it can be located
/// and decoded, otherwise the verbose text reporter.
pub fn parse_vitest_output(output: &str) -> Vec<TestResult> {
    if let Some(report) = decode_embedded::<VitestReport>(output, REPORT_MARKER) {
        let results = from_report(&report);
        if !results.is_empty() {
            return results;
        }
    }
    parse_text(&strip_ansi(output))
}

fn from_report(report: &VitestReport) -> Vec<TestResult> {
    let mut collector = ResultCollector::new();
    for assertion in report.test_results.iter().flat_map(|f| &f.assertion_results) {
        let (Some(name), Some(passed)) = (assertion.display_name(), assertion.verdict()) else {
            continue;
        };
        let duration = assertion
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u64)
            .unwrap_or(0);
        let slot = collector.record(name, passed, duration);
        if !passed {
            collector.set_message(slot, &assertion.failure_messages.join("\n"));
        }
    }
    collector.finish()
}

fn parse_text(output: &str) -> Vec<TestResult> {
    let mut collector = ResultCollector::new();
    let mut current: Option<usize> = None;

    for line in output.lines() {
        if FOOTER.is_match(line) || line.trim_start().starts_with('⎯') {
            current = None;
            continue;
        }
        if let Some(caps) = PASS_LINE.captures(line) {
            current = None;
            if !FILE_LINE.is_match(line) {
                let duration = duration_ms(caps.get(2).map(|m| m.as_str()), false);
                collector.record(caps[1].trim(), true, duration);
            }
            continue;
        }
        if let Some(caps) = FAIL_LINE.captures(line) {
            if FILE_LINE.is_match(line) {
                current = None;
                continue;
            }
            let duration = duration_ms(caps.get(2).map(|m| m.as_str()), false);
            current = Some(collector.record(caps[1].trim(), false, duration));
            continue;
        }
        if let Some(caps) = FAIL_SECTION.captures(line) {
            current = Some(failure_section_slot(&mut collector, caps[1].trim()));
            continue;
        }
        if SKIP_LINE.is_match(line) {
            current = None;
            continue;
        }
        if let Some(slot) = current {
            let trimmed = line.trim_start();
            if trimmed.starts_with('{') && trimmed.contains(REPORT_MARKER) {
                continue;
            }
            collector.add_detail(slot, line);
        }
    }

    collector.finish()
}

/// A " FAIL  file > suite > test" section names a test the verbose tree
/// may already have listed without the file prefix.
fn failure_section_slot(collector: &mut ResultCollector, name: &str) -> usize {
    if let Some(slot) = collector.slot(name) {
        return slot;
    }
    let mut suffix = name;
    while let Some((_, rest)) = suffix.split_once(" > ") {
        if let Some(slot) = collector.slot(rest) {
            return slot;
        }
        suffix = rest;
    }
    collector.record(name, false, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_report() {
        let output = r#"
> test-runner@1.0.0 test
> vitest run --reporter=json --reporter=verbose

{"numTotalTests":3,"numPassedTests":1,"numFailedTests":1,"success":false,"testResults":[{"name":"/app/solution.test.ts","status":"failed","assertionResults":[{"ancestorTitles":["sum"],"fullName":"sum adds {a, b}","title":"adds {a, b}","status":"passed","duration":1.6,"failureMessages":[]},{"ancestorTitles":["sum"],"fullName":"sum handles negatives","title":"handles negatives","status":"failed","duration":2,"failureMessages":["AssertionError: expected -1 to be 1"]},{"fullName":"sum later","title":"later","status":"skipped","failureMessages":[]}]}]}
 ✓ solution.test.ts > sum > adds {a, b} 2ms
 × solution.test.ts > sum > handles negatives 2ms
"#;
        let results = parse_vitest_output(output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "sum adds {a, b}");
        assert!(results[0].passed);
        assert_eq!(results[0].duration, 2);
        assert_eq!(results[0].message, None);
        assert!(!results[1].passed);
        assert_eq!(
            results[1].message.as_deref(),
            Some("AssertionError: expected -1 to be 1")
        );
    }

    #[test]
    fn test_short_status_spellings() {
        let output = r#"{"testResults":[{"assertionResults":[{"name":"a","status":"pass"},{"name":"b","status":"fail","failureMessages":[]}]}]}"#;
        let results = parse_vitest_output(output);
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].message.is_some());
    }

    #[test]
    fn test_text_failure_block() {
        let output = [
            "✗ adds numbers (4ms)",
            "AssertionError: expected 3 to be 4",
            "  at adds numbers (solution.test.ts:10:5)",
            "✓ handles zeros (2ms)",
            "Test Files  1 failed",
        ]
        .join("\n");

        let results = parse_vitest_output(&output);
        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert_eq!(results[0].duration, 4);
        let message = results[0].message.as_deref().unwrap();
        assert!(message.contains("AssertionError: expected 3 to be 4"));
        assert!(message.contains("at adds numbers"));
        assert!(results[1].passed);
        assert_eq!(results[1].message, None);
    }

    #[test]
    fn test_broken_json_falls_back_to_text() {
        let output = "{\"testResults\":[{\"assertionResults\":[{\"name\":\"a\"\n ✓ works 1ms\n × breaks 3ms\n   expected true to be false";
        let results = parse_vitest_output(output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "works");
        assert_eq!(results[1].name, "breaks");
        assert_eq!(results[1].message.as_deref(), Some("expected true to be false"));
    }

    #[test]
    fn test_failure_section_dedupes_with_verbose_line() {
        let output = [
            " ✓ solution.test.ts (2 tests | 1 failed) 5ms",
            "   × sum > adds 3ms",
            "   ✓ sum > zero 1ms",
            "⎯⎯⎯⎯⎯⎯⎯ Failed Tests 1 ⎯⎯⎯⎯⎯⎯⎯",
            " FAIL  solution.test.ts > sum > adds",
            "AssertionError: expected 3 to be 4",
            " ❯ solution.test.ts:5:20",
            "⎯⎯⎯⎯⎯⎯⎯[1/1]⎯",
            " Test Files  1 failed (1)",
            "      Tests  1 failed | 1 passed (2)",
        ]
        .join("\n");
        let results = parse_vitest_output(&output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "sum > adds");
        let message = results[0].message.as_deref().unwrap();
        assert!(message.contains("expected 3 to be 4"));
        assert!(message.contains("solution.test.ts:5:20"));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let output = r#"{"testResults":[{"assertionResults":[{"title":"x","status":"failed","failureMessages":["boom"]}]}]}"#;
        assert_eq!(parse_vitest_output(output), parse_vitest_output(output));
    }

    #[test]
    fn test_no_output() {
        assert!(parse_vitest_output("").is_empty());
        assert!(parse_vitest_output("Error: Cannot find module './solution'").is_empty());
    }
}
