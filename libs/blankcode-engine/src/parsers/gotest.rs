use super::{duration_ms, strip_ansi, ResultCollector};
use blankcode_common::types::TestResult;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref RESULT_LINE: Regex =
        Regex::new(r"^\s*--- (PASS|FAIL|SKIP): (\S+) \((\d+(?:\.\d+)?)s\)").unwrap();
    static ref RUN_LINE: Regex = Regex::new(r"^=== (RUN|CONT|NAME)\s+(\S+)").unwrap();
    static ref FOOTER: Regex =
        Regex::new(r"^(?:(?:FAIL|PASS|ok)(?:\s|$)|exit status \d+|coverage:|\?\s)").unwrap();
}

/// Parse `go test -v` output.
///
/// Output logged while a test runs (between `=== RUN` and its `--- FAIL`)
/// and indented lines after the marker both become the failure detail.
pub fn parse_go_test_output(output: &str) -> Vec<TestResult> {
    let output = strip_ansi(output);
    let mut collector = ResultCollector::new();
    let mut run_logs: HashMap<String, Vec<String>> = HashMap::new();
    let mut running: Option<String> = None;
    let mut failing: Option<usize> = None;

    for line in output.lines() {
        if let Some(caps) = RUN_LINE.captures(line) {
            let name = caps[2].to_string();
            run_logs.entry(name.clone()).or_default();
            running = Some(name);
            failing = None;
            continue;
        }
        if line.starts_with("=== ") {
            running = None;
            failing = None;
            continue;
        }
        if let Some(caps) = RESULT_LINE.captures(line) {
            running = None;
            failing = None;
            let name = &caps[2];
            let duration = duration_ms(caps.get(3).map(|m| m.as_str()), true);
            match &caps[1] {
                "PASS" => {
                    collector.record(name, true, duration);
                }
                "FAIL" => {
                    let slot = collector.record(name, false, duration);
                    for logged in run_logs.remove(name).unwrap_or_default() {
                        collector.add_detail(slot, &logged);
                    }
                    failing = Some(slot);
                }
                _ => {}
            }
            continue;
        }
        if FOOTER.is_match(line) {
            running = None;
            failing = None;
            continue;
        }
        if let Some(slot) = failing {
            collector.add_detail(slot, line);
        } else if let Some(name) = &running {
            if let Some(logs) = run_logs.get_mut(name) {
                logs.push(line.to_string());
            }
        }
    }

    collector.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_then_pass() {
        let output = "--- FAIL: TestSum (0.00s)\n    sum_test.go:12: expected 4 got 3\n--- PASS: TestZero (0.00s)\nFAIL";
        let results = parse_go_test_output(output);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "TestSum");
        assert!(!results[0].passed);
        assert!(results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("expected 4 got 3"));
        assert_eq!(results[0].duration, 0);
        assert_eq!(results[1].name, "TestZero");
        assert!(results[1].passed);
        assert_eq!(results[1].message, None);
        assert_eq!(results[1].duration, 0);
    }

    #[test]
    fn test_run_block_detail_and_subtests() {
        let output = r#"=== RUN   TestSum
    solution_test.go:8: Sum(1, 2) = 4; want 3
--- FAIL: TestSum (0.01s)
=== RUN   TestTable
=== RUN   TestTable/zero
=== RUN   TestTable/neg
    solution_test.go:20: got -2
--- FAIL: TestTable (0.00s)
    --- PASS: TestTable/zero (0.00s)
    --- FAIL: TestTable/neg (0.00s)
=== RUN   TestSkip
    solution_test.go:30: not yet
--- SKIP: TestSkip (0.00s)
FAIL
exit status 1
FAIL	solution	0.004s"#;
        let results = parse_go_test_output(output);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["TestSum", "TestTable", "TestTable/zero", "TestTable/neg"]);
        assert_eq!(results[0].duration, 10);
        assert_eq!(
            results[0].message.as_deref(),
            Some("solution_test.go:8: Sum(1, 2) = 4; want 3")
        );
        assert!(results[2].passed);
        assert_eq!(
            results[3].message.as_deref(),
            Some("solution_test.go:20: got -2")
        );
    }

    #[test]
    fn test_parallel_logs_follow_name_headers() {
        let output = r#"=== RUN   TestA
=== PAUSE TestA
=== RUN   TestB
=== PAUSE TestB
=== CONT  TestA
=== CONT  TestB
=== NAME  TestA
    a_test.go:5: a went wrong
=== NAME  TestB
    b_test.go:9: b went wrong
--- FAIL: TestB (0.00s)
--- FAIL: TestA (0.00s)
FAIL"#;
        let results = parse_go_test_output(output);
        let message = |name: &str| {
            results
                .iter()
                .find(|r| r.name == name)
                .and_then(|r| r.message.clone())
        };
        assert_eq!(results.len(), 2);
        assert_eq!(message("TestA").as_deref(), Some("a_test.go:5: a went wrong"));
        assert_eq!(message("TestB").as_deref(), Some("b_test.go:9: b went wrong"));
    }

    #[test]
    fn test_build_failure_has_no_results() {
        let output = "# solution [solution.test]\n./solution.go:3:9: undefined: foo\nFAIL\tsolution [build failed]";
        assert!(parse_go_test_output(output).is_empty());
    }
}
