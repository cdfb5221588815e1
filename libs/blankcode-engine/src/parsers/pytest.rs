use super::{strip_ansi, ResultCollector};
use blankcode_common::types::TestResult;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // test_solution.py::test_add PASSED    [ 50%]
    static ref VERBOSE_LINE: Regex = Regex::new(
        r"^(\S+?::.+?)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(?:\s+\[\s*\d+%\])?\s*$"
    )
    .unwrap();
    // FAILED test_solution.py::test_add - AssertionError
    static ref SUMMARY_LINE: Regex =
        Regex::new(r"^(PASSED|FAILED|ERROR)\s+(\S+?::\S+)(?:\s+-\s+(.*))?\s*$").unwrap();
    // ______________ test_add ______________
    static ref SECTION_HEADER: Regex = Regex::new(r"^_{3,}\s+(.+?)\s+_{3,}\s*$").unwrap();
    static ref RULE_LINE: Regex = Regex::new(r"^={3,}").unwrap();
}

enum Marker<'a> {
    Verbose { nodeid: &'a str, status: &'a str },
    Summary { nodeid: &'a str, status: &'a str, reason: Option<&'a str> },
}

fn marker(line: &str) -> Option<Marker<'_>> {
    if let Some(caps) = SUMMARY_LINE.captures(line) {
        return Some(Marker::Summary {
            status: caps.get(1)?.as_str(),
            nodeid: caps.get(2)?.as_str(),
            reason: caps.get(3).map(|m| m.as_str()),
        });
    }
    let caps = VERBOSE_LINE.captures(line)?;
    Some(Marker::Verbose {
        nodeid: caps.get(1)?.as_str(),
        status: caps.get(2)?.as_str(),
    })
}

/// `test_solution.py::TestCalc::test_add` -> `TestCalc::test_add`
fn test_name(nodeid: &str) -> &str {
    nodeid.split_once("::").map(|(_, rest)| rest).unwrap_or(nodeid)
}

/// Failure section headers use dots where node ids use `::`.
fn section_key(name: &str) -> String {
    name.replace("::", ".")
}

fn verdict(status: &str) -> Option<bool> {
    match status {
        "PASSED" => Some(true),
        "FAILED" | "ERROR" => Some(false),
        _ => None,
    }
}

/// Parse pytest `-v --tb=short` output.
///
/// Failure sections (`___ name ___` blocks) are collected first, then the
/// verbose and short-summary markers establish the ordered result list and
/// each failing test picks up its section as detail.
pub fn parse_pytest_output(output: &str) -> Vec<TestResult> {
    let output = strip_ansi(output);
    let sections = failure_sections(&output);

    let mut collector = ResultCollector::new();
    let mut reasons: Vec<(usize, String)> = Vec::new();

    for line in output.lines() {
        let Some(found) = marker(line) else {
            continue;
        };
        let (nodeid, status, reason) = match found {
            Marker::Verbose { nodeid, status } => (nodeid, status, None),
            Marker::Summary { nodeid, status, reason } => (nodeid, status, reason),
        };
        let Some(passed) = verdict(status) else {
            continue;
        };
        let slot = collector.record(test_name(nodeid), passed, 0);
        if let Some(reason) = reason {
            reasons.push((slot, reason.to_string()));
        }
    }

    for (key, lines) in &sections {
        let Some(slot) = section_slot(&collector, key) else {
            continue;
        };
        for line in lines {
            collector.add_detail(slot, line);
        }
    }

    for (slot, reason) in reasons {
        if !collector.has_detail(slot) {
            collector.set_message(slot, &reason);
        }
    }

    collector.finish()
}

fn section_slot(collector: &ResultCollector, key: &str) -> Option<usize> {
    collector.slot(key).or_else(|| {
        collector
            .names()
            .find(|(name, _)| section_key(name) == key)
            .map(|(_, slot)| slot)
    })
}

/// Header name -> body lines of each failure/error section.
fn failure_sections(output: &str) -> Vec<(String, Vec<String>)> {
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    let mut open = false;

    for line in output.lines() {
        if let Some(caps) = SECTION_HEADER.captures(line) {
            let header = caps[1].trim();
            let name = header
                .strip_prefix("ERROR at setup of ")
                .or_else(|| header.strip_prefix("ERROR at teardown of "))
                .unwrap_or(header);
            sections.push((name.to_string(), Vec::new()));
            open = true;
            continue;
        }
        if RULE_LINE.is_match(line) || marker(line).is_some() {
            open = false;
            continue;
        }
        if open {
            if let Some((_, lines)) = sections.last_mut() {
                lines.push(line.to_string());
            }
        }
    }
    sections
}
