use super::{strip_ansi, ResultCollector};
use blankcode_common::types::TestResult;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TEST_LINE: Regex =
        Regex::new(r"^test (.+?) \.\.\. (ok|FAILED|ignored)(?:,? <(\d+(?:\.\d+)?)s>)?\s*$").unwrap();
    static ref STDOUT_BLOCK: Regex = Regex::new(r"^---- (.+?) std(?:out|err) ----\s*$").unwrap();
    static ref FOOTER: Regex =
        Regex::new(r"^\s*(?:failures:|test result:|Running\s|Doc-tests\s|running \d+ tests?)").unwrap();
}

/// Parse libtest output as printed by `cargo test`.
///
/// `---- name stdout ----` blocks in the failures section carry the panic
/// message and become the failing test's detail.
pub fn parse_cargo_output(output: &str) -> Vec<TestResult> {
    let output = strip_ansi(output);
    let mut collector = ResultCollector::new();
    let mut current: Option<usize> = None;

    for line in output.lines() {
        if let Some(caps) = TEST_LINE.captures(line) {
            current = None;
            let passed = match &caps[2] {
                "ok" => true,
                "FAILED" => false,
                _ => continue,
            };
            let duration = super::duration_ms(caps.get(3).map(|m| m.as_str()), true);
            collector.record(caps[1].trim(), passed, duration);
            continue;
        }
        if let Some(caps) = STDOUT_BLOCK.captures(line) {
            let name = caps[1].trim();
            current = Some(match collector.slot(name) {
                Some(slot) => slot,
                None => collector.record(name, false, 0),
            });
            continue;
        }
        if FOOTER.is_match(line) {
            current = None;
            continue;
        }
        if let Some(slot) = current {
            if line.starts_with("note: run with `RUST_BACKTRACE") {
                continue;
            }
            collector.add_detail(slot, line);
        }
    }

    collector.finish()
}
