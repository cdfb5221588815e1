use super::{extract_error_with, Capture, Fallback, LanguageExecutor, RunMode};
use crate::parsers::parse_cargo_output;
use crate::sandbox::{Layout, SandboxCommand};
use crate::workspace::FileSet;
use blankcode_common::types::{ExecutionContext, TestResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FN_MAIN: Regex =
        Regex::new(r"(?m)^\s*(?:pub\s+)?(?:async\s+)?fn\s+main\s*\(\s*\)").unwrap();
    static ref ERROR_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)error\[E\d+\]: (.+)").unwrap(),
        Regex::new(r"(?i)error: (.+)").unwrap(),
        Regex::new(r"(?i)cannot find (.+)").unwrap(),
        Regex::new(r"(?i)expected (.+), found (.+)").unwrap(),
    ];
}

const TOKIO_DEPENDENCY: &str =
    "tokio = { version = \"1.39.0\", features = [\"macros\", \"rt-multi-thread\", \"time\"] }";

// Dependency-free lockfile, so cargo never needs to write into a read-only
// workspace.
const EMPTY_LOCKFILE: &str = "# This file is automatically @generated by Cargo.
# It is not intended for manual editing.
version = 3

[[package]]
name = \"solution\"
version = \"0.1.0\"
";

#[derive(Debug, Clone, Copy, Default)]
pub struct RustExecutor;

/// Prepend `use solution::*;` unless the tests already use the crate.
pub fn auto_import(test_code: &str) -> String {
    if test_code.contains("use solution::") {
        return test_code.to_string();
    }
    format!("use solution::*;\n\n{}", test_code)
}

fn uses_tokio(ctx: &ExecutionContext) -> bool {
    ctx.code.contains("tokio::") || ctx.test_code.contains("tokio::")
}

/// Cargo.toml for the generated crate.
fn mentions_error(line: &str) -> bool {
    line.contains("error")
}

pub fn manifest(mode: RunMode, with_tokio: bool) -> String {
    let mut toml = String::from(
        "[package]\nname = \"solution\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    );
    if mode == RunMode::Test {
        toml.push_str("\n[lib]\npath = \"src/lib.rs\"\ndoctest = false\n");
        toml.push_str("\n[[test]]\nname = \"solution_test\"\npath = \"tests/solution_test.rs\"\n");
    }
    if with_tokio {
        toml.push_str("\n[dependencies]\n");
        toml.push_str(TOKIO_DEPENDENCY);
        toml.push('\n');
    }
    toml
}

impl LanguageExecutor for RustExecutor {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn mode(&self, ctx: &ExecutionContext) -> RunMode {
        if !ctx.has_tests() && FN_MAIN.is_match(&ctx.code) {
            RunMode::Program
        } else {
            RunMode::Test
        }
    }

    fn files(&self, ctx: &ExecutionContext, mode: RunMode) -> FileSet {
        let with_tokio = uses_tokio(ctx);
        let mut files = FileSet::new();
        files.insert("Cargo.toml".to_string(), manifest(mode, with_tokio));
        if !with_tokio {
            files.insert("Cargo.lock".to_string(), EMPTY_LOCKFILE.to_string());
        }
        match mode {
            RunMode::Program => {
                files.insert("src/main.rs".to_string(), ctx.code.clone());
            }
            RunMode::Test => {
                files.insert("src/lib.rs".to_string(), ctx.code.clone());
                files.insert(
                    "tests/solution_test.rs".to_string(),
                    auto_import(&ctx.test_code),
                );
            }
        }
        files
    }

    fn command(&self, mode: RunMode, layout: &Layout) -> SandboxCommand {
        let argv: &[&str] = match mode {
            RunMode::Test => &["cargo", "test", "--", "--test-threads=1"],
            RunMode::Program => &["cargo", "run", "--quiet"],
        };
        let command = SandboxCommand::new(argv.iter().copied())
            .env("CARGO_TARGET_DIR", layout.scratch_path("target"))
            .env("CARGO_TERM_COLOR", "never")
            .env("CARGO_INCREMENTAL", "0");
        if layout.isolated {
            command.env("CARGO_NET_OFFLINE", "true")
        } else {
            command
        }
    }

    fn parse(&self, output: &str) -> Vec<TestResult> {
        parse_cargo_output(output)
    }

    fn extract_error(&self, output: &str) -> String {
        extract_error_with(
            &ERROR_PATTERNS,
            Capture::WholeMatch,
            output,
            mentions_error,
            Fallback::First,
        )
    }
}
