use super::{extract_error_with, Capture, Fallback, LanguageExecutor, RunMode};
use crate::parsers::parse_go_test_output;
use crate::sandbox::{Layout, SandboxCommand};
use crate::workspace::FileSet;
use blankcode_common::types::{ExecutionContext, TestResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PACKAGE_DECL: Regex = Regex::new(r"(?m)^\s*package\s+([A-Za-z_]\w*)").unwrap();
    static ref FUNC_MAIN: Regex = Regex::new(r"(?m)^\s*func\s+main\s*\(\s*\)").unwrap();
    static ref ERROR_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)cannot find package (.+)").unwrap(),
        Regex::new(r"(?i)undefined: (.+)").unwrap(),
        Regex::new(r"(?i)syntax error: (.+)").unwrap(),
        Regex::new(r"(?i)cannot use (.+)").unwrap(),
        Regex::new(r"(?i)type (.+) has no field or method").unwrap(),
    ];
}

const GO_MOD: &str = "module solution\n\ngo 1.22\n";
const DEFAULT_PACKAGE: &str = "solution";

#[derive(Debug, Clone, Copy, Default)]
pub struct GoExecutor;

fn package_of(code: &str) -> Option<&str> {
    PACKAGE_DECL
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Ensure the source declares a package, defaulting to `package solution`.
pub fn normalize_package(code: &str) -> String {
    if package_of(code).is_some() {
        return code.to_string();
    }
    format!("package {}\n\n{}", DEFAULT_PACKAGE, code)
}

/// Put the tests in the same package as the solution.
pub fn normalize_test_package(code: &str, test_code: &str) -> String {
    if package_of(test_code).is_some() {
        return test_code.to_string();
    }
    let package = package_of(code).unwrap_or(DEFAULT_PACKAGE);
    format!("package {}\n\n{}", package, test_code)
}

fn is_program(code: &str) -> bool {
    package_of(code) == Some("main") && FUNC_MAIN.is_match(code)
}

fn not_package_header(line: &str) -> bool {
    !line.starts_with('#')
}

impl LanguageExecutor for GoExecutor {
    fn name(&self) -> &'static str {
        "go"
    }

    fn mode(&self, ctx: &ExecutionContext) -> RunMode {
        if !ctx.has_tests() && is_program(&ctx.code) {
            RunMode::Program
        } else {
            RunMode::Test
        }
    }

    fn files(&self, ctx: &ExecutionContext, mode: RunMode) -> FileSet {
        let mut files = FileSet::new();
        files.insert("go.mod".to_string(), GO_MOD.to_string());
        match mode {
            RunMode::Program => {
                files.insert("main.go".to_string(), ctx.code.clone());
            }
            RunMode::Test => {
                files.insert("solution.go".to_string(), normalize_package(&ctx.code));
                files.insert(
                    "solution_test.go".to_string(),
                    normalize_test_package(&ctx.code, &ctx.test_code),
                );
            }
        }
        files
    }

    fn command(&self, mode: RunMode, layout: &Layout) -> SandboxCommand {
        let argv: &[&str] = match mode {
            RunMode::Test => &["go", "test", "-v", "./..."],
            RunMode::Program => &["go", "run", "."],
        };
        SandboxCommand::new(argv.iter().copied())
            .env("HOME", layout.scratch_str())
            .env("GOCACHE", layout.scratch_path(".gocache"))
            .env("GOPATH", layout.scratch_path("go"))
            .env("GOFLAGS", "-mod=mod")
            .env("GOTOOLCHAIN", "local")
            .env("CGO_ENABLED", "0")
    }

    fn parse(&self, output: &str) -> Vec<TestResult> {
        parse_go_test_output(output)
    }

    fn extract_error(&self, output: &str) -> String {
        extract_error_with(&ERROR_PATTERNS, Capture::WholeMatch, output, not_package_header, Fallback::Last)
    }
}
