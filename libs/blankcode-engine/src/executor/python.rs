use super::{extract_error_with, keep_all, Capture, Fallback, LanguageExecutor, RunMode};
use crate::parsers::parse_pytest_output;
use crate::sandbox::{Layout, SandboxCommand};
use crate::workspace::FileSet;
use blankcode_common::types::{ExecutionContext, TestResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ERROR_PATTERNS: Vec<Regex> = [
        "SyntaxError",
        "IndentationError",
        "NameError",
        "TypeError",
        "ValueError",
        "ImportError",
        "AttributeError",
    ]
    .iter()
    .map(|kind| Regex::new(&format!(r"(?i){}: (.+)", kind)).unwrap())
    .collect();
}

const PYTEST_INI: &str = "[pytest]
testpaths = .
python_files = test_*.py
python_functions = test_*
addopts = -v --tb=short -p no:cacheprovider
";

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonExecutor;

/// Prepend `from solution import *` unless the tests import the module.
pub fn auto_import(test_code: &str) -> String {
    if test_code.contains("from solution import") || test_code.contains("import solution") {
        return test_code.to_string();
    }
    format!("from solution import *\n\n{}", test_code)
}

impl LanguageExecutor for PythonExecutor {
    fn name(&self) -> &'static str {
        "python"
    }

    fn files(&self, ctx: &ExecutionContext, _mode: RunMode) -> FileSet {
        FileSet::from([
            ("solution.py".to_string(), ctx.code.clone()),
            ("test_solution.py".to_string(), auto_import(&ctx.test_code)),
            ("pytest.ini".to_string(), PYTEST_INI.to_string()),
        ])
    }

    fn command(&self, _mode: RunMode, layout: &Layout) -> SandboxCommand {
        SandboxCommand::new(["pytest"])
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .env("HOME", layout.scratch_str())
    }

    fn parse(&self, output: &str) -> Vec<TestResult> {
        parse_pytest_output(output)
    }

    fn extract_error(&self, output: &str) -> String {
        extract_error_with(&ERROR_PATTERNS, Capture::FirstGroup, output, keep_all, Fallback::Last)
    }
}
