/// Language Executors - Per-Language Grading Glue
///
/// **Responsibility:**
/// Turn an `ExecutionContext` into a verdict:
/// 1. Assemble the language's workspace files (source normalization,
///    auto-imports, build manifest)
/// 2. Choose program mode or test mode
/// 3. Run the toolchain command through the `Sandbox`
/// 4. Interpret the raw output with the matching parser
///
/// Each language implements `LanguageExecutor` (pure: files, command,
/// parser, error heuristics). `ExecutionEngine` owns the side effects and
/// is total: every failure becomes an `error` result.

pub mod go;
pub mod javascript;
pub mod python;
pub mod rust;

pub use go::GoExecutor;
pub use javascript::{JavaScriptExecutor, JsFlavor};
pub use python::PythonExecutor;
pub use rust::RustExecutor;

use crate::parsers::strip_ansi;
use crate::sandbox::{Layout, Sandbox, SandboxCommand, SandboxOutput, SandboxRequest};
use crate::workspace::{FileSet, Workspace, WorkspaceManager};
use anyhow::{Context, Result};
use blankcode_common::config::ExecutionConfig;
use blankcode_common::types::{ExecutionContext, ExecutionResult, Language, TestResult};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

pub const TIMEOUT_MESSAGE: &str = "Execution timeout exceeded";

/// Name of the single result a successful program-mode run produces.
pub const PROGRAM_TEST_NAME: &str = "main";

/// Budget for dependency installation before a local run.
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);

const ERROR_FALLBACK_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run the hidden tests with the language's test runner.
    Test,
    /// Run the submission as a program; exit 0 is a pass.
    Program,
}

pub trait LanguageExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self, _ctx: &ExecutionContext) -> RunMode {
        RunMode::Test
    }

    /// Files to materialize, keyed by workspace-relative path.
    fn files(&self, ctx: &ExecutionContext, mode: RunMode) -> FileSet;

    fn command(&self, mode: RunMode, layout: &Layout) -> SandboxCommand;

    /// Preparation step for sandboxes that cannot ship a prepared toolchain
    /// image (local runs).
    fn setup(&self, _layout: &Layout) -> Option<SandboxCommand> {
        None
    }

    fn parse(&self, output: &str) -> Vec<TestResult>;

    /// Best-effort human-readable cause for a run that produced no results.
    fn extract_error(&self, output: &str) -> String;
}

/// What part of a matching error pattern becomes the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capture {
    FirstGroup,
    WholeMatch,
}

/// Which end of the output the unmatched fallback reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fallback {
    First,
    Last,
}

/// First matching pattern wins; otherwise a few non-empty lines that
/// `keep` accepts, taken from the end `fallback` names.
pub(crate) fn extract_error_with(
    patterns: &[Regex],
    capture: Capture,
    output: &str,
    keep: fn(&str) -> bool,
    fallback: Fallback,
) -> String {
    let output = strip_ansi(output);
    for pattern in patterns {
        if let Some(caps) = pattern.captures(&output) {
            let found = match capture {
                Capture::FirstGroup => caps.get(1).or_else(|| caps.get(0)),
                Capture::WholeMatch => caps.get(0),
            };
            if let Some(found) = found {
                let text = found.as_str().trim();
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }

    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && keep(l))
        .collect();
    let picked = match fallback {
        Fallback::First => &lines[..lines.len().min(ERROR_FALLBACK_LINES)],
        Fallback::Last => &lines[lines.len().saturating_sub(ERROR_FALLBACK_LINES)..],
    };
    if picked.is_empty() {
        "Unknown error".to_string()
    } else {
        picked.join("\n")
    }
}

pub(crate) fn keep_all(_line: &str) -> bool {
    true
}

/// Turn a finished sandbox run into a verdict.
///
/// A timeout sentinel always wins, and partial output after a kill is never
/// parsed. In test mode structured results are authoritative once at least
/// one was parsed; the exit code only matters when none were.
pub fn interpret(
    executor: &dyn LanguageExecutor,
    mode: RunMode,
    output: &SandboxOutput,
    elapsed_ms: u64,
) -> ExecutionResult {
    if output.is_timeout() {
        return ExecutionResult::error(TIMEOUT_MESSAGE, elapsed_ms);
    }

    let combined = output.combined();
    match mode {
        RunMode::Program => {
            if output.exit_code == 0 {
                ExecutionResult::from_tests(
                    vec![TestResult::passed(PROGRAM_TEST_NAME, elapsed_ms)],
                    elapsed_ms,
                )
            } else {
                ExecutionResult::error(executor.extract_error(&combined), elapsed_ms)
            }
        }
        RunMode::Test => {
            let results = executor.parse(&combined);
            if results.is_empty() && output.exit_code != 0 {
                ExecutionResult::error(executor.extract_error(&combined), elapsed_ms)
            } else {
                ExecutionResult::from_tests(results, elapsed_ms)
            }
        }
    }
}

static TYPESCRIPT: JavaScriptExecutor = JavaScriptExecutor::new(JsFlavor::TypeScript);
static JAVASCRIPT: JavaScriptExecutor = JavaScriptExecutor::new(JsFlavor::JavaScript);
static NODE: JavaScriptExecutor = JavaScriptExecutor::new(JsFlavor::Node);
static REACT: JavaScriptExecutor = JavaScriptExecutor::new(JsFlavor::React);
static VUE: JavaScriptExecutor = JavaScriptExecutor::new(JsFlavor::Vue);
static PYTHON: PythonExecutor = PythonExecutor;
static GO: GoExecutor = GoExecutor;
static RUST: RustExecutor = RustExecutor;

/// Static dispatch table: one executor per supported language.
pub fn executor_for(language: Language) -> &'static dyn LanguageExecutor {
    match language {
        Language::Typescript => &TYPESCRIPT,
        Language::Javascript => &JAVASCRIPT,
        Language::Node => &NODE,
        Language::React => &REACT,
        Language::Vue => &VUE,
        Language::Python => &PYTHON,
        Language::Go => &GO,
        Language::Rust => &RUST,
    }
}

/// Runs executors against a sandbox, owning workspace lifecycle.
#[derive(Clone)]
pub struct ExecutionEngine {
    sandbox: Arc<dyn Sandbox>,
    workspaces: WorkspaceManager,
    config: Arc<ExecutionConfig>,
}

impl ExecutionEngine {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: Arc<ExecutionConfig>) -> Self {
        let workspaces = WorkspaceManager::from_config(&config);
        Self {
            sandbox,
            workspaces,
            config,
        }
    }

    pub fn with_workspaces(mut self, workspaces: WorkspaceManager) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Grade one attempt. Never fails: faults become `status=error`.
    #[instrument(
        skip_all,
        fields(
            submission_id = %ctx.submission_id,
            exercise_id = %ctx.exercise_id,
            language = %ctx.language,
        )
    )]
    pub async fn execute(
        &self,
        executor: &dyn LanguageExecutor,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        match self.try_execute(executor, ctx, started).await {
            Ok(result) => {
                info!(
                    status = result.status.as_str(),
                    tests = result.test_results.len(),
                    execution_time_ms = result.execution_time_ms,
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(error = %message, "Execution failed");
                ExecutionResult::error(message, elapsed_ms(started))
            }
        }
    }

    async fn try_execute(
        &self,
        executor: &dyn LanguageExecutor,
        ctx: &ExecutionContext,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let mode = executor.mode(ctx);
        let files = executor.files(ctx, mode);
        debug!(executor = executor.name(), mode = ?mode, files = files.len(), "Assembling workspace");

        let workspace = self
            .workspaces
            .prepare(&files)
            .await
            .context("Failed to prepare workspace")?;

        let result = self.run_in(executor, ctx, mode, &workspace, started).await;
        workspace.cleanup().await;
        result
    }

    async fn run_in(
        &self,
        executor: &dyn LanguageExecutor,
        ctx: &ExecutionContext,
        mode: RunMode,
        workspace: &Workspace,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let layout = self.sandbox.layout(workspace);
        let image = self.config.image_for(ctx.language);
        let cpu_limit = self.config.cpu_limit_for(ctx.language);

        if !layout.isolated {
            if let Some(setup) = executor.setup(&layout) {
                let output = self
                    .sandbox
                    .run(SandboxRequest {
                        image,
                        command: &setup,
                        workspace,
                        timeout: SETUP_TIMEOUT,
                        memory_limit_mb: ctx.memory_limit_mb,
                        cpu_limit,
                    })
                    .await;
                if output.exit_code != 0 {
                    let detail = if output.stderr.trim().is_empty() {
                        output.stdout.trim()
                    } else {
                        output.stderr.trim()
                    };
                    warn!(command = %setup.display(), exit_code = output.exit_code, "Setup failed");
                    return Ok(ExecutionResult::error(
                        format!("Failed to install dependencies: {}", detail),
                        elapsed_ms(started),
                    ));
                }
            }
        }

        let command = executor.command(mode, &layout);
        let output = self
            .sandbox
            .run(SandboxRequest {
                image,
                command: &command,
                workspace,
                timeout: Duration::from_millis(ctx.timeout_ms),
                memory_limit_mb: ctx.memory_limit_mb,
                cpu_limit,
            })
            .await;
        debug!(
            exit_code = output.exit_code,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Sandbox run finished"
        );

        Ok(interpret(executor, mode, &output, elapsed_ms(started)))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// What a scripted sandbox saw for one run.
    #[derive(Debug, Clone)]
    pub struct RecordedRun {
        pub image: String,
        pub argv: Vec<String>,
        pub env: Vec<(String, String)>,
        pub timeout: Duration,
        pub memory_limit_mb: u32,
        pub workspace: PathBuf,
        pub files: Vec<String>,
    }

    /// Sandbox returning canned outputs in order, recording every request.
    pub struct FakeSandbox {
        isolated: bool,
        outputs: Mutex<VecDeque<SandboxOutput>>,
        runs: Mutex<Vec<RecordedRun>>,
    }

    impl FakeSandbox {
        pub fn new(outputs: Vec<SandboxOutput>) -> Self {
            Self {
                isolated: true,
                outputs: Mutex::new(outputs.into()),
                runs: Mutex::new(Vec::new()),
            }
        }

        pub fn local(outputs: Vec<SandboxOutput>) -> Self {
            Self {
                isolated: false,
                ..Self::new(outputs)
            }
        }

        pub fn runs(&self) -> Vec<RecordedRun> {
            self.runs.lock().unwrap().clone()
        }
    }

    pub fn output(stdout: &str, stderr: &str, exit_code: i64) -> SandboxOutput {
        SandboxOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    fn list_files(root: &std::path::Path) -> Vec<String> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(root) {
                    found.push(rel.display().to_string());
                }
            }
        }
        found.sort();
        found
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn layout(&self, workspace: &Workspace) -> Layout {
            if self.isolated {
                Layout {
                    workdir: PathBuf::from("/app"),
                    scratch: PathBuf::from("/tmp"),
                    isolated: true,
                }
            } else {
                Layout {
                    workdir: workspace.path().to_path_buf(),
                    scratch: workspace.scratch_dir(),
                    isolated: false,
                }
            }
        }

        async fn run(&self, request: SandboxRequest<'_>) -> SandboxOutput {
            self.runs.lock().unwrap().push(RecordedRun {
                image: request.image.to_string(),
                argv: request.command.argv.clone(),
                env: request.command.env.clone(),
                timeout: request.timeout,
                memory_limit_mb: request.memory_limit_mb,
                workspace: request.workspace.path().to_path_buf(),
                files: list_files(request.workspace.path()),
            });
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| output("", "", 0))
        }
    }

    pub fn test_config() -> Arc<ExecutionConfig> {
        let mut config = ExecutionConfig::default();
        config.workspace_dir = std::env::temp_dir().join("blankcode-engine-test");
        config.timeout_ms = 5_000;
        Arc::new(config)
    }

    pub fn context(language: Language, code: &str, test_code: &str) -> ExecutionContext {
        ExecutionContext {
            submission_id: uuid::Uuid::new_v4(),
            exercise_id: uuid::Uuid::new_v4(),
            code: code.to_string(),
            test_code: test_code.to_string(),
            language,
            timeout_ms: 5_000,
            memory_limit_mb: 256,
        }
    }

    pub fn engine(sandbox: Arc<FakeSandbox>) -> ExecutionEngine {
        ExecutionEngine::new(sandbox, test_config())
    }
}
