use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Languages the grading engine knows how to run.
///
/// Closed set: anything else is rejected by the coordinator before an
/// executor is ever chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Typescript,
    Javascript,
    Python,
    Go,
    Rust,
    React,
    Vue,
    Node,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Typescript,
        Language::Javascript,
        Language::Python,
        Language::Go,
        Language::Rust,
        Language::React,
        Language::Vue,
        Language::Node,
    ];

    /// Normalize a language identifier (track slug, CLI flag, ...) into a
    /// supported language. Aliases map onto the same variant.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "typescript" | "ts" => Some(Language::Typescript),
            "javascript" | "js" => Some(Language::Javascript),
            "python" | "py" | "python3" => Some(Language::Python),
            "go" | "golang" => Some(Language::Go),
            "rust" | "rs" => Some(Language::Rust),
            "react" | "jsx" | "tsx" => Some(Language::React),
            "vue" => Some(Language::Vue),
            "node" | "nodejs" => Some(Language::Node),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Typescript => "typescript",
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::React => "react",
            Language::Vue => "vue",
            Language::Node => "node",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One test as reported by the underlying runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
    /// Milliseconds, 0 when the runner does not report timing.
    pub duration: u64,
}

impl TestResult {
    pub fn passed(name: impl Into<String>, duration: u64) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
            duration,
        }
    }

    pub fn failed(name: impl Into<String>, duration: u64, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message,
            duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Error => "error",
        }
    }
}

/// Final verdict of one grading attempt.
///
/// `error_message` is present only for `status == Error`; a failed test is
/// never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub test_results: Vec<TestResult>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn error(message: impl Into<String>, execution_time_ms: u64) -> Self {
        let message = message.into();
        Self {
            success: false,
            status: ExecutionStatus::Error,
            test_results: Vec::new(),
            execution_time_ms,
            error_message: Some(if message.trim().is_empty() {
                "Unknown error".to_string()
            } else {
                message
            }),
        }
    }

    /// Verdict derived purely from structured results. An empty run is a
    /// failure, not an error.
    pub fn from_tests(test_results: Vec<TestResult>, execution_time_ms: u64) -> Self {
        let success = !test_results.is_empty() && test_results.iter().all(|r| r.passed);
        Self {
            success,
            status: if success {
                ExecutionStatus::Passed
            } else {
                ExecutionStatus::Failed
            },
            test_results,
            execution_time_ms,
            error_message: None,
        }
    }
}

/// Immutable input to a language executor, one per attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub submission_id: Uuid,
    pub exercise_id: Uuid,
    pub code: String,
    pub test_code: String,
    pub language: Language,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
}

impl ExecutionContext {
    /// Whitespace-only test code counts as no tests at all.
    pub fn has_tests(&self) -> bool {
        !self.test_code.trim().is_empty()
    }
}

/// Lifecycle of a persisted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Passed => "passed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SubmissionStatus::Pending),
            "running" => Some(SubmissionStatus::Running),
            "passed" => Some(SubmissionStatus::Passed),
            "failed" => Some(SubmissionStatus::Failed),
            "error" => Some(SubmissionStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Passed | SubmissionStatus::Failed | SubmissionStatus::Error
        )
    }

    /// `pending -> running -> {passed|failed|error}`, plus the user-driven
    /// retry edge `failed|error -> pending`. Stale recovery moves
    /// `running -> error`, which the main edges already cover.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Passed | Failed | Error) => true,
            (Failed | Error, Pending) => true,
            _ => false,
        }
    }
}

impl From<ExecutionStatus> for SubmissionStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Passed => SubmissionStatus::Passed,
            ExecutionStatus::Failed => SubmissionStatus::Failed,
            ExecutionStatus::Error => SubmissionStatus::Error,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue payload. Field names follow the broker's wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionJob {
    pub submission_id: Uuid,
    pub exercise_id: Uuid,
    pub code: String,
    #[serde(default)]
    pub attempts_made: u32,
}

impl SubmissionJob {
    pub fn new(submission_id: Uuid, exercise_id: Uuid, code: impl Into<String>) -> Self {
        Self {
            submission_id,
            exercise_id,
            code: code.into(),
            attempts_made: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exercise_id: Uuid,
    pub code: String,
    pub status: SubmissionStatus,
    pub test_results: Vec<TestResult>,
    pub execution_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hidden test code plus the language of the exercise's owning track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub id: Uuid,
    pub test_code: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub user_id: Uuid,
    pub exercise_id: Uuid,
    pub is_completed: bool,
    pub attempts: u32,
    pub best_submission_id: Option<Uuid>,
    pub best_time_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}
