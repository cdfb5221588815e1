/// Sandbox Runner - Isolated Command Execution
///
/// **Core Responsibility:**
/// Run one fixed argv inside a prepared workspace and return the raw
/// stdout/stderr/exit-code triple.
///
/// **Architectural Boundary:**
/// - A sandbox knows HOW to isolate (container or restricted local process)
/// - It does NOT know languages, test runners or verdicts
/// - It never fails: spawn errors come back as exit code 1, timeouts and
///   output floods as exit code 124
///
/// Two backends share this contract: `DockerSandbox` for production and
/// `LocalSandbox` for development hosts without a container runtime.

pub mod docker;
pub mod local;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

use crate::workspace::Workspace;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code reported when the wall clock or the output cap killed the run.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Per-stream accumulation cap.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Paths as the sandboxed command sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub workdir: PathBuf,
    pub scratch: PathBuf,
    /// True when the command cannot reach the network or host toolchain caches.
    pub isolated: bool,
}

impl Layout {
    pub fn scratch_path(&self, rel: &str) -> String {
        self.scratch.join(rel).display().to_string()
    }

    pub fn scratch_str(&self) -> String {
        self.scratch.display().to_string()
    }
}

/// Argv plus extra environment. Never passed through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SandboxCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

pub struct SandboxRequest<'a> {
    pub image: &'a str,
    pub command: &'a SandboxCommand,
    pub workspace: &'a Workspace,
    pub timeout: Duration,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl SandboxOutput {
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// stdout then stderr, the way parsers consume it.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }

    pub fn spawn_failure(stderr: String, error: impl std::fmt::Display) -> Self {
        let mut stderr = stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&error.to_string());
        Self {
            stdout: String::new(),
            stderr,
            exit_code: 1,
        }
    }

    pub(crate) fn timed_out(stdout: String, mut stderr: String, timeout: Duration) -> Self {
        stderr.push_str(&format!(
            "\n[Execution timed out after {}ms]",
            timeout.as_millis()
        ));
        Self {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }

    pub(crate) fn output_exceeded(stdout: String, mut stderr: String) -> Self {
        stderr.push_str(&format!(
            "\n[Output limit exceeded: more than {} bytes]",
            MAX_OUTPUT_BYTES
        ));
        Self {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Where the workspace and scratch directory appear to the command.
    fn layout(&self, workspace: &Workspace) -> Layout;

    /// Total: always resolves to an output triple.
    async fn run(&self, request: SandboxRequest<'_>) -> SandboxOutput;
}

/// Bounded accumulator for one output stream.
#[derive(Debug, Default)]
pub(crate) struct CappedBuffer {
    bytes: Vec<u8>,
    overflowed: bool,
}

impl CappedBuffer {
    /// Returns false once the cap has been crossed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> bool {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.overflowed = true;
            return false;
        }
        self.bytes.extend_from_slice(chunk);
        true
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub(crate) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer() {
        let mut buf = CappedBuffer::default();
        assert!(buf.push(b"hello"));
        assert!(!buf.overflowed());
        let big = vec![b'x'; MAX_OUTPUT_BYTES];
        assert!(!buf.push(&big));
        assert!(buf.overflowed());
        assert_eq!(buf.into_string().len(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_spawn_failure_shape() {
        let out = SandboxOutput::spawn_failure(String::new(), "No such file or directory");
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stderr, "No such file or directory");
        assert!(!out.is_timeout());
    }

    #[test]
    fn test_timeout_annotation() {
        let out = SandboxOutput::timed_out("partial".into(), String::new(), Duration::from_millis(250));
        assert!(out.is_timeout());
        assert!(out.stderr.contains("timed out after 250ms"));
        assert_eq!(out.stdout, "partial");
    }

    #[test]
    fn test_combined_output() {
        let out = SandboxOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: 0,
        };
        assert_eq!(out.combined(), "a\nb");
    }

    #[test]
    fn test_command_builder() {
        let cmd = SandboxCommand::new(["go", "test", "-v"]).env("CGO_ENABLED", "0");
        assert_eq!(cmd.display(), "go test -v");
        assert_eq!(cmd.env, vec![("CGO_ENABLED".to_string(), "0".to_string())]);
    }
}
