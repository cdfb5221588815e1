/// Local Sandbox - Restricted Host Process
///
/// Spawns the argv directly on the host, inside the workspace directory.
/// The child never inherits the worker's environment: only an explicit
/// allow-list of toolchain variables is forwarded, plus the command's own
/// variables. Wall-clock timeout and output caps are enforced with the same
/// kill semantics as the container backend. The child leads its own process
/// group, and a kill takes down every descendant. Memory, CPU and pid limits
/// are not enforced on this path.

use super::{CappedBuffer, Layout, Sandbox, SandboxOutput, SandboxRequest};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

/// Host variables a toolchain needs to find itself.
pub const ALLOWED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "GOROOT",
    "GOPATH",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "RUSTUP_TOOLCHAIN",
    "NODE_PATH",
    "NVM_DIR",
    "PYTHONPATH",
    "VIRTUAL_ENV",
    "SYSTEMROOT",
];

/// How long to keep reading pipes after the child exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Flooded,
}

#[derive(Debug, Default, Clone)]
pub struct LocalSandbox;

impl LocalSandbox {
    pub fn new() -> Self {
        Self
    }
}

/// Kill the whole process group led by `pgid`, then the child itself.
fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                debug!(pgid, error = %e, "Process group already gone");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
}

fn exit_code(status: &ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    1
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn layout(&self, workspace: &Workspace) -> Layout {
        Layout {
            workdir: workspace.path().to_path_buf(),
            scratch: workspace.scratch_dir(),
            isolated: false,
        }
    }

    #[instrument(skip_all, fields(command = %request.command.display()))]
    async fn run(&self, request: SandboxRequest<'_>) -> SandboxOutput {
        let layout = self.layout(request.workspace);
        let Some((program, args)) = request.command.argv.split_first() else {
            return SandboxOutput::spawn_failure(String::new(), "Empty command");
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&layout.workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for key in ALLOWED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("TMPDIR", layout.scratch_str());
        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "Failed to spawn process");
                return SandboxOutput::spawn_failure(
                    String::new(),
                    format!("Failed to spawn '{}': {}", program, e),
                );
            }
        };
        let pgid = child.id();

        let (Some(mut out_pipe), Some(mut err_pipe)) = (child.stdout.take(), child.stderr.take())
        else {
            kill_tree(&mut child, pgid);
            return SandboxOutput::spawn_failure(String::new(), "Failed to capture process output");
        };

        let mut stdout = CappedBuffer::default();
        let mut stderr = CappedBuffer::default();
        let mut out_chunk = [0u8; 8192];
        let mut err_chunk = [0u8; 8192];
        let (mut out_open, mut err_open) = (true, true);
        let mut exit_status: Option<std::io::Result<ExitStatus>> = None;

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        let drain = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain);

        let outcome = loop {
            if !out_open && !err_open {
                if let Some(status) = exit_status.take() {
                    break Outcome::Exited(status);
                }
            }

            tokio::select! {
                read = out_pipe.read(&mut out_chunk), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => if !stdout.push(&out_chunk[..n]) { break Outcome::Flooded },
                },
                read = err_pipe.read(&mut err_chunk), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => if !stderr.push(&err_chunk[..n]) { break Outcome::Flooded },
                },
                status = child.wait(), if exit_status.is_none() => {
                    exit_status = Some(status);
                    drain.as_mut().reset(tokio::time::Instant::now() + DRAIN_GRACE);
                },
                _ = &mut drain, if exit_status.is_some() => {
                    // Descendants still hold the pipes open.
                    if let Some(status) = exit_status.take() {
                        break Outcome::Exited(status);
                    }
                },
                _ = &mut deadline => break Outcome::TimedOut,
            }
        };

        // Pipes still open after an exit means background descendants linger.
        if out_open || err_open || !matches!(outcome, Outcome::Exited(_)) {
            kill_tree(&mut child, pgid);
        }

        match outcome {
            Outcome::Exited(Ok(status)) => {
                let code = exit_code(&status);
                debug!(exit_code = code, "Process exited");
                SandboxOutput {
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                    exit_code: code,
                }
            }
            Outcome::Exited(Err(e)) => SandboxOutput::spawn_failure(
                stderr.into_string(),
                format!("Failed to wait for process: {}", e),
            ),
            Outcome::TimedOut => {
                let _ = child.wait().await;
                SandboxOutput::timed_out(stdout.into_string(), stderr.into_string(), request.timeout)
            }
            Outcome::Flooded => {
                let _ = child.wait().await;
                SandboxOutput::output_exceeded(stdout.into_string(), stderr.into_string())
            }
        }
    }
}
