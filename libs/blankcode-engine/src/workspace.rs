/// Workspace Manager - Ephemeral Per-Attempt Directories
///
/// Each grading attempt gets a uniquely named directory holding the
/// generated source, test and manifest files plus a writable `tmp/` scratch
/// directory. The directory is owned by exactly one attempt and removed
/// afterwards, on success or failure.
///
/// Cleanup never fails the caller: a leaked directory is a disk-hygiene
/// problem, not a grading problem.

use anyhow::{bail, Context, Result};
use blankcode_common::config::ExecutionConfig;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Relative path -> file content.
pub type FileSet = BTreeMap<String, String>;

pub const SCRATCH_DIR: &str = "tmp";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    host_base_dir: Option<PathBuf>,
}

impl WorkspaceManager {
    /// `host_base_dir` is the same directory as seen by the sandboxing layer,
    /// when it differs from this process's view (worker in a container).
    pub fn new(base_dir: impl Into<PathBuf>, host_base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            host_base_dir,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.workspace_dir.clone(), config.workspace_host_dir.clone())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh workspace and write every file verbatim.
    pub async fn prepare(&self, files: &FileSet) -> Result<Workspace> {
        for name in files.keys() {
            validate_relative(name)?;
        }

        let id = Uuid::new_v4();
        let path = self.base_dir.join(id.to_string());
        let host_path = self
            .host_base_dir
            .as_ref()
            .map(|host| host.join(id.to_string()))
            .unwrap_or_else(|| path.clone());

        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;

        // From here on Drop removes the directory if anything below fails.
        let workspace = Workspace {
            id,
            path,
            host_path,
            cleaned: false,
        };

        let scratch = workspace.scratch_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("Failed to create scratch dir {}", scratch.display()))?;
        // Sandboxed runners use an unprivileged uid.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&scratch, std::fs::Permissions::from_mode(0o777))
                .await
                .context("Failed to open up scratch dir permissions")?;
        }

        for (name, content) in files {
            let file_path = workspace.path.join(name);
            if let Some(parent) = file_path.parent() {
                if parent != workspace.path {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
            tokio::fs::write(&file_path, content)
                .await
                .with_context(|| format!("Failed to write {}", name))?;
        }

        debug!(
            workspace_id = %workspace.id,
            files = files.len(),
            path = %workspace.path.display(),
            "Workspace prepared"
        );
        Ok(workspace)
    }
}

fn validate_relative(name: &str) -> Result<()> {
    let path = Path::new(name);
    if name.is_empty() || path.is_absolute() {
        bail!("Invalid workspace path '{}'", name);
    }
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Invalid workspace path '{}'", name);
    }
    Ok(())
}

/// Handle to one prepared workspace.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    host_path: PathBuf,
    cleaned: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path as seen by this process.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path as seen by the sandboxing layer.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.path.join(SCRATCH_DIR)
    }

    pub fn host_scratch_dir(&self) -> PathBuf {
        self.host_path.join(SCRATCH_DIR)
    }

    /// Remove the workspace tree. Failures are logged, never returned.
    pub async fn cleanup(mut self) {
        self.cleaned = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(workspace_id = %self.id, "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                workspace_id = %self.id,
                path = %self.path.display(),
                error = %e,
                "Failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        // Dropped without cleanup (early return, panic): remove synchronously.
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace_id = %self.id, error = %e, "Failed to remove dropped workspace");
            }
        }
    }
}
