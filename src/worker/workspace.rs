use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::{Isolation, WorkspaceConfig};
use crate::error::{Result, RevpoolError};

/// Ownership record for one job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub path: PathBuf,
    /// Whether the shared side-database was linked into the workspace.
    pub linked_side_data: bool,
}

/// Directory name for a job id. Depends only on the prefix and the id, so
/// re-runs of the same id land in the same place.
///
/// The mapping is injective: `[A-Za-z0-9.-]` pass through and every other
/// byte, `_` included, becomes `_xx` (lowercase hex). Distinct ids never
/// share a directory.
pub fn workspace_name(prefix: &str, job_id: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + 1 + job_id.len());
    name.push_str(prefix);
    name.push('-');
    for byte in job_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-') {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name
}

/// Creates per-job workspaces under a common root.
///
/// Workspaces are never removed: they hold the artifacts of the run.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    /// Make sure the workspace root exists and is writable.
    pub async fn prepare_root(&self) -> Result<()> {
        let root = &self.config.root;
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            RevpoolError::Configuration(format!(
                "cannot create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        let marker = root.join(format!(".{}-write-check-{}", self.config.prefix, std::process::id()));
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| {
                RevpoolError::Configuration(format!(
                    "workspace root {} is not writable: {}",
                    root.display(),
                    e
                ))
            })?;
        let _ = tokio::fs::remove_file(&marker).await;
        Ok(())
    }

    pub fn workspace_path(&self, job_id: &str) -> PathBuf {
        self.config
            .root
            .join(workspace_name(&self.config.prefix, job_id))
    }

    /// Create (or reuse) the workspace for `job_id` and attach the side
    /// database. Any error here is an environment problem, not a transient one.
    pub async fn acquire(&self, job_id: &str) -> Result<WorkspaceHandle> {
        let path = self.workspace_path(job_id);

        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
            if !meta.is_dir() {
                return Err(RevpoolError::workspace(
                    job_id,
                    format!("{} exists and is not a directory", path.display()),
                ));
            }
        }

        match &self.config.isolation {
            Isolation::Directory => {
                tokio::fs::create_dir_all(&path).await.map_err(|e| {
                    RevpoolError::workspace(
                        job_id,
                        format!("cannot create {}: {}", path.display(), e),
                    )
                })?;
            }
            Isolation::GitWorktree { repo } => {
                if !path.join(".git").exists() {
                    add_worktree(repo, &path, job_id).await?;
                }
            }
        }

        let linked_side_data = self.link_side_db(job_id, &path).await?;

        tracing::debug!(
            job_id,
            path = %path.display(),
            linked_side_data,
            "Workspace ready"
        );

        Ok(WorkspaceHandle {
            path,
            linked_side_data,
        })
    }

    /// Nothing is deleted; the directory keeps the job's artifacts.
    pub fn release(&self, _handle: WorkspaceHandle) {}

    async fn link_side_db(&self, job_id: &str, workspace: &Path) -> Result<bool> {
        let Some(side_db) = &self.config.side_db else {
            return Ok(false);
        };
        let Ok(target) = tokio::fs::canonicalize(side_db).await else {
            tracing::debug!(job_id, side_db = %side_db.display(), "Side database not present");
            return Ok(false);
        };

        let link = workspace.join(&self.config.side_db_name);
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            return Ok(true);
        }
        tokio::fs::symlink(&target, &link).await.map_err(|e| {
            RevpoolError::workspace(
                job_id,
                format!("cannot link side database into {}: {}", link.display(), e),
            )
        })?;
        Ok(true)
    }
}

async fn add_worktree(repo: &Path, path: &Path, revision: &str) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["worktree", "add", "--detach"])
        .arg(path)
        .arg(revision)
        .output()
        .await
        .map_err(|e| RevpoolError::workspace(revision, format!("cannot run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RevpoolError::workspace(
            revision,
            format!("git worktree add failed: {}", stderr.trim()),
        ));
    }
    Ok(())
}
