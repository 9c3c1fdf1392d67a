use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RevpoolError};

pub const DEFAULT_PARALLELISM: usize = 24;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry, timeout and termination knobs applied to every job in a run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per job, including the first one.
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt. `None` disables the timeout.
    pub timeout: Option<Duration>,
    /// Delay before a failed attempt is put back on the queue.
    pub backoff: Duration,
    /// Time a timed-out process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: None,
            backoff: Duration::ZERO,
            kill_grace: Duration::from_secs(1),
        }
    }
}

/// How a job's working directory is isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// A plain directory under the workspace root.
    Directory,
    /// A detached git worktree of the job's revision, created from `repo`.
    GitWorktree { repo: PathBuf },
}

/// Configuration for per-job workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory under which every job workspace is created.
    pub root: PathBuf,
    /// Prefix for workspace directory names.
    pub prefix: String,
    pub isolation: Isolation,
    /// Shared read-only database linked into each workspace when present.
    pub side_db: Option<PathBuf>,
    /// Name of the link created inside the workspace for `side_db`.
    pub side_db_name: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            prefix: "revpool".to_string(),
            isolation: Isolation::Directory,
            side_db: None,
            side_db_name: ".side-db".to_string(),
        }
    }
}

/// File names of the artifacts written into each workspace.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub output_file: String,
    /// Report the external command may produce itself.
    pub report_file: String,
    pub duration_file: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            output_file: "revpool-output.txt".to_string(),
            report_file: "review-inline.txt".to_string(),
            duration_file: "revpool-duration.json".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Time in-flight processes get to exit after a cancellation request.
    pub cancel_grace: Duration,
    pub workspace: WorkspaceConfig,
    pub artifacts: ArtifactConfig,
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            cancel_grace: Duration::from_secs(5),
            workspace: WorkspaceConfig::default(),
            artifacts: ArtifactConfig::default(),
            verbose: false,
        }
    }
}

impl RunConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.retry.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace.root = root.into();
        self
    }

    /// Reject settings that would make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(RevpoolError::Configuration(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RevpoolError::Configuration(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.timeout == Some(Duration::ZERO) {
            return Err(RevpoolError::Configuration(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration such as `300`, `90s`, `5m`, `1h` or `250ms`.
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit '{}' in '{}'", unit, input)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.timeout.is_none());
        assert_eq!(policy.backoff, Duration::ZERO);
        assert_eq!(policy.kill_grace, Duration::from_secs(1));
    }

    #[test]
    fn workspace_config_default() {
        let cfg = WorkspaceConfig::default();
        assert_eq!(cfg.root, PathBuf::from("."));
        assert_eq!(cfg.isolation, Isolation::Directory);
        assert!(cfg.side_db.is_none());
    }

    #[test]
    fn run_config_default() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.parallelism, 24);
        assert_eq!(cfg.cancel_grace, Duration::from_secs(5));
        assert!(!cfg.verbose);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn run_config_builders() {
        let cfg = RunConfig::default()
            .with_parallelism(3)
            .with_timeout(Some(Duration::from_secs(10)))
            .with_max_attempts(2)
            .with_workspace_root("/tmp/ws");
        assert_eq!(cfg.parallelism, 3);
        assert_eq!(cfg.retry.timeout, Some(Duration::from_secs(10)));
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.workspace.root, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn run_config_rejects_zero_values() {
        assert!(RunConfig::default().with_parallelism(0).validate().is_err());
        assert!(RunConfig::default().with_max_attempts(0).validate().is_err());
        assert!(RunConfig::default()
            .with_timeout(Some(Duration::ZERO))
            .validate()
            .is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("300"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
