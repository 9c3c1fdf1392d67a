use std::sync::Arc;

use crate::config::RunConfig;
use crate::error::Result;
use crate::results::{ResultAggregator, RunSummary};
use crate::scheduler::{JobQueue, PoolSnapshot, WorkerPool};
use crate::shutdown::Cancellation;
use crate::worker::{CommandTemplate, JobRunner, ProcessExecutor, ProcessLauncher, WorkspaceManager};

/// Outcome of a whole run.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub pool: PoolSnapshot,
    pub cancelled: bool,
    pub aggregator: Arc<ResultAggregator>,
}

impl RunReport {
    /// Exit code for the process: 0 only when every job succeeded and the
    /// run was not interrupted.
    pub fn exit_code(&self) -> u8 {
        if self.summary.all_succeeded() && !self.cancelled {
            0
        } else {
            1
        }
    }
}

/// Wires the workspace manager, runner, pool and aggregator together.
pub struct Orchestrator {
    config: RunConfig,
    command: Arc<CommandTemplate>,
    launcher: Arc<dyn ProcessLauncher>,
    cancellation: Cancellation,
}

impl Orchestrator {
    pub fn new(config: RunConfig, command: CommandTemplate) -> Self {
        let cancellation = Cancellation::new(config.cancel_grace);
        Self {
            config,
            command: Arc::new(command),
            launcher: Arc::new(ProcessExecutor::new()),
            cancellation,
        }
    }

    /// Replace the process launcher, e.g. with a scripted one in tests.
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Handle to trigger or observe cancellation of this run.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Run one job per id.
    ///
    /// Configuration problems (empty id list, empty command, unusable
    /// workspace root) fail here before any job starts. Per-job failures
    /// only show up in the report.
    pub async fn run(&self, ids: &[String]) -> Result<RunReport> {
        self.config.validate()?;
        let jobs = JobQueue::from_ids(ids, Arc::clone(&self.command), &self.config.retry)?;

        let workspaces = WorkspaceManager::new(self.config.workspace.clone());
        workspaces.prepare_root().await?;

        tracing::info!(
            jobs = jobs.len(),
            parallel = self.config.parallelism,
            timeout = ?self.config.retry.timeout,
            max_attempts = self.config.retry.max_attempts,
            root = %self.config.workspace.root.display(),
            command = %self.command,
            "Starting run"
        );

        let runner = JobRunner::new(workspaces, Arc::clone(&self.launcher), self.cancellation.clone())
            .with_artifacts(self.config.artifacts.clone())
            .with_kill_grace(self.config.retry.kill_grace)
            .with_verbose(self.config.verbose);

        let aggregator = Arc::new(ResultAggregator::new(jobs.len()));
        let pool = WorkerPool::new(
            Arc::new(runner),
            self.config.parallelism,
            self.cancellation.clone(),
            Arc::clone(&aggregator),
        )
        .with_retry_backoff(self.config.retry.backoff);

        let snapshot = pool.run(jobs).await;
        let summary = aggregator.summary();

        Ok(RunReport {
            summary,
            pool: snapshot,
            cancelled: self.cancellation.is_cancelled(),
            aggregator,
        })
    }
}
