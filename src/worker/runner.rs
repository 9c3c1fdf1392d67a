use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ArtifactConfig;
use crate::results::RunResult;
use crate::scheduler::job::{AttemptOutcome, Job, JobState, Transition, TransientCause};
use crate::shutdown::Cancellation;
use crate::worker::command::InvocationParams;
use crate::worker::executor::{ProcessExit, ProcessHandle, ProcessLauncher};
use crate::worker::workspace::{WorkspaceHandle, WorkspaceManager};

/// What one attempt produced, before the job's state machine sees it.
#[derive(Debug)]
struct AttemptReport {
    outcome: AttemptOutcome,
    exit_code: Option<i32>,
    stderr_tail: Option<String>,
    workspace: Option<WorkspaceHandle>,
}

impl AttemptReport {
    fn new(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            exit_code: None,
            stderr_tail: None,
            workspace: None,
        }
    }
}

enum Waited {
    Exited(std::io::Result<ProcessExit>),
    TimedOut,
    Cancelled,
}

#[derive(Serialize)]
struct DurationRecord<'a> {
    job_id: &'a str,
    attempts: u32,
    elapsed_ms: u64,
    exit_code: Option<i32>,
    final_state: JobState,
}

/// Executes single attempts of a job.
pub struct JobRunner {
    workspaces: WorkspaceManager,
    launcher: Arc<dyn ProcessLauncher>,
    artifacts: ArtifactConfig,
    kill_grace: Duration,
    cancellation: Cancellation,
    verbose: bool,
}

impl JobRunner {
    pub fn new(
        workspaces: WorkspaceManager,
        launcher: Arc<dyn ProcessLauncher>,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            workspaces,
            launcher,
            artifacts: ArtifactConfig::default(),
            kill_grace: Duration::from_secs(1),
            cancellation,
            verbose: false,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactConfig) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Run one attempt of `job`.
    ///
    /// Returns `None` when the job needs another attempt (its state is then
    /// `RetryPending`), or its terminal record.
    pub async fn run(&self, job: &mut Job) -> Option<RunResult> {
        job.start_attempt();
        tracing::info!(
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            "Starting job"
        );

        let report = self.attempt(job).await;
        let transition = job.apply(report.outcome.clone());

        match transition {
            Transition::Retry => {
                tracing::warn!(
                    job_id = %job.id,
                    next_attempt = job.attempt,
                    cause = %job.last_cause.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                    "Attempt failed, retrying"
                );
                if self.verbose {
                    if let Some(stderr) = &report.stderr_tail {
                        tracing::warn!(job_id = %job.id, stderr = %stderr.trim_end(), "Captured stderr");
                    }
                }
                if let Some(workspace) = report.workspace {
                    self.workspaces.release(workspace);
                }
                None
            }
            Transition::Succeeded | Transition::Failed(_) => {
                let artifacts = match &report.workspace {
                    Some(workspace) => self.write_artifacts(job, workspace, report.exit_code).await,
                    None => Vec::new(),
                };
                if let Some(workspace) = report.workspace {
                    self.workspaces.release(workspace);
                }
                Some(RunResult::from_job(
                    job,
                    artifacts,
                    report.exit_code,
                    report.stderr_tail,
                ))
            }
        }
    }

    async fn attempt(&self, job: &Job) -> AttemptReport {
        let workspace = match self.workspaces.acquire(&job.id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Workspace setup failed");
                return AttemptReport::new(AttemptOutcome::SetupFailed(e.to_string()));
            }
        };

        if self.cancellation.is_cancelled() {
            let mut report = AttemptReport::new(AttemptOutcome::Cancelled);
            report.workspace = Some(workspace);
            return report;
        }

        let invocation = job.command.build(&InvocationParams {
            job_id: &job.id,
            workspace: &workspace.path,
        });
        let output_path = workspace.path.join(&self.artifacts.output_file);

        let mut process = match self.launcher.start(&invocation, &output_path).await {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to start command");
                let mut report = AttemptReport::new(AttemptOutcome::Transient(
                    TransientCause::ProcessError(e.to_string()),
                ));
                report.workspace = Some(workspace);
                return report;
            }
        };

        let started = Instant::now();
        let waited = tokio::select! {
            result = process.wait() => Waited::Exited(result),
            _ = sleep_for(job.timeout) => Waited::TimedOut,
            _ = self.cancellation.cancelled() => Waited::Cancelled,
        };

        let mut report = match waited {
            Waited::Exited(Ok(exit)) => {
                let mut report = AttemptReport::new(classify(&exit));
                report.exit_code = exit.exit_code;
                report.stderr_tail = Some(exit.stderr_tail);
                report
            }
            Waited::Exited(Err(e)) => {
                AttemptReport::new(AttemptOutcome::Transient(TransientCause::ProcessError(
                    e.to_string(),
                )))
            }
            Waited::TimedOut => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout = ?job.timeout,
                    "Attempt timed out, terminating"
                );
                let exit = self.shut_down(process.as_mut(), Some(self.kill_grace)).await;
                let mut report =
                    AttemptReport::new(AttemptOutcome::Transient(TransientCause::TimedOut));
                report.exit_code = exit.as_ref().and_then(|e| e.exit_code);
                report.stderr_tail = exit.map(|e| e.stderr_tail);
                report
            }
            Waited::Cancelled => {
                tracing::info!(job_id = %job.id, pid = ?process.pid(), "Terminating for cancellation");
                let exit = self.shut_down(process.as_mut(), None).await;
                let mut report = AttemptReport::new(AttemptOutcome::Cancelled);
                report.exit_code = exit.as_ref().and_then(|e| e.exit_code);
                report.stderr_tail = exit.map(|e| e.stderr_tail);
                report
            }
        };

        // A failure observed after an interrupt is the interrupt's doing.
        if matches!(report.outcome, AttemptOutcome::Transient(_)) && self.cancellation.is_cancelled()
        {
            report.outcome = AttemptOutcome::Cancelled;
        }

        tracing::debug!(
            job_id = %job.id,
            attempt = job.attempt,
            outcome = ?report.outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Attempt finished"
        );

        report.workspace = Some(workspace);
        report
    }

    /// SIGTERM, then SIGKILL once `grace` runs out or cancellation is forced.
    /// With no `grace`, only the forced stage triggers the kill.
    async fn shut_down(
        &self,
        process: &mut dyn ProcessHandle,
        grace: Option<Duration>,
    ) -> Option<ProcessExit> {
        if let Err(e) = process.terminate() {
            tracing::warn!(pid = ?process.pid(), error = %e, "SIGTERM failed");
        }

        let graceful = tokio::select! {
            result = process.wait() => Some(result),
            _ = sleep_for(grace) => None,
            _ = self.cancellation.forced() => None,
        };

        match graceful {
            Some(Ok(exit)) => return Some(exit),
            Some(Err(e)) => {
                tracing::warn!(pid = ?process.pid(), error = %e, "Wait failed after SIGTERM");
            }
            None => {
                tracing::warn!(pid = ?process.pid(), "Process still running, sending SIGKILL");
            }
        }

        if let Err(e) = process.kill() {
            tracing::warn!(pid = ?process.pid(), error = %e, "SIGKILL failed");
        }
        process.wait().await.ok()
    }

    async fn write_artifacts(
        &self,
        job: &Job,
        workspace: &WorkspaceHandle,
        exit_code: Option<i32>,
    ) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        let output = workspace.path.join(&self.artifacts.output_file);
        if tokio::fs::metadata(&output).await.is_ok() {
            paths.push(output);
        }
        let report = workspace.path.join(&self.artifacts.report_file);
        if tokio::fs::metadata(&report).await.is_ok() {
            paths.push(report);
        }

        let record = DurationRecord {
            job_id: &job.id,
            attempts: job.attempts_used(),
            elapsed_ms: job.elapsed().as_millis() as u64,
            exit_code,
            final_state: job.state,
        };
        let duration_path = workspace.path.join(&self.artifacts.duration_file);
        let written = match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => tokio::fs::write(&duration_path, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => paths.push(duration_path),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to write duration record");
            }
        }

        paths
    }
}

/// Zero exit with some output is a success; anything else is retryable.
pub fn classify(exit: &ProcessExit) -> AttemptOutcome {
    match exit.exit_code {
        Some(0) if exit.stdout_bytes > 0 => AttemptOutcome::Succeeded,
        Some(0) => AttemptOutcome::Transient(TransientCause::EmptyOutput),
        code => AttemptOutcome::Transient(TransientCause::NonZeroExit(code)),
    }
}

async fn sleep_for(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
