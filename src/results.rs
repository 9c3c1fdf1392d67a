use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::scheduler::job::{FailureReason, Job, JobState};

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Terminal record for one job. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub job_id: String,
    #[serde(skip)]
    pub index: usize,
    pub final_state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub attempts_used: u32,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub artifact_paths: Vec<PathBuf>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    pub fn from_job(
        job: &Job,
        artifact_paths: Vec<PathBuf>,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            index: job.index,
            final_state: job.state,
            failure: job.failure.clone(),
            attempts_used: job.attempts_used(),
            duration: job.elapsed(),
            artifact_paths,
            exit_code,
            stderr_tail: stderr_tail.filter(|s| !s.trim().is_empty()),
            started_at: job.started_at,
            completed_at: Utc::now(),
        }
    }

    /// Record for a job discarded from the queue by cancellation.
    pub fn discarded(job: &mut Job) -> Self {
        job.discard();
        Self::from_job(job, Vec::new(), None, None)
    }

    pub fn category(&self) -> ResultCategory {
        match (&self.final_state, &self.failure) {
            (JobState::Succeeded, _) => ResultCategory::Succeeded,
            (_, Some(FailureReason::Cancelled)) => ResultCategory::Cancelled,
            (_, Some(FailureReason::Skipped)) => ResultCategory::Skipped,
            _ => ResultCategory::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCategory {
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Permanent failures: retries exhausted or setup failures.
    pub failed: usize,
    /// In-flight jobs terminated by an interrupt.
    pub cancelled: usize,
    /// Queued jobs that never started because of an interrupt.
    pub skipped: usize,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.total > 0 && self.succeeded == self.total
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completed: {}/{}, Succeeded: {}, Failed: {}",
            self.succeeded + self.failed + self.cancelled,
            self.total,
            self.succeeded,
            self.failed
        )?;
        if self.cancelled > 0 || self.skipped > 0 {
            write!(
                f,
                ", Cancelled: {}, Not started: {}",
                self.cancelled, self.skipped
            )?;
        }
        write!(f, " ({:.1}s)", self.total_duration.as_secs_f64())
    }
}

/// Collects terminal records from all workers.
#[derive(Debug)]
pub struct ResultAggregator {
    total: usize,
    started: Instant,
    results: Mutex<Vec<RunResult>>,
}

impl ResultAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            started: Instant::now(),
            results: Mutex::new(Vec::with_capacity(total)),
        }
    }

    pub fn record(&self, result: RunResult) {
        let (done, failed) = {
            let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
            results.push(result.clone());
            let failed = results
                .iter()
                .filter(|r| r.final_state == JobState::Failed)
                .count();
            (results.len(), failed)
        };

        match result.category() {
            ResultCategory::Succeeded => {
                tracing::info!(
                    job_id = %result.job_id,
                    attempts = result.attempts_used,
                    duration_ms = result.duration.as_millis() as u64,
                    "Job succeeded"
                );
            }
            ResultCategory::Skipped => {
                tracing::debug!(job_id = %result.job_id, "Job not started");
            }
            _ => {
                tracing::warn!(
                    job_id = %result.job_id,
                    attempts = result.attempts_used,
                    exit_code = ?result.exit_code,
                    reason = %result.failure.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                    "Job failed"
                );
            }
        }
        tracing::info!("Progress: {}/{} (failed: {})", done, self.total, failed);
    }

    pub fn summary(&self) -> RunSummary {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = RunSummary {
            total: self.total,
            total_duration: self.started.elapsed(),
            ..RunSummary::default()
        };
        for result in results.iter() {
            match result.category() {
                ResultCategory::Succeeded => summary.succeeded += 1,
                ResultCategory::Failed => summary.failed += 1,
                ResultCategory::Cancelled => summary.cancelled += 1,
                ResultCategory::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// All recorded results in input order.
    pub fn results(&self) -> Vec<RunResult> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        results.sort_by_key(|r| r.index);
        results
    }

    /// Per-job listing. With `verbose`, failed jobs include their last
    /// stderr snippet.
    pub fn render_details(&self, verbose: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<42} {:<10} {:<8} DETAIL",
            "JOB ID", "STATE", "ATTEMPTS"
        );
        let _ = writeln!(out, "{}", "-".repeat(78));

        for result in self.results() {
            let detail = match &result.failure {
                Some(reason) => reason.to_string(),
                None => result
                    .artifact_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            let _ = writeln!(
                out,
                "{:<42} {:<10} {:<8} {}",
                result.job_id, result.final_state, result.attempts_used, detail
            );
            if verbose && result.final_state == JobState::Failed {
                if let Some(stderr) = &result.stderr_tail {
                    for line in stderr.lines() {
                        let _ = writeln!(out, "    {}", line);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::scheduler::job::AttemptOutcome;
    use crate::worker::command::CommandTemplate;

    fn job(index: usize, id: &str) -> Job {
        let template = Arc::new(CommandTemplate::new("review").unwrap());
        Job::new(index, id, template, &RetryPolicy::default())
    }

    fn finished(index: usize, id: &str, outcome: AttemptOutcome) -> RunResult {
        let mut job = job(index, id);
        job.start_attempt();
        job.apply(outcome);
        RunResult::from_job(&job, Vec::new(), None, Some("  \n".to_string()))
    }

    #[test]
    fn summary_counts_each_category() {
        let aggregator = ResultAggregator::new(4);
        aggregator.record(finished(2, "c", AttemptOutcome::Cancelled));
        aggregator.record(finished(0, "a", AttemptOutcome::Succeeded));
        aggregator.record(finished(1, "b", AttemptOutcome::SetupFailed("disk".into())));
        aggregator.record(RunResult::discarded(&mut job(3, "d")));

        let summary = aggregator.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.all_succeeded());

        let text = summary.to_string();
        assert!(text.starts_with("Completed: 3/4, Succeeded: 1, Failed: 1"));
        assert!(text.contains("Not started: 1"));
    }

    #[test]
    fn results_come_back_in_input_order() {
        let aggregator = ResultAggregator::new(2);
        aggregator.record(finished(1, "second", AttemptOutcome::Succeeded));
        aggregator.record(finished(0, "first", AttemptOutcome::Succeeded));

        let ids: Vec<_> = aggregator.results().into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert!(aggregator.summary().all_succeeded());
    }

    #[test]
    fn blank_stderr_is_dropped_and_skipped_jobs_used_no_attempts() {
        let result = finished(0, "a", AttemptOutcome::Succeeded);
        assert!(result.stderr_tail.is_none());

        let skipped = RunResult::discarded(&mut job(1, "b"));
        assert_eq!(skipped.attempts_used, 0);
        assert_eq!(skipped.category(), ResultCategory::Skipped);
        assert_eq!(skipped.duration, Duration::ZERO);
    }
}
