use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::worker::command::CommandTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    RetryPending,
    TimedOut,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::RetryPending => write!(f, "retry-pending"),
            JobState::TimedOut => write!(f, "timed-out"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a single attempt counts as a retryable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TransientCause {
    NonZeroExit(Option<i32>),
    EmptyOutput,
    TimedOut,
    ProcessError(String),
}

impl std::fmt::Display for TransientCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientCause::NonZeroExit(Some(code)) => write!(f, "exit code {}", code),
            TransientCause::NonZeroExit(None) => write!(f, "killed by signal"),
            TransientCause::EmptyOutput => write!(f, "exited cleanly with no output"),
            TransientCause::TimedOut => write!(f, "timed out"),
            TransientCause::ProcessError(e) => write!(f, "process error: {}", e),
        }
    }
}

/// Reason attached to a job that ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// Every attempt failed transiently; holds the last cause.
    Exhausted(TransientCause),
    /// The workspace could not be prepared.
    Setup(String),
    /// Terminated by an operator interrupt.
    Cancelled,
    /// Still queued when the run was cancelled.
    Skipped,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Exhausted(cause) => write!(f, "retries exhausted, last: {}", cause),
            FailureReason::Setup(reason) => write!(f, "setup failed: {}", reason),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Skipped => write!(f, "skipped (cancelled before start)"),
        }
    }
}

/// Classified result of one attempt, fed into [`Job::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Transient(TransientCause),
    SetupFailed(String),
    Cancelled,
}

/// State change produced by [`Job::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The job must go back on the queue for another attempt.
    Retry,
    Succeeded,
    Failed(FailureReason),
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Position in the input list.
    pub index: usize,
    pub id: String,
    pub command: Arc<CommandTemplate>,
    pub timeout: Option<Duration>,
    pub max_attempts: u32,
    /// Number of the current or next attempt, starting at 1.
    pub attempt: u32,
    pub state: JobState,
    pub failure: Option<FailureReason>,
    pub last_cause: Option<TransientCause>,
    pub started_at: Option<DateTime<Utc>>,
    first_started: Option<Instant>,
    attempts_made: u32,
}

impl Job {
    pub fn new(
        index: usize,
        id: impl Into<String>,
        command: Arc<CommandTemplate>,
        policy: &RetryPolicy,
    ) -> Self {
        Self {
            index,
            id: id.into(),
            command,
            timeout: policy.timeout,
            max_attempts: policy.max_attempts.max(1),
            attempt: 1,
            state: JobState::Pending,
            failure: None,
            last_cause: None,
            started_at: None,
            first_started: None,
            attempts_made: 0,
        }
    }

    /// Mark the job as owned by a runner for its current attempt.
    pub fn start_attempt(&mut self) {
        debug_assert_eq!(self.state, JobState::Pending);
        if self.first_started.is_none() {
            self.first_started = Some(Instant::now());
            self.started_at = Some(Utc::now());
        }
        self.attempts_made += 1;
        self.state = JobState::Running;
    }

    /// Apply an attempt outcome. Transient failures consume the retry budget;
    /// setup failures and cancellation are permanent regardless of the budget.
    pub fn apply(&mut self, outcome: AttemptOutcome) -> Transition {
        match outcome {
            AttemptOutcome::Succeeded => {
                self.state = JobState::Succeeded;
                Transition::Succeeded
            }
            AttemptOutcome::SetupFailed(reason) => self.fail(FailureReason::Setup(reason)),
            AttemptOutcome::Cancelled => self.fail(FailureReason::Cancelled),
            AttemptOutcome::Transient(cause) => {
                if cause == TransientCause::TimedOut {
                    self.state = JobState::TimedOut;
                }
                self.last_cause = Some(cause.clone());
                if self.attempt < self.max_attempts {
                    self.attempt += 1;
                    self.state = JobState::RetryPending;
                    Transition::Retry
                } else {
                    self.fail(FailureReason::Exhausted(cause))
                }
            }
        }
    }

    /// Move a `RetryPending` job back to `Pending` before it is re-enqueued.
    pub fn requeue(&mut self) {
        if self.state == JobState::RetryPending {
            self.state = JobState::Pending;
        }
    }

    /// Fail a job pulled off the queue by cancellation. One that never ran
    /// is `Skipped`; one waiting for a retry already ran and is `Cancelled`.
    pub fn discard(&mut self) {
        if self.attempts_made == 0 {
            self.fail(FailureReason::Skipped);
        } else {
            self.fail(FailureReason::Cancelled);
        }
    }

    /// Attempts actually started, not counting a pending retry.
    pub fn attempts_used(&self) -> u32 {
        self.attempts_made
    }

    /// Wall-clock time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.first_started
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn fail(&mut self, reason: FailureReason) -> Transition {
        self.state = JobState::Failed;
        self.failure = Some(reason.clone());
        Transition::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(max_attempts: u32) -> Job {
        let policy = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        let template = Arc::new(CommandTemplate::new("true").unwrap());
        Job::new(0, "abc123", template, &policy)
    }

    fn run_attempt(job: &mut Job, outcome: AttemptOutcome) -> Transition {
        job.start_attempt();
        let transition = job.apply(outcome);
        job.requeue();
        transition
    }

    #[test]
    fn new_job_is_pending_on_first_attempt() {
        let job = job(5);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.attempts_used(), 0);
    }

    #[test]
    fn success_is_terminal() {
        let mut job = job(3);
        job.start_attempt();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.apply(AttemptOutcome::Succeeded), Transition::Succeeded);
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.state.is_terminal());
        assert_eq!(job.attempts_used(), 1);
    }

    #[test]
    fn transient_failures_retry_until_budget_is_spent() {
        let mut job = job(3);
        let cause = TransientCause::NonZeroExit(Some(1));

        assert_eq!(
            run_attempt(&mut job, AttemptOutcome::Transient(cause.clone())),
            Transition::Retry
        );
        assert_eq!(job.attempt, 2);
        assert_eq!(job.state, JobState::Pending);

        assert_eq!(
            run_attempt(&mut job, AttemptOutcome::Transient(cause.clone())),
            Transition::Retry
        );
        assert_eq!(
            run_attempt(&mut job, AttemptOutcome::Transient(cause.clone())),
            Transition::Failed(FailureReason::Exhausted(cause))
        );
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_used(), 3);
        assert!(job.attempt <= job.max_attempts);
    }

    #[test]
    fn timeout_passes_through_retry_pending() {
        let mut job = job(2);
        job.start_attempt();
        assert_eq!(
            job.apply(AttemptOutcome::Transient(TransientCause::TimedOut)),
            Transition::Retry
        );
        assert_eq!(job.state, JobState::RetryPending);
        assert_eq!(job.last_cause, Some(TransientCause::TimedOut));
    }

    #[test]
    fn empty_output_shares_the_retry_budget() {
        let mut job = job(2);
        run_attempt(&mut job, AttemptOutcome::Transient(TransientCause::EmptyOutput));
        let last = run_attempt(&mut job, AttemptOutcome::Transient(TransientCause::EmptyOutput));
        assert_eq!(
            last,
            Transition::Failed(FailureReason::Exhausted(TransientCause::EmptyOutput))
        );
    }

    #[test]
    fn setup_failure_is_not_retried() {
        let mut job = job(5);
        let transition = run_attempt(&mut job, AttemptOutcome::SetupFailed("denied".into()));
        assert_eq!(
            transition,
            Transition::Failed(FailureReason::Setup("denied".into()))
        );
        assert_eq!(job.attempts_used(), 1);
    }

    #[test]
    fn cancellation_is_not_retried() {
        let mut job = job(5);
        let transition = run_attempt(&mut job, AttemptOutcome::Cancelled);
        assert_eq!(transition, Transition::Failed(FailureReason::Cancelled));
        assert_eq!(job.failure, Some(FailureReason::Cancelled));
    }

    #[test]
    fn skipped_job_used_no_attempts() {
        let mut job = job(5);
        job.discard();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure, Some(FailureReason::Skipped));
        assert_eq!(job.attempts_used(), 0);
    }

    #[test]
    fn discarded_retry_counts_only_attempts_that_ran() {
        let mut job = job(5);
        run_attempt(&mut job, AttemptOutcome::Transient(TransientCause::EmptyOutput));
        assert_eq!(job.attempt, 2);
        assert_eq!(job.attempts_used(), 1);

        job.discard();
        assert_eq!(job.failure, Some(FailureReason::Cancelled));
        assert_eq!(job.attempts_used(), 1);
    }

    #[test]
    fn max_attempts_of_zero_still_allows_one_run() {
        let mut job = job(0);
        assert_eq!(job.max_attempts, 1);
        let transition = run_attempt(&mut job, AttemptOutcome::Transient(TransientCause::EmptyOutput));
        assert!(matches!(transition, Transition::Failed(_)));
    }
}
