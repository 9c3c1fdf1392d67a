use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::results::{ResultAggregator, RunResult};
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobQueue;
use crate::shutdown::Cancellation;
use crate::worker::JobRunner;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    /// Retries waiting out their backoff before re-entering the queue.
    pub delayed: usize,
    /// Highest `in_flight` observed during the run.
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct Inner {
    queue: JobQueue,
    in_flight: usize,
    /// Ids with an attempt running. A workspace belongs to one id, so an id
    /// is never dispatched twice at once.
    running_ids: HashSet<String>,
    delayed: usize,
    peak_in_flight: usize,
}

/// Run state shared by every worker: the queue, the in-flight counter and
/// the cancellation flag. Handed to each worker explicitly at startup.
#[derive(Debug)]
pub struct PoolState {
    inner: Mutex<Inner>,
    notify: Notify,
    cancellation: Cancellation,
}

impl PoolState {
    pub fn new(queue: JobQueue, cancellation: Cancellation) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue,
                ..Inner::default()
            }),
            notify: Notify::new(),
            cancellation,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        PoolSnapshot {
            queued: inner.queue.len(),
            in_flight: inner.in_flight,
            delayed: inner.delayed,
            peak_in_flight: inner.peak_in_flight,
        }
    }

    /// Take the next job whose id is not already running, counting it as in
    /// flight.
    ///
    /// Blocks while no queued job is eligible but running jobs may still
    /// free an id or produce retries. Returns `None` once nothing is left to
    /// do or the run has been cancelled.
    pub async fn next_job(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if self.cancellation.is_cancelled() {
                    return None;
                }
                let Inner {
                    queue,
                    in_flight,
                    running_ids,
                    peak_in_flight,
                    ..
                } = &mut *inner;
                if let Some(job) = queue.pop_first(|job| !running_ids.contains(&job.id)) {
                    running_ids.insert(job.id.clone());
                    *in_flight += 1;
                    *peak_in_flight = (*peak_in_flight).max(*in_flight);
                    return Some(job);
                }
                if inner.in_flight == 0 && inner.delayed == 0 {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancellation.cancelled() => {}
            }
        }
    }

    /// A worker finished its attempt of `job_id`; `retry` goes to the queue
    /// tail.
    pub fn complete(&self, job_id: &str, retry: Option<Job>) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.running_ids.remove(job_id);
            if let Some(job) = retry {
                inner.queue.push(job);
            }
        }
        self.notify.notify_waiters();
    }

    /// Like [`complete`](Self::complete) with a retry that re-enters the
    /// queue after `delay`. Cancellation cuts the delay short so the job is
    /// drained and recorded along with the rest of the queue.
    pub fn complete_after(self: &Arc<Self>, job: Job, delay: Duration) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.running_ids.remove(&job.id);
            inner.delayed += 1;
        }
        self.notify.notify_waiters();

        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = state.cancellation.cancelled() => {}
            }
            {
                let mut inner = state.lock();
                inner.delayed -= 1;
                inner.queue.push(job);
            }
            state.notify.notify_waiters();
        });
    }

    /// Wait until no retry is sitting out its backoff.
    pub async fn settle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let delayed = self.lock().delayed;
            if delayed == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Remove every job still queued.
    pub fn drain_queued(&self) -> Vec<Job> {
        self.lock().queue.drain()
    }
}

/// Fixed-size set of workers draining a [`JobQueue`] through a [`JobRunner`].
pub struct WorkerPool {
    runner: Arc<JobRunner>,
    size: usize,
    retry_backoff: Duration,
    cancellation: Cancellation,
    aggregator: Arc<ResultAggregator>,
}

impl WorkerPool {
    pub fn new(
        runner: Arc<JobRunner>,
        size: usize,
        cancellation: Cancellation,
        aggregator: Arc<ResultAggregator>,
    ) -> Self {
        Self {
            runner,
            size: size.max(1),
            retry_backoff: Duration::ZERO,
            cancellation,
            aggregator,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run every job to a terminal state, or until cancellation drains the
    /// pool. Jobs still queued at cancellation are recorded as skipped, or as
    /// cancelled when they were waiting for a retry.
    pub async fn run(&self, jobs: JobQueue) -> PoolSnapshot {
        let total = jobs.len();
        let state = Arc::new(PoolState::new(jobs, self.cancellation.clone()));

        tracing::info!(jobs = total, workers = self.size, "Starting worker pool");

        let mut handles = Vec::with_capacity(self.size);
        for worker_id in 0..self.size {
            let state = Arc::clone(&state);
            let runner = Arc::clone(&self.runner);
            let aggregator = Arc::clone(&self.aggregator);
            let backoff = self.retry_backoff;
            handles.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, state, runner, aggregator, backoff).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        state.settle().await;
        let discarded = state.drain_queued();
        if !discarded.is_empty() {
            tracing::warn!(count = discarded.len(), "Discarding queued jobs after cancellation");
        }
        for mut job in discarded {
            self.aggregator.record(RunResult::discarded(&mut job));
        }

        let snapshot = state.snapshot();
        tracing::info!(
            peak_in_flight = snapshot.peak_in_flight,
            cancelled = state.is_cancelled(),
            "Worker pool finished"
        );
        snapshot
    }

    /// Worker loop: take a job, run one attempt, requeue or record it.
    ///
    /// A job is moved into exactly one worker at a time, so no two attempts
    /// of the same job ever overlap.
    async fn worker_loop(
        worker_id: usize,
        state: Arc<PoolState>,
        runner: Arc<JobRunner>,
        aggregator: Arc<ResultAggregator>,
        backoff: Duration,
    ) {
        while let Some(mut job) = state.next_job().await {
            tracing::debug!(worker_id, job_id = %job.id, attempt = job.attempt, "Dispatching job");

            match runner.run(&mut job).await {
                Some(result) => {
                    aggregator.record(result);
                    state.complete(&job.id, None);
                }
                None => {
                    job.requeue();
                    if backoff.is_zero() {
                        let job_id = job.id.clone();
                        state.complete(&job_id, Some(job));
                    } else {
                        state.complete_after(job, backoff);
                    }
                }
            }
        }
        tracing::debug!(worker_id, "Worker exiting");
    }
}
