use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::RetryPolicy;
use crate::error::{Result, RevpoolError};
use crate::scheduler::job::{Job, JobState};
use crate::worker::command::CommandTemplate;

/// Parse an identifier list: one id per line, whitespace trimmed, blank
/// lines skipped. Only a `#` in the first column starts a comment; an
/// indented `#` is part of an id.
pub fn parse_id_list(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// FIFO queue of jobs awaiting dispatch.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the ordered set of `Pending` jobs for a run. Duplicate ids are
    /// kept as independent jobs.
    pub fn from_ids(
        ids: &[String],
        command: Arc<CommandTemplate>,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        if ids.is_empty() {
            return Err(RevpoolError::Configuration(
                "identifier list is empty".to_string(),
            ));
        }
        if command.is_empty() {
            return Err(RevpoolError::Configuration(
                "command template is empty".to_string(),
            ));
        }

        let jobs = ids
            .iter()
            .enumerate()
            .map(|(index, id)| Job::new(index, id.clone(), command.clone(), policy))
            .collect();
        Ok(Self { jobs })
    }

    /// Append a job at the tail. Retries land behind every job already queued.
    pub fn push(&mut self, job: Job) {
        debug_assert_eq!(job.state, JobState::Pending);
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Remove the first job, in queue order, for which `eligible` holds.
    pub fn pop_first<F>(&mut self, eligible: F) -> Option<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let position = self.jobs.iter().position(eligible)?;
        self.jobs.remove(position)
    }

    /// Remove and return every queued job in queue order.
    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
