//! Job scheduling: the job model, the FIFO queue and the worker pool.
//!
//! # Components
//!
//! - [`Job`]: one unit of work and its retry state machine
//! - [`JobQueue`]: FIFO of pending jobs, built from an identifier list
//! - [`WorkerPool`]: fixed number of workers draining the queue through a
//!   [`JobRunner`](crate::worker::JobRunner)
//!
//! # Dispatch
//!
//! Jobs are dispatched in queue order. A job that needs another attempt is
//! pushed to the tail, behind every job already waiting. Completion order is
//! not defined.

pub mod job;
pub mod pool;
pub mod queue;

pub use job::{AttemptOutcome, FailureReason, Job, JobState, Transition, TransientCause};
pub use pool::{PoolSnapshot, PoolState, WorkerPool};
pub use queue::{parse_id_list, JobQueue};
