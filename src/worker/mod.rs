//! Execution of individual job attempts.
//!
//! This module handles everything that happens between a worker taking a job
//! off the queue and handing back its outcome:
//! - **Workspaces**: one directory per job id, optionally a git worktree
//! - **Invocation**: typed construction of the shell command for a job
//! - **Processes**: spawning, output capture, termination of process groups
//! - **Attempts**: timeout, cancellation and outcome classification
//!
//! # Components
//!
//! - [`WorkspaceManager`]: creates and hands out job workspaces
//! - [`CommandTemplate`]: builds an [`Invocation`](command::Invocation) for a job
//! - [`ProcessLauncher`] / [`ProcessHandle`]: process seam, real
//!   implementation in [`ProcessExecutor`]
//! - [`JobRunner`]: runs one attempt and applies the retry state machine
//!
//! # Execution Flow
//!
//! 1. [`WorkspaceManager::acquire`] prepares the job directory
//! 2. [`CommandTemplate::build`] produces `sh -c <script> revpool <id> <workspace>`
//! 3. [`ProcessExecutor`] streams stdout into the workspace output file
//! 4. [`JobRunner`] races exit against the timeout and cancellation, then
//!    classifies the attempt

pub mod command;
pub mod executor;
pub mod runner;
pub mod workspace;

pub use command::{CommandTemplate, Invocation, InvocationParams};
pub use executor::{ProcessExecutor, ProcessExit, ProcessHandle, ProcessLauncher};
pub use runner::JobRunner;
pub use workspace::{WorkspaceHandle, WorkspaceManager};
