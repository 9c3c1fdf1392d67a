use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::worker::command::Invocation;

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Exit information of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Bytes written to the captured-output file.
    pub stdout_bytes: u64,
    /// Last few KiB of stderr.
    pub stderr_tail: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A running external process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel-safe: dropping the future
    /// and calling `wait` again continues the same wait.
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Wait at most `limit`; `Ok(None)` means the process is still running.
    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<Option<ProcessExit>> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Ask the process to exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts external processes for job attempts.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start `invocation`, streaming its stdout into `stdout_path`.
    async fn start(
        &self,
        invocation: &Invocation,
        stdout_path: &Path,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Runs invocations as real child processes.
///
/// Each child leads its own process group so that termination reaches every
/// process the command spawned, not just the shell.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for ProcessExecutor {
    async fn start(
        &self,
        invocation: &Invocation,
        stdout_path: &Path,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let output_file = tokio::fs::File::create(stdout_path).await?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = command.spawn()?;
        let pgid = child.id();

        tracing::debug!(
            pid = ?pgid,
            cwd = %invocation.cwd.display(),
            output = %stdout_path.display(),
            "Process started"
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(copy_to_file(stdout, output_file)));
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

        Ok(Box::new(ChildProcess {
            child,
            pgid,
            stdout_task,
            stderr_task,
            stdout_bytes: 0,
            stderr_tail: String::new(),
            exit_code: None,
        }))
    }
}

struct ChildProcess {
    child: Child,
    /// Kept after the leader is reaped so stragglers in the group can still
    /// be signalled.
    pgid: Option<u32>,
    stdout_task: Option<JoinHandle<io::Result<u64>>>,
    stderr_task: Option<JoinHandle<String>>,
    stdout_bytes: u64,
    stderr_tail: String,
    exit_code: Option<Option<i32>>,
}

impl ChildProcess {
    fn signal_group(&self, signal: Signal) -> io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pgid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pgid
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        if self.exit_code.is_none() {
            let status = self.child.wait().await?;
            self.exit_code = Some(status.code());
        }

        if let Some(task) = self.stdout_task.as_mut() {
            let copied = task.await;
            self.stdout_task = None;
            self.stdout_bytes = copied.map_err(io::Error::other)??;
        }

        if let Some(task) = self.stderr_task.as_mut() {
            let tail = task.await;
            self.stderr_task = None;
            self.stderr_tail = tail.unwrap_or_default();
        }

        Ok(ProcessExit {
            exit_code: self.exit_code.flatten(),
            stdout_bytes: self.stdout_bytes,
            stderr_tail: self.stderr_tail.clone(),
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal_group(Signal::SIGKILL)
    }
}

async fn copy_to_file<R>(mut reader: R, mut file: tokio::fs::File) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(copied)
}

async fn read_tail<R>(mut reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
