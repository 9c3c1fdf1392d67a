use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared cancellation state for a run.
///
/// Two stages: `cancelled` stops dispatch and asks every in-flight process to
/// terminate; `forced` tells runners to SIGKILL whatever is still alive. The
/// forced stage fires when the grace period expires or on a second interrupt.
#[derive(Debug, Clone)]
pub struct Cancellation {
    graceful: CancellationToken,
    force: CancellationToken,
    grace: Duration,
}

impl Cancellation {
    pub fn new(grace: Duration) -> Self {
        Self {
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Operator interrupt. The first call cancels and starts the grace timer,
    /// any later call forces termination immediately.
    pub fn interrupt(&self) {
        if self.graceful.is_cancelled() {
            self.force_kill();
        } else {
            self.cancel();
        }
    }

    /// Stop dispatch and start the grace period.
    pub fn cancel(&self) {
        if self.graceful.is_cancelled() {
            return;
        }
        self.graceful.cancel();

        let force = self.force.clone();
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(grace) => {
                            tracing::warn!(grace = ?grace, "Grace period expired, killing remaining processes");
                            force.cancel();
                        }
                        _ = force.cancelled() => {}
                    }
                });
            }
            Err(_) => force.cancel(),
        }
    }

    pub fn force_kill(&self) {
        self.graceful.cancel();
        self.force.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.graceful.cancelled().await
    }

    pub async fn forced(&self) {
        self.force.cancelled().await
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Install handlers for SIGINT and SIGTERM that drive `cancellation`.
///
/// The first signal starts a graceful cancellation, the second forces it.
/// The handler does nothing else; all draining happens in the pool.
pub fn install_shutdown_handler(cancellation: Cancellation) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                }
            }

            if cancellation.is_cancelled() {
                tracing::warn!("Second interrupt, killing all processes now");
            } else {
                tracing::warn!(
                    grace = ?cancellation.grace(),
                    "Interrupted, shutting down in-flight processes"
                );
            }
            cancellation.interrupt();

            if cancellation.is_forced() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_interrupt_cancels_second_forces() {
        let cancellation = Cancellation::new(Duration::from_secs(60));
        assert!(!cancellation.is_cancelled());

        cancellation.interrupt();
        assert!(cancellation.is_cancelled());
        assert!(!cancellation.is_forced());

        cancellation.interrupt();
        assert!(cancellation.is_forced());
    }

    #[tokio::test]
    async fn grace_period_expiry_forces() {
        let cancellation = Cancellation::new(Duration::from_millis(50));
        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(2), cancellation.forced())
            .await
            .expect("force should fire after the grace period");
    }

    #[tokio::test]
    async fn clones_share_state() {
        let cancellation = Cancellation::default();
        let other = cancellation.clone();
        other.force_kill();
        assert!(cancellation.is_cancelled());
        assert!(cancellation.is_forced());
    }
}
