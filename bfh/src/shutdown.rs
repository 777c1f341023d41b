//! Interrupt handling.
//!
//! Signal handlers only flip a flag. Whoever owns resources observes it
//! through [`ShutdownSignal::cancelled`] and cleans up on its own path.

use bfh_common::{BfhError, Result};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    #[cfg(test)]
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. If every trigger is
    /// dropped without firing, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Drive `work` to completion unless shutdown comes first, in which case
    /// `work` is dropped and `Cancelled` returned.
    pub async fn guard<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BfhError::Cancelled),
            result = work => result,
        }
    }
}

/// Spawn a task that fires `trigger` on SIGINT or SIGTERM.
pub fn install_signal_handlers(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                warn!("Failed to register signal handlers; falling back to Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received interrupt");
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, signal) = channel();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let signal = ShutdownSignal::never();
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_guard_returns_work_result() {
        let (_trigger, signal) = channel();
        let value = signal.guard(async { Ok::<_, BfhError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_abandons_pending_work_on_shutdown() {
        let (trigger, signal) = channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            signal.guard(std::future::pending::<Result<()>>()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(BfhError::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_after_shutdown_skips_work() {
        let (trigger, signal) = channel();
        trigger.trigger();
        let result = signal.guard(async { Ok::<_, BfhError>(()) }).await;
        assert!(matches!(result, Err(BfhError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_trigger_is_not_a_shutdown() {
        let (trigger, signal) = channel();
        drop(trigger);
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}
