//! Shutdown coordinator.
//!
//! Bounded and idempotent teardown used by signal handlers, fatal-error
//! paths, conflict resolution and normal exit. A watchdog thread armed at
//! the start terminates the process if teardown overruns its deadline;
//! it runs outside the async runtime so a wedged runtime cannot stall it.

use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use super::InstanceGuard;
use super::driver::{PollDriver, WebhookApi};
use super::terminator::ProcessTerminator;

/// Exit status used when the watchdog fires.
pub const WATCHDOG_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed,
    /// Another shutdown was running; this call did nothing.
    AlreadyInProgress,
}

struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
}

impl Watchdog {
    fn arm(deadline: Duration, processes: Arc<dyn ProcessTerminator>) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("shutdown-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(deadline) {
                    tracing::error!(?deadline, "Shutdown exceeded its deadline; forcing exit");
                    processes.exit(WATCHDOG_EXIT_CODE);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Could not start shutdown watchdog");
            return Self { cancel: None };
        }
        Self { cancel: Some(tx) }
    }

    fn disarm(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Clears the shutdown flag when teardown ends, including when the
/// shutdown future is dropped part way through.
struct InProgress<'a>(&'a InstanceGuard);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.state().shutting_down = false;
    }
}

/// Run `fut` on its own task and give up waiting after `limit`.
///
/// The task keeps running in the background if it overruns.
async fn bounded<F>(step: &str, limit: Duration, fut: F) -> bool
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::spawn(fut)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::warn!(step, error = %e, "Shutdown step panicked");
            false
        }
        Err(_) => {
            tracing::warn!(step, ?limit, "Shutdown step timed out; continuing");
            false
        }
    }
}

impl InstanceGuard {
    /// Tear down the driver, the webhook registration and every lock layer.
    ///
    /// Each step is independent: a failure or timeout is logged and the
    /// next step still runs.
    pub async fn shutdown(
        &self,
        driver: Option<Arc<dyn PollDriver>>,
        api: Option<Arc<dyn WebhookApi>>,
    ) -> ShutdownOutcome {
        {
            let mut state = self.state();
            if state.shutting_down {
                tracing::debug!("Shutdown already in progress");
                return ShutdownOutcome::AlreadyInProgress;
            }
            state.shutting_down = true;
        }
        let _in_progress = InProgress(self);
        tracing::info!("Shutting down instance");
        let watchdog = Watchdog::arm(self.config.shutdown_deadline, Arc::clone(&self.processes));

        if let Some(driver) = driver {
            bounded("stop driver", self.config.driver_stop_timeout, async move {
                driver.stop().await;
            })
            .await;
        }

        if let Some(api) = api {
            let deleted = bounded("delete webhook", self.config.webhook_timeout, async move {
                if let Err(e) = api.delete_webhook(true).await {
                    tracing::warn!(error = %e, "Webhook deletion failed");
                }
            })
            .await;
            if deleted && !self.config.webhook_settle.is_zero() {
                tokio::time::sleep(self.config.webhook_settle).await;
            }
        }

        if self.mutex.release() {
            tracing::debug!("Instance mutex released");
        }

        let (file_lock, port_lock) = {
            let mut state = self.state();
            (state.file_lock.take(), state.port_lock.take())
        };

        if let Some(port) = port_lock {
            port.release();
        }

        self.remove_lock_file(file_lock.as_ref().filter(|l| l.is_held()));
        if let Some(mut lock) = file_lock {
            lock.release();
        }
        self.remove_owned(&self.config.pid_marker_path);

        let stragglers = self.sweep();
        if !stragglers.is_empty() {
            tracing::info!(killed = ?stragglers.killed, "Swept stragglers during shutdown");
        }

        watchdog.disarm();
        tracing::info!("Shutdown complete");
        ShutdownOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::instance::driver::{PollError, PollOptions, WebhookInfo};
    use crate::instance::test_support::fast_config;
    use crate::instance::{InstanceConfig, RecordingTerminator, port_lock};

    /// Driver whose `stop` never returns.
    struct StuckDriver;

    #[async_trait]
    impl PollDriver for StuckDriver {
        async fn start(&self, _: PollOptions) -> Result<(), PollError> {
            Ok(())
        }
        async fn stop(&self) {
            std::future::pending::<()>().await;
        }
        async fn idle(&self) {}
        fn is_running(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingApi {
        deletes: AtomicUsize,
        dropped_pending: AtomicBool,
    }

    #[async_trait]
    impl WebhookApi for CountingApi {
        async fn get_webhook_info(&self) -> Result<WebhookInfo, PollError> {
            Ok(WebhookInfo::default())
        }
        async fn delete_webhook(&self, drop_pending: bool) -> Result<(), PollError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.dropped_pending.store(drop_pending, Ordering::SeqCst);
            Ok(())
        }
    }

    fn guard_with(config: InstanceConfig) -> (InstanceGuard, Arc<RecordingTerminator>) {
        let procs = Arc::new(RecordingTerminator::new());
        (InstanceGuard::new(config, procs.clone()), procs)
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let dir = TempDir::new().unwrap();
        let (g, procs) = guard_with(fast_config(dir.path()));
        g.acquire().await.unwrap();
        let api = Arc::new(CountingApi::default());

        let outcome = g.shutdown(None, Some(api.clone())).await;

        assert_eq!(outcome, ShutdownOutcome::Completed);
        assert!(!g.is_active());
        assert!(!g.mutex().is_held());
        assert!(!g.is_shutting_down());
        assert!(!g.config().lock_path.exists());
        assert!(!g.config().pid_marker_path.exists());
        assert!(!port_lock::is_port_bound(g.config().port));
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
        assert!(api.dropped_pending.load(Ordering::SeqCst));
        assert!(procs.exits().is_empty(), "watchdog disarmed");
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let (g, _) = guard_with(fast_config(dir.path()));
        g.acquire().await.unwrap();
        assert_eq!(g.shutdown(None, None).await, ShutdownOutcome::Completed);
        assert_eq!(g.shutdown(None, None).await, ShutdownOutcome::Completed);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_shutdown_runs_once() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path());
        config.driver_stop_timeout = Duration::from_millis(300);
        let (g, _) = guard_with(config);
        let g = Arc::new(g);

        let first = {
            let g = Arc::clone(&g);
            tokio::spawn(async move {
                let driver: Arc<dyn PollDriver> = Arc::new(StuckDriver);
                g.shutdown(Some(driver), None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(g.is_shutting_down());
        assert_eq!(
            g.shutdown(None, None).await,
            ShutdownOutcome::AlreadyInProgress
        );
        assert_eq!(first.await.unwrap(), ShutdownOutcome::Completed);
    }

    #[tokio::test]
    async fn unresponsive_driver_cannot_stall_shutdown() {
        let dir = TempDir::new().unwrap();
        let (g, procs) = guard_with(fast_config(dir.path()));
        g.acquire().await.unwrap();

        let start = Instant::now();
        let driver: Arc<dyn PollDriver> = Arc::new(StuckDriver);
        assert_eq!(g.shutdown(Some(driver), None).await, ShutdownOutcome::Completed);

        assert!(start.elapsed() < g.config().shutdown_deadline);
        assert!(procs.exits().is_empty());
        assert!(!g.is_active());
    }

    #[tokio::test]
    async fn cancelled_shutdown_does_not_wedge_the_next_one() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path());
        config.shutdown_deadline = Duration::from_millis(200);
        config.driver_stop_timeout = Duration::from_secs(1);
        let (g, procs) = guard_with(config);
        g.acquire().await.unwrap();

        let driver: Arc<dyn PollDriver> = Arc::new(StuckDriver);
        let abandoned = tokio::time::timeout(Duration::from_millis(50), g.shutdown(Some(driver), None)).await;
        assert!(abandoned.is_err());
        assert!(!g.is_shutting_down());

        assert_eq!(g.shutdown(None, None).await, ShutdownOutcome::Completed);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(procs.exits().is_empty(), "dropped watchdog never fires");
    }

    #[tokio::test]
    async fn watchdog_forces_exit_when_deadline_passes() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path());
        config.shutdown_deadline = Duration::from_millis(50);
        config.driver_stop_timeout = Duration::from_millis(400);
        let (g, procs) = guard_with(config);

        let driver: Arc<dyn PollDriver> = Arc::new(StuckDriver);
        g.shutdown(Some(driver), None).await;

        assert_eq!(procs.exits(), vec![WATCHDOG_EXIT_CODE]);
    }
}
