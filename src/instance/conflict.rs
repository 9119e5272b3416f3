//! Conflict resolution and the startup retry loop.
//!
//! An upstream conflict means another session is polling with the same
//! token. This process never contends: it tears down its lock stack and
//! exits. Transient network failures back off and let the driver retry.

use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;

use super::InstanceGuard;
use super::driver::{
    ErrorDisposition, PollDriver, PollError, PollErrorHandler, PollOptions, WebhookApi,
};
use super::shutdown::ShutdownOutcome;
use crate::error::InstanceError;

/// Exit status after yielding to another session.
///
/// Zero, so supervisors configured to restart on failure leave the
/// process down.
pub const CONFLICT_EXIT_CODE: i32 = 0;

/// Error handler for the long-poll driver.
#[derive(Clone)]
pub struct ConflictController {
    guard: Arc<InstanceGuard>,
    driver: Arc<OnceLock<Weak<dyn PollDriver>>>,
    api: Option<Arc<dyn WebhookApi>>,
}

impl ConflictController {
    pub fn new(guard: Arc<InstanceGuard>, api: Option<Arc<dyn WebhookApi>>) -> Self {
        Self {
            guard,
            driver: Arc::new(OnceLock::new()),
            api,
        }
    }

    /// Register the driver to stop when a conflict is resolved.
    ///
    /// The driver usually owns this controller, so only a weak reference
    /// is kept. Later calls are ignored.
    pub fn attach_driver(&self, driver: &Arc<dyn PollDriver>) {
        if self.driver.set(Arc::downgrade(driver)).is_err() {
            tracing::debug!("Conflict controller already has a driver");
        }
    }

    fn driver(&self) -> Option<Arc<dyn PollDriver>> {
        self.driver.get().and_then(Weak::upgrade)
    }

    /// Act on a driver error and wait for the action to finish.
    pub async fn handle(&self, error: PollError) -> ErrorDisposition {
        match error {
            PollError::Conflict(message) => self.resolve_conflict(&message).await,
            PollError::Network(message) => {
                let delay = self.guard.config().network_backoff.delay(0);
                tracing::warn!(error = %message, ?delay, "Network error while polling; backing off");
                tokio::time::sleep(delay).await;
                ErrorDisposition::Retried(delay)
            }
            PollError::Other(message) => {
                tracing::error!(error = %message, "Unhandled polling error");
                ErrorDisposition::Logged
            }
        }
    }

    async fn resolve_conflict(&self, message: &str) -> ErrorDisposition {
        if self.guard.is_shutting_down() {
            tracing::debug!(error = %message, "Conflict reported during shutdown; ignoring");
            return ErrorDisposition::Ignored;
        }
        tracing::error!(
            error = %message,
            pid = std::process::id(),
            "Another session is polling the bot API; yielding"
        );

        if self.guard.shutdown(self.driver(), self.api.clone()).await
            == ShutdownOutcome::AlreadyInProgress
        {
            return ErrorDisposition::Ignored;
        }
        self.guard.reclaim();

        tracing::error!(code = CONFLICT_EXIT_CODE, "Exiting after conflict");
        self.guard.processes().exit(CONFLICT_EXIT_CODE);
        ErrorDisposition::Terminated
    }
}

#[async_trait]
impl PollErrorHandler for ConflictController {
    /// Conflicts are resolved on a separate task: stopping the driver waits
    /// for the poll loop, and the poll loop is the caller.
    async fn on_error(&self, error: PollError) -> ErrorDisposition {
        match error {
            PollError::Conflict(message) => {
                if self.guard.is_shutting_down() {
                    return ErrorDisposition::Ignored;
                }
                let this = self.clone();
                tokio::spawn(async move {
                    this.resolve_conflict(&message).await;
                });
                ErrorDisposition::Terminated
            }
            other => self.handle(other).await,
        }
    }
}

/// Acquire the lock stack and start the driver, retrying on contention.
///
/// Each attempt re-runs the sweeper and reclaimer (inside
/// [`InstanceGuard::acquire`]). A conflict or network failure while the
/// driver bootstraps tears everything down again before the next
/// attempt. A live file-lock owner or an unexpected driver error ends
/// the loop immediately.
pub async fn start_with_retry(
    guard: &InstanceGuard,
    driver: Arc<dyn PollDriver>,
    api: Option<Arc<dyn WebhookApi>>,
    options: PollOptions,
) -> Result<(), InstanceError> {
    let config = guard.config();
    let attempts = config.startup_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = config.startup_backoff.delay(attempt - 1);
            tracing::info!(attempt = attempt + 1, max = attempts, ?delay, "Retrying startup");
            tokio::time::sleep(delay).await;
        }

        match guard.acquire().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(attempt = attempt + 1, error = %e, "Could not acquire instance locks");
                last_error = e.to_string();
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Another instance holds the lock; aborting startup");
                guard.reclaim();
                return Err(e);
            }
        }

        let started = tokio::time::timeout(config.driver_start_timeout, driver.start(options.clone()))
            .await
            .unwrap_or_else(|_| Err(PollError::Network("driver start timed out".to_string())));

        match started {
            Ok(()) => {
                tracing::info!(attempt = attempt + 1, "Long-poll driver started");
                return Ok(());
            }
            Err(PollError::Other(message)) => {
                tracing::error!(error = %message, "Long-poll driver failed to start");
                guard.shutdown(Some(Arc::clone(&driver)), api.clone()).await;
                guard.reclaim();
                return Err(InstanceError::DriverStart(message));
            }
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "Startup attempt failed; cleaning up");
                last_error = e.to_string();
                guard.shutdown(Some(Arc::clone(&driver)), api.clone()).await;
                guard.reclaim();
            }
        }
    }

    tracing::error!(attempts, error = %last_error, "Startup attempts exhausted");
    guard.shutdown(Some(driver), api).await;
    guard.reclaim();
    Err(InstanceError::StartupExhausted {
        attempts,
        last_error,
    })
}

/// How [`start_until`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup<T> {
    Started,
    /// `interrupt` resolved first; the partial startup was torn down.
    Interrupted(T),
}

/// [`start_with_retry`], abandoned as soon as `interrupt` resolves.
///
/// Startup may spend minutes in backoff while holding some of the lock
/// layers. An interrupt drops the startup future wherever it is and runs
/// [`InstanceGuard::shutdown`], so nothing it took is left behind.
/// `interrupt` is borrowed so the caller can keep waiting on it once the
/// driver runs.
pub async fn start_until<F>(
    guard: &InstanceGuard,
    driver: Arc<dyn PollDriver>,
    api: Option<Arc<dyn WebhookApi>>,
    options: PollOptions,
    interrupt: &mut F,
) -> Result<Startup<F::Output>, InstanceError>
where
    F: Future + Unpin,
{
    let interrupted = tokio::select! {
        result = start_with_retry(guard, Arc::clone(&driver), api.clone(), options) => {
            return result.map(|()| Startup::Started);
        }
        value = interrupt => value,
    };

    tracing::info!("Startup interrupted; tearing down");
    match guard.shutdown(Some(driver), api).await {
        ShutdownOutcome::Completed => {}
        ShutdownOutcome::AlreadyInProgress => {
            while guard.is_shutting_down() {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
    guard.reclaim();
    Ok(Startup::Interrupted(interrupted))
}
