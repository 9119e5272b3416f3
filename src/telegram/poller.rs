//! Long-poll driver.
//!
//! `start` bootstraps synchronously so a competing session surfaces as a
//! startup conflict, then hands `getUpdates` to a background task. Errors
//! from that task are routed to a [`PollErrorHandler`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::TelegramError;
use crate::instance::{ErrorDisposition, PollDriver, PollError, PollErrorHandler, PollOptions};
use crate::telegram::client::TelegramClient;
use crate::telegram::types::Update;

/// Pause after an error the handler only logged, so a persistent failure
/// does not spin.
const LOGGED_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Receives every update the poller fetches, in order.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, update: Update);
}

#[derive(Default)]
struct Task {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct TelegramPoller {
    client: Arc<TelegramClient>,
    updates: Arc<dyn UpdateHandler>,
    errors: Arc<dyn PollErrorHandler>,
    task: Mutex<Task>,
    running: Arc<watch::Sender<bool>>,
}

impl TelegramPoller {
    pub fn new(
        client: Arc<TelegramClient>,
        updates: Arc<dyn UpdateHandler>,
        errors: Arc<dyn PollErrorHandler>,
    ) -> Self {
        Self {
            client,
            updates,
            errors,
            task: Mutex::new(Task::default()),
            running: Arc::new(watch::Sender::new(false)),
        }
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Task> {
        self.task.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Clear any webhook and probe for a competing poller.
    ///
    /// Returns the offset polling should start from.
    async fn bootstrap(&self, options: &PollOptions) -> Result<Option<i64>, PollError> {
        let info = self.client.get_webhook_info().await?;
        if info.is_set() {
            tracing::warn!(
                pending = info.pending_update_count,
                "Webhook registered; removing it before polling"
            );
        }
        self.client.delete_webhook(true).await?;

        // A zero-timeout poll fails with 409 if another session is polling.
        let probe_offset = options.drop_pending_updates.then_some(-1);
        let backlog = self.client.get_updates(probe_offset, Duration::ZERO).await?;
        if options.drop_pending_updates {
            if let Some(last) = backlog.last() {
                tracing::info!(skipped_through = last.update_id, "Dropping pending updates");
                return Ok(Some(last.update_id + 1));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PollDriver for TelegramPoller {
    async fn start(&self, options: PollOptions) -> Result<(), PollError> {
        if self.is_running() {
            return Err(TelegramError::AlreadyRunning.into());
        }
        let offset = self.bootstrap(&options).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.running.send_replace(true);
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.client),
            Arc::clone(&self.updates),
            Arc::clone(&self.errors),
            Arc::clone(&self.running),
            offset,
            options.timeout,
            stop_rx,
        ));

        let mut task = self.task();
        task.stop_tx = Some(stop_tx);
        task.handle = Some(handle);
        tracing::info!(timeout = ?options.timeout, "Polling for updates");
        Ok(())
    }

    async fn stop(&self) {
        let (stop_tx, handle) = {
            let mut task = self.task();
            (task.stop_tx.take(), task.handle.take())
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Polling task ended abnormally");
            }
        }
        self.running.send_replace(false);
    }

    async fn idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

async fn poll_loop(
    client: Arc<TelegramClient>,
    updates: Arc<dyn UpdateHandler>,
    errors: Arc<dyn PollErrorHandler>,
    running: Arc<watch::Sender<bool>>,
    mut offset: Option<i64>,
    timeout: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        let batch = tokio::select! {
            _ = &mut stop_rx => break,
            batch = client.get_updates(offset, timeout) => batch,
        };

        match batch {
            Ok(batch) => {
                for update in batch {
                    offset = Some(update.update_id + 1);
                    updates.handle_update(update).await;
                }
            }
            Err(e) => {
                let error = PollError::from(e);
                let disposition = tokio::select! {
                    _ = &mut stop_rx => break,
                    d = errors.on_error(error) => d,
                };
                match disposition {
                    ErrorDisposition::Terminated => break,
                    ErrorDisposition::Logged => {
                        tokio::select! {
                            _ = &mut stop_rx => break,
                            _ = tokio::time::sleep(LOGGED_ERROR_PAUSE) => {}
                        }
                    }
                    ErrorDisposition::Ignored | ErrorDisposition::Retried(_) => {}
                }
            }
        }
    }
    running.send_replace(false);
    tracing::info!("Polling stopped");
}
