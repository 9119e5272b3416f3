//! Interfaces the instance subsystem consumes from the bot API layer.
//!
//! The core never talks HTTP itself: it stops and starts a [`PollDriver`],
//! clears webhook registrations through a [`WebhookApi`], and receives
//! typed [`PollError`]s through a [`PollErrorHandler`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TelegramError;

/// Errors reported on the long-poll driver's error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The upstream service reports a second active session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Recoverable transport failure.
    #[error("network: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl From<TelegramError> for PollError {
    fn from(e: TelegramError) -> Self {
        match e {
            TelegramError::Conflict(msg) => PollError::Conflict(msg),
            TelegramError::Api { code: 409, description } => PollError::Conflict(description),
            TelegramError::Network(msg) => PollError::Network(msg),
            TelegramError::Api { code, description } if code >= 500 || code == 429 => {
                PollError::Network(format!("{code}: {description}"))
            }
            other => PollError::Other(other.to_string()),
        }
    }
}

/// Options passed to [`PollDriver::start`].
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Discard updates queued while no one was polling.
    pub drop_pending_updates: bool,
    /// Long-poll timeout for each `getUpdates` call.
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            drop_pending_updates: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Webhook registration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pending_update_count: u32,
}

impl WebhookInfo {
    /// Whether a webhook is actually registered (the API reports an empty
    /// URL when none is).
    pub fn is_set(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Long-poll driver lifecycle.
#[async_trait]
pub trait PollDriver: Send + Sync {
    /// Bootstrap and begin polling in the background.
    ///
    /// A competing session detected during bootstrap surfaces as
    /// [`PollError::Conflict`].
    async fn start(&self, options: PollOptions) -> Result<(), PollError>;

    /// Stop polling and wait for the background task to end.
    async fn stop(&self);

    /// Resolve once polling has ended for any reason.
    async fn idle(&self);

    fn is_running(&self) -> bool;
}

/// The subset of the bot API the instance subsystem needs.
#[async_trait]
pub trait WebhookApi: Send + Sync {
    async fn get_webhook_info(&self) -> Result<WebhookInfo, PollError>;

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), PollError>;
}

/// What the error handler did with a [`PollError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Duplicate conflict while a shutdown was already running.
    Ignored,
    /// This process is yielding; the driver must stop polling.
    Terminated,
    /// Backed off for the given delay; the driver should retry.
    Retried(Duration),
    /// Logged only.
    Logged,
}

/// Receives errors from the long-poll driver.
#[async_trait]
pub trait PollErrorHandler: Send + Sync {
    async fn on_error(&self, error: PollError) -> ErrorDisposition;
}
