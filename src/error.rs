//! Error types for decistrip.

use std::path::PathBuf;
use std::time::Duration;

pub use crate::instance::file_lock::FileLockError;
pub use crate::instance::port_lock::PortLockError;

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("Telegram error: {0}")]
    Telegram(#[from] TelegramError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Keep-alive server error: {0}")]
    KeepAlive(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Could not determine a home directory; set DECISTRIP_HOME")]
    NoHomeDirectory,
}

/// Errors raised while acquiring or holding the single-instance lock stack.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("In-process instance mutex still held after {waited:?}")]
    MutexBusy { waited: Duration },

    #[error("File lock error: {0}")]
    FileLock(#[from] FileLockError),

    #[error("Port lock error: {0}")]
    PortLock(#[from] PortLockError),

    #[error("Failed to write PID marker {path}: {reason}")]
    MarkerWrite { path: PathBuf, reason: String },

    #[error("Another session is polling the bot API: {0}")]
    Conflict(String),

    #[error("Long-poll driver failed to start: {0}")]
    DriverStart(String),

    #[error("Startup gave up after {attempts} attempts: {last_error}")]
    StartupExhausted { attempts: u32, last_error: String },

    #[error("Shutdown already in progress")]
    ShuttingDown,
}

impl InstanceError {
    /// Whether a later startup attempt may succeed where this one failed.
    ///
    /// A live holder of the file lock is final: the new process aborts
    /// without ever attempting the port bind.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FileLock(_) | Self::MarkerWrite { .. } | Self::ShuttingDown => false,
            Self::StartupExhausted { .. } => false,
            Self::MutexBusy { .. }
            | Self::PortLock(_)
            | Self::Conflict(_)
            | Self::DriverStart(_) => true,
        }
    }
}

/// Bot API errors.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Bot API returned {code}: {description}")]
    Api { code: u16, description: String },

    #[error("Failed to decode bot API response: {0}")]
    Decode(String),

    #[error("Long-poll driver is already running")]
    AlreadyRunning,
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TelegramError::Decode(e.to_string())
        } else if e.status().is_some_and(|s| s.as_u16() == 409) {
            TelegramError::Conflict(e.to_string())
        } else {
            // Connection, timeout, request and body failures are all
            // transport-level; the next poll may succeed.
            TelegramError::Network(e.to_string())
        }
    }
}

/// Export file generation errors.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Nothing to export: no numbers found in the collected messages")]
    Empty,

    #[error("Failed to serialize export: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lock_contention_is_final() {
        let err = InstanceError::FileLock(FileLockError::Contended {
            path: PathBuf::from("/tmp/x.lock"),
            pid: Some(4821),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn port_and_conflict_failures_are_retryable() {
        let port = InstanceError::PortLock(PortLockError::Exhausted {
            port: 47813,
            attempts: 5,
        });
        assert!(port.is_retryable());
        assert!(InstanceError::Conflict("terminated by other getUpdates".into()).is_retryable());
    }

    #[test]
    fn error_messages_name_the_failing_layer() {
        let err: Error = InstanceError::MutexBusy {
            waited: Duration::from_secs(5),
        }
        .into();
        assert!(err.to_string().contains("mutex"));
    }
}
