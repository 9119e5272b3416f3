//! Single-instance coordination.
//!
//! Guarantees that exactly one live process owns the bot API long-poll
//! connection. Exclusion is layered:
//!
//! ```text
//!   sweep ─▶ reclaim ─▶ InstanceMutex ─▶ FileLock ─▶ PortLock ─▶ driver.start()
//!   (kill    (stale      (in-process)    (flock +    (bound UDP
//!    priors)  files)                      PID file)   port + heartbeat)
//! ```
//!
//! Layers are acquired strictly in that order and unwound in reverse if
//! any step fails, so the set {mutex, file lock, port lock} is either
//! empty or fully held by this process. All teardown paths (signals,
//! fatal errors, upstream conflicts) go through
//! [`InstanceGuard::shutdown`].

pub mod backoff;
pub mod conflict;
pub mod driver;
pub mod file_lock;
pub mod mutex;
pub mod port_lock;
mod reclaim;
mod shutdown;
pub mod sweeper;
pub mod terminator;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use backoff::Backoff;
pub use conflict::{
    CONFLICT_EXIT_CODE, ConflictController, Startup, start_until, start_with_retry,
};
pub use driver::{
    ErrorDisposition, PollDriver, PollError, PollErrorHandler, PollOptions, WebhookApi,
    WebhookInfo,
};
pub use file_lock::{FileLock, FileLockError};
pub use mutex::InstanceMutex;
pub use port_lock::{PortLockConfig, PortLockError, PortLockHandle};
pub use shutdown::{ShutdownOutcome, WATCHDOG_EXIT_CODE};
pub use sweeper::{ProcessMatch, ProcessSweeper, SweepReport};
pub use terminator::{OsProcesses, ProcessEntry, ProcessTerminator, RecordingTerminator};

use crate::error::InstanceError;

/// Paths, ports and timing for the instance lock stack.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub lock_path: PathBuf,
    pub pid_marker_path: PathBuf,
    pub port: u16,
    /// How prior instances are recognized in the process table; `None`
    /// disables the scan.
    pub process_pattern: Option<ProcessMatch>,
    pub mutex_timeout: Duration,
    pub port_attempts: u32,
    pub port_settle: Duration,
    pub bind_timeout: Duration,
    pub port_backoff: Backoff,
    pub receive_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub driver_start_timeout: Duration,
    pub driver_stop_timeout: Duration,
    pub webhook_timeout: Duration,
    pub webhook_settle: Duration,
    pub shutdown_deadline: Duration,
    pub startup_attempts: u32,
    pub startup_backoff: Backoff,
    pub network_backoff: Backoff,
}

impl InstanceConfig {
    pub const DEFAULT_PORT: u16 = 47813;

    /// Defaults with the lock file and PID marker placed in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            lock_path: dir.join("decistrip.lock"),
            pid_marker_path: dir.join("decistrip.pid"),
            port: Self::DEFAULT_PORT,
            process_pattern: None,
            mutex_timeout: Duration::from_secs(5),
            port_attempts: 5,
            port_settle: Duration::from_secs(1),
            bind_timeout: Duration::from_secs(5),
            port_backoff: Backoff::PORT_BIND,
            receive_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(3),
            driver_start_timeout: Duration::from_secs(10),
            driver_stop_timeout: Duration::from_secs(10),
            webhook_timeout: Duration::from_secs(10),
            webhook_settle: Duration::from_secs(1),
            shutdown_deadline: Duration::from_secs(30),
            startup_attempts: 10,
            startup_backoff: Backoff::STARTUP,
            network_backoff: Backoff::NETWORK,
        }
    }

    pub fn port_lock(&self) -> PortLockConfig {
        PortLockConfig {
            port: self.port,
            attempts: self.port_attempts,
            settle: self.port_settle,
            bind_timeout: self.bind_timeout,
            backoff: self.port_backoff,
            receive_timeout: self.receive_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Shared mutable state of the guard.
#[derive(Debug, Default)]
struct GuardState {
    file_lock: Option<FileLock>,
    port_lock: Option<PortLockHandle>,
    shutting_down: bool,
}

/// Owner of every lock layer held by this process.
///
/// Created once by the entry point and shared by reference (`Arc`) with
/// the signal handler, the conflict controller and the startup loop.
pub struct InstanceGuard {
    config: InstanceConfig,
    processes: Arc<dyn ProcessTerminator>,
    mutex: InstanceMutex,
    state: Mutex<GuardState>,
}

impl InstanceGuard {
    pub fn new(config: InstanceConfig, processes: Arc<dyn ProcessTerminator>) -> Self {
        Self {
            config,
            processes,
            mutex: InstanceMutex::new(),
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn processes(&self) -> &Arc<dyn ProcessTerminator> {
        &self.processes
    }

    pub fn mutex(&self) -> &InstanceMutex {
        &self.mutex
    }

    pub fn sweeper(&self) -> ProcessSweeper<'_> {
        ProcessSweeper::new(
            self.processes.as_ref(),
            &self.config.pid_marker_path,
            self.config.process_pattern.clone(),
        )
    }

    /// Kill prior instances. Never fails.
    pub fn sweep(&self) -> SweepReport {
        self.sweeper().sweep()
    }

    /// Run the full acquisition sequence.
    ///
    /// On failure every layer acquired so far is released before
    /// returning. If this process already holds the full stack the call
    /// succeeds without touching it.
    pub async fn acquire(&self) -> Result<(), InstanceError> {
        if self.is_active() {
            // Nothing confirms who else might be listening on the port; we
            // only know our own handle is still bound.
            tracing::info!(port = self.config.port, "Instance stack already held; reusing it");
            return Ok(());
        }
        self.state().shutting_down = false;

        self.sweep();
        self.reclaim();

        if !self.mutex.acquire(self.config.mutex_timeout).await {
            return Err(InstanceError::MutexBusy {
                waited: self.config.mutex_timeout,
            });
        }

        let file_lock = match FileLock::acquire(&self.config.lock_path, self.processes.as_ref()) {
            Ok(lock) => lock,
            Err(e) => {
                self.mutex.release();
                return Err(e.into());
            }
        };

        let marker = self.config.pid_marker_path.clone();
        let port_result = port_lock::acquire_with_retry(
            &self.config.port_lock(),
            |_| {
                self.sweep();
            },
            |_| write_marker(&marker),
        )
        .await;

        let port_lock = match port_result {
            Ok(handle) => handle,
            Err(e) => {
                let mut file_lock = file_lock;
                file_lock.release();
                self.remove_lock_file(None);
                self.mutex.release();
                tracing::warn!(error = %e, "Port lock unavailable; startup attempt abandoned");
                return Err(e);
            }
        };

        let mut state = self.state();
        state.file_lock = Some(file_lock);
        state.port_lock = Some(port_lock);
        tracing::info!(
            pid = std::process::id(),
            port = self.config.port,
            lock = %self.config.lock_path.display(),
            "Instance lock stack acquired"
        );
        Ok(())
    }

    /// Whether mutex, file lock and a valid port lock are all held.
    pub fn is_active(&self) -> bool {
        let state = self.state();
        self.mutex.is_held()
            && state.file_lock.as_ref().is_some_and(FileLock::is_held)
            && state.port_lock.as_ref().is_some_and(PortLockHandle::is_valid)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn port_lock(&self) -> Option<PortLockHandle> {
        self.state().port_lock.clone()
    }

    /// Snapshot of on-disk and socket state.
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::probe(&self.config, self.processes.as_ref())
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether `path` records a PID of some other process that is alive.
    fn names_live_foreigner(&self, path: &Path) -> bool {
        match file_lock::read_pid(path) {
            Some(owner) if owner != std::process::id() && self.processes.is_alive(owner) => {
                tracing::debug!(path = %path.display(), owner, "Leaving file owned by live process");
                true
            }
            _ => false,
        }
    }

    /// Remove the PID marker unless it names another live process.
    fn remove_owned(&self, path: &Path) {
        if self.names_live_foreigner(path) {
            return;
        }
        log_removal(path, file_lock::remove_if_exists(path));
    }

    /// Remove the lock file unless another process owns it, by recorded PID
    /// or by advisory lock. `held` is this process's own lock, if it still
    /// has one.
    fn remove_lock_file(&self, held: Option<&FileLock>) {
        let path = &self.config.lock_path;
        if self.names_live_foreigner(path) {
            return;
        }
        let result = match held {
            Some(lock) => lock.remove_file(),
            None => file_lock::remove_unlocked(path),
        };
        log_removal(path, result);
    }
}

fn log_removal(path: &Path, result: std::io::Result<bool>) {
    match result {
        Ok(true) => tracing::debug!(path = %path.display(), "Removed"),
        Ok(false) => {}
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Remove failed"),
    }
}

fn write_marker(path: &Path) -> Result<(), InstanceError> {
    let fail = |e: std::io::Error| InstanceError::MarkerWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(fail)?;
    }
    fs::write(path, std::process::id().to_string()).map_err(fail)
}

/// Observed state of the lock stack, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InstanceStatus {
    pub lock_path: PathBuf,
    pub lock_owner: Option<u32>,
    pub lock_owner_alive: bool,
    pub marker_path: PathBuf,
    pub marker_pid: Option<u32>,
    pub port: u16,
    pub port_bound: bool,
}

impl InstanceStatus {
    /// Inspect the lock file, PID marker and port without acquiring
    /// anything.
    pub fn probe(config: &InstanceConfig, processes: &dyn ProcessTerminator) -> Self {
        let lock_owner = file_lock::read_pid(&config.lock_path);
        Self {
            lock_path: config.lock_path.clone(),
            lock_owner,
            lock_owner_alive: lock_owner.is_some_and(|pid| processes.is_alive(pid)),
            marker_path: config.pid_marker_path.clone(),
            marker_pid: file_lock::read_pid(&config.pid_marker_path),
            port: config.port,
            port_bound: port_lock::is_port_bound(config.port),
        }
    }

    /// Whether the observations point to a running instance.
    pub fn looks_active(&self) -> bool {
        self.lock_owner_alive && self.port_bound
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::UdpSocket;

    use super::*;

    pub fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Config with every wait shrunk to keep tests fast.
    pub fn fast_config(dir: &Path) -> InstanceConfig {
        InstanceConfig {
            port: free_port(),
            mutex_timeout: Duration::from_millis(100),
            port_attempts: 2,
            port_settle: Duration::ZERO,
            bind_timeout: Duration::from_secs(2),
            port_backoff: Backoff::NONE,
            receive_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
            driver_start_timeout: Duration::from_secs(2),
            driver_stop_timeout: Duration::from_millis(200),
            webhook_timeout: Duration::from_millis(200),
            webhook_settle: Duration::ZERO,
            shutdown_deadline: Duration::from_secs(5),
            startup_attempts: 3,
            startup_backoff: Backoff::NONE,
            network_backoff: Backoff::NONE,
            ..InstanceConfig::in_dir(dir)
        }
    }
}
