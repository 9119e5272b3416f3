//! Resource reclaimer.

use super::InstanceGuard;

impl InstanceGuard {
    /// Release everything this process may still hold. Never fails and is
    /// safe to call at any point, any number of times.
    ///
    /// Closes the cached port lock and file lock handles, deletes the lock
    /// file and PID marker unless another live process owns them, and
    /// releases the instance mutex if the calling thread holds it. A lock
    /// file whose advisory lock is held elsewhere is kept even when it does
    /// not name a PID.
    pub fn reclaim(&self) {
        let (file_lock, port_lock) = {
            let mut state = self.state();
            (state.file_lock.take(), state.port_lock.take())
        };

        if let Some(port) = port_lock {
            if port.release() {
                tracing::debug!(addr = %port.addr(), "Reclaimed port lock");
            }
        }

        if let Some(mut lock) = file_lock {
            lock.release();
            tracing::debug!(path = %lock.path().display(), "Reclaimed file lock");
        }

        self.remove_lock_file(None);
        self.remove_owned(&self.config.pid_marker_path);

        if self.mutex.release_if_current_thread() {
            tracing::debug!("Reclaimed instance mutex");
        }
    }
}
