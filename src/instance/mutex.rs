//! In-process instance mutex.
//!
//! Guards the startup critical section so that two initialization paths in
//! the same process (for example a signal handler firing mid-startup)
//! cannot interleave. Unlike [`std::sync::Mutex`] it is not tied to a guard
//! lifetime: acquisition and release happen at different points of the
//! instance lifecycle, and teardown paths may release it from a different
//! task than the one that acquired it.

use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Who holds the mutex and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub thread: ThreadId,
    pub since: Instant,
}

#[derive(Debug, Default)]
pub struct InstanceMutex {
    holder: Mutex<Option<Holder>>,
}

impl InstanceMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the mutex if it is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut holder = self.lock();
        if holder.is_some() {
            return false;
        }
        *holder = Some(Holder {
            thread: std::thread::current().id(),
            since: Instant::now(),
        });
        true
    }

    /// Poll for the mutex until `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Release regardless of the holder. Returns whether it was held.
    pub fn release(&self) -> bool {
        self.lock().take().is_some()
    }

    /// Release only if the calling thread is the recorded holder.
    pub fn release_if_current_thread(&self) -> bool {
        let mut holder = self.lock();
        match *holder {
            Some(h) if h.thread == std::thread::current().id() => {
                *holder = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.lock().is_some()
    }

    pub fn holder(&self) -> Option<Holder> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn second_try_acquire_fails() {
        let m = InstanceMutex::new();
        assert!(m.try_acquire());
        assert!(!m.try_acquire());
        assert!(m.release());
        assert!(m.try_acquire());
    }

    #[test]
    fn release_is_idempotent() {
        let m = InstanceMutex::new();
        assert!(!m.release());
        m.try_acquire();
        assert!(m.release());
        assert!(!m.release());
    }

    #[test]
    fn only_holder_thread_releases_conditionally() {
        let m = Arc::new(InstanceMutex::new());
        assert!(m.try_acquire());

        let other = Arc::clone(&m);
        let released = std::thread::spawn(move || other.release_if_current_thread())
            .join()
            .unwrap();
        assert!(!released);
        assert!(m.is_held());

        assert!(m.release_if_current_thread());
        assert!(!m.is_held());
    }

    #[test]
    fn concurrent_acquisitions_admit_one() {
        let m = Arc::new(InstanceMutex::new());
        let winners: usize = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || m.try_acquire())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let m = InstanceMutex::new();
        m.try_acquire();
        let start = Instant::now();
        assert!(!m.acquire(Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn acquire_succeeds_once_released() {
        let m = Arc::new(InstanceMutex::new());
        m.try_acquire();
        let releaser = Arc::clone(&m);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release();
        });
        assert!(m.acquire(Duration::from_secs(2)).await);
    }
}
