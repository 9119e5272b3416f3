//! Exclusive file lock, the second layer of cross-process exclusion.
//!
//! The lock file holds the owning process ID as decimal text. Ownership is
//! established in two steps: the recorded PID must not belong to a live
//! process, and the OS-level advisory lock (`flock` on Unix) must be
//! obtainable without blocking. A file naming a dead process is stale and
//! is overwritten.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::instance::terminator::ProcessTerminator;

/// Errors that can occur during file lock operations.
#[derive(Debug, thiserror::Error)]
pub enum FileLockError {
    #[error("Lock {path} held by a running process (PID: {pid:?})")]
    Contended { path: PathBuf, pid: Option<u32> },

    #[error("Failed to create lock directory {path}: {reason}")]
    DirectoryCreationFailed { path: String, reason: String },

    #[error("Failed to open lock file {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Failed to write lock file {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}

/// A held exclusive lock on the instance lock file.
///
/// Dropping the handle releases the OS-level lock by closing the file; the
/// file itself is left in place; removing it is the reclaimer's job.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    pid: u32,
}

impl FileLock {
    /// Acquire the lock at `path` for the current process.
    ///
    /// Returns [`FileLockError::Contended`] when the recorded owner is alive
    /// or another process holds the advisory lock.
    pub fn acquire(
        path: impl Into<PathBuf>,
        processes: &dyn ProcessTerminator,
    ) -> Result<Self, FileLockError> {
        let path = path.into();
        let pid = std::process::id();

        let recorded = read_pid(&path);
        match recorded {
            Some(owner) if processes.is_alive(owner) => {
                tracing::warn!(path = %path.display(), owner, "Lock file names a live process");
                return Err(FileLockError::Contended {
                    path,
                    pid: Some(owner),
                });
            }
            Some(owner) => {
                tracing::info!(path = %path.display(), owner, "Reclaiming stale lock file");
            }
            None if path.exists() => {
                tracing::info!(path = %path.display(), "Lock file unreadable, treating as stale");
            }
            None => {}
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| FileLockError::DirectoryCreationFailed {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let mut file = open_locked(&path, recorded)?;

        write_pid(&mut file, pid).map_err(|e| {
            let _ = FileExt::unlock(&file);
            FileLockError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::debug!(path = %path.display(), pid, "File lock acquired");
        Ok(Self {
            path,
            file: Some(file),
            pid,
        })
    }

    /// Unlock and close the file. Idempotent.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::debug!(path = %self.path.display(), error = %e, "Unlock failed; closing anyway");
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Delete the lock file while still holding the lock.
    pub fn remove_file(&self) -> io::Result<bool> {
        if self.is_held() {
            remove_if_exists(&self.path)
        } else {
            remove_unlocked(&self.path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID that owns this lock (the current process).
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read and parse a PID from a lock or marker file.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// How often a lock taken on a file that was unlinked underneath us is
/// retried before giving up.
const RELINK_ATTEMPTS: u32 = 3;

/// Open `path` and take the advisory lock on it.
///
/// A reclaimer may unlink the file between our `open` and our `flock`; the
/// lock would then sit on an orphaned inode while the next process locks a
/// fresh file at the same path. The inode is compared after locking and the
/// open is retried if it no longer matches.
fn open_locked(path: &Path, recorded: Option<u32>) -> Result<File, FileLockError> {
    let open_failed = |e: io::Error| FileLockError::OpenFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    for _ in 0..RELINK_ATTEMPTS {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(open_failed)?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                // The PID check raced with a live holder.
                tracing::warn!(path = %path.display(), "Advisory lock already held");
                return Err(FileLockError::Contended {
                    path: path.to_path_buf(),
                    pid: recorded,
                });
            }
            return Err(open_failed(e));
        }

        if still_linked(&file, path) {
            return Ok(file);
        }
        tracing::debug!(path = %path.display(), "Lock file replaced while locking; retrying");
        let _ = FileExt::unlock(&file);
    }

    Err(FileLockError::Contended {
        path: path.to_path_buf(),
        pid: read_pid(path),
    })
}

/// Whether `file` is still the file found at `path`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Remove the lock file at `path` unless some process holds its advisory
/// lock. Returns whether the file was removed.
///
/// The file is unlinked while this function holds its lock, so no other
/// process can be halfway through taking it.
pub fn remove_unlocked(path: &Path) -> io::Result<bool> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = file.try_lock_exclusive() {
        if is_contended(&e) {
            tracing::debug!(path = %path.display(), "Lock file is held; leaving it");
            return Ok(false);
        }
        return Err(e);
    }
    let removed = remove_if_exists(path);
    let _ = FileExt::unlock(&file);
    removed
}

fn write_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{pid}")?;
    file.flush()?;
    file.sync_data()
}

fn is_contended(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    // Windows reports ERROR_LOCK_VIOLATION.
    cfg!(windows) && e.raw_os_error() == Some(33)
}
