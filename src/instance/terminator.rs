//! Process-table access and forceful termination.
//!
//! Everything the instance subsystem does to *other* processes (probing
//! liveness, listing command lines, killing) and to *this* process
//! (non-graceful exit) goes through [`ProcessTerminator`], so tests can
//! substitute [`RecordingTerminator`] and never touch real processes.

use std::collections::HashSet;
use std::io;
use std::sync::Mutex;

use sysinfo::{ProcessesToUpdate, System};

/// A process visible in the local process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// File name of the running executable image, when the OS reports it.
    pub exe_name: Option<String>,
    /// Arguments including `argv[0]`.
    pub args: Vec<String>,
}

impl ProcessEntry {
    /// Entry for a whitespace-separated command line, with the executable
    /// taken from its first word.
    pub fn from_command_line(pid: u32, command_line: &str) -> Self {
        let args: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
        let exe_name = args.first().and_then(|a| file_name(a)).map(str::to_string);
        Self {
            pid,
            exe_name,
            args,
        }
    }

    /// Arguments joined by single spaces.
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// File name of `argv[0]`.
    pub fn program_name(&self) -> Option<&str> {
        self.args.first().and_then(|a| file_name(a))
    }
}

fn file_name(path: &str) -> Option<&str> {
    std::path::Path::new(path).file_name()?.to_str()
}

/// Capability to inspect and terminate local processes.
pub trait ProcessTerminator: Send + Sync {
    /// Zero-effect liveness probe.
    fn is_alive(&self, pid: u32) -> bool;

    /// Forcefully terminate `pid`. A process that vanished before the
    /// signal arrived counts as success.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Snapshot of the local process table.
    fn processes(&self) -> Vec<ProcessEntry>;

    /// Terminate the current process without running destructors.
    ///
    /// Real implementations never return.
    fn exit(&self, code: i32);
}

/// [`ProcessTerminator`] backed by the operating system.
#[derive(Debug, Default)]
pub struct OsProcesses;

impl ProcessTerminator for OsProcesses {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) => true,
            // Exists, but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system.process(target).is_some()
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut system = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match system.process(target) {
            Some(process) if !process.kill() => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("failed to kill {pid}"),
            )),
            _ => Ok(()),
        }
    }

    fn processes(&self) -> Vec<ProcessEntry> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                exe_name: process
                    .exe()
                    .and_then(|exe| exe.file_name())
                    .map(|name| {
                        // Linux marks a replaced binary as "name (deleted)".
                        let name = name.to_string_lossy();
                        name.trim_end_matches(" (deleted)").to_string()
                    }),
                args: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect()
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// In-memory [`ProcessTerminator`] that records requests instead of
/// issuing signals.
///
/// Liveness is answered from a configured set; a terminated pid is removed
/// from it, the way a real kill would make it disappear.
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    alive: Mutex<HashSet<u32>>,
    table: Mutex<Vec<ProcessEntry>>,
    killed: Mutex<Vec<u32>>,
    exits: Mutex<Vec<i32>>,
    refuse: Mutex<HashSet<u32>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `pid` as a live process.
    pub fn with_alive(self, pid: u32) -> Self {
        lock(&self.alive).insert(pid);
        self
    }

    /// Add a live process with the given command line to the table.
    pub fn with_process(self, pid: u32, command_line: &str) -> Self {
        lock(&self.alive).insert(pid);
        lock(&self.table).push(ProcessEntry::from_command_line(pid, command_line));
        self
    }

    /// Make kill requests for `pid` fail with permission denied.
    pub fn refusing(self, pid: u32) -> Self {
        lock(&self.refuse).insert(pid);
        self
    }

    /// Pids that received a kill request, in order.
    pub fn killed(&self) -> Vec<u32> {
        lock(&self.killed).clone()
    }

    /// Exit codes requested, in order.
    pub fn exits(&self) -> Vec<i32> {
        lock(&self.exits).clone()
    }
}

impl ProcessTerminator for RecordingTerminator {
    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.alive).contains(&pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        lock(&self.killed).push(pid);
        if lock(&self.refuse).contains(&pid) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        lock(&self.alive).remove(&pid);
        lock(&self.table).retain(|p| p.pid != pid);
        Ok(())
    }

    fn processes(&self) -> Vec<ProcessEntry> {
        lock(&self.table).clone()
    }

    fn exit(&self, code: i32) {
        lock(&self.exits).push(code);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
