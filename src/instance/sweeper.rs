//! Process sweeper: terminates prior instances of this program.
//!
//! Best effort only. A failed kill never aborts startup; the lock layers
//! are the authoritative exclusion mechanism.

use std::path::PathBuf;

use crate::instance::file_lock::{read_pid, remove_if_exists};
use crate::instance::terminator::{ProcessEntry, ProcessTerminator};

/// Subcommand that runs the bot; an invocation without one runs it too.
const RUN_SUBCOMMAND: &str = "run";

/// Global flags that consume the following argument.
const FLAGS_WITH_VALUE: &[&str] = &["--home"];

/// How the sweeper recognizes a prior instance in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessMatch {
    /// Processes whose executable (or `argv[0]`) has this file name and
    /// that are running the bot. One-shot invocations such as `status`
    /// or `cleanup` are left alone.
    Executable(String),
    /// Any process whose command line contains this text.
    CommandLine(String),
}

impl ProcessMatch {
    pub fn matches(&self, entry: &ProcessEntry) -> bool {
        match self {
            Self::Executable(name) => {
                let same_binary = entry.exe_name.as_deref() == Some(name.as_str())
                    || entry.program_name() == Some(name.as_str());
                same_binary && runs_bot(&entry.args)
            }
            Self::CommandLine(text) => entry.command_line().contains(text.as_str()),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Self::Executable(text) | Self::CommandLine(text) => text.trim().is_empty(),
        }
    }
}

/// Whether `args` (including `argv[0]`) start the bot rather than a
/// one-shot subcommand.
fn runs_bot(args: &[String]) -> bool {
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        if FLAGS_WITH_VALUE.contains(&arg.as_str()) {
            rest.next();
        } else if !arg.starts_with('-') {
            return arg == RUN_SUBCOMMAND;
        }
    }
    true
}

/// What a sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub killed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty() && self.failed.is_empty()
    }
}

pub struct ProcessSweeper<'a> {
    processes: &'a dyn ProcessTerminator,
    pid_marker: PathBuf,
    pattern: Option<ProcessMatch>,
    own_pid: u32,
}

impl<'a> ProcessSweeper<'a> {
    pub fn new(
        processes: &'a dyn ProcessTerminator,
        pid_marker: impl Into<PathBuf>,
        pattern: Option<ProcessMatch>,
    ) -> Self {
        Self {
            processes,
            pid_marker: pid_marker.into(),
            pattern: pattern.filter(|p| !p.is_blank()),
            own_pid: std::process::id(),
        }
    }

    /// Pretend to be another process. Lets tests exercise self-exclusion.
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Kill the process named by the PID marker, then every process the
    /// pattern matches. Never fails.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(pid) = read_pid(&self.pid_marker) {
            if pid != self.own_pid && self.processes.is_alive(pid) {
                tracing::warn!(pid, marker = %self.pid_marker.display(), "Killing process from PID marker");
                self.kill(pid, &mut report);
            }
            match remove_if_exists(&self.pid_marker) {
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Could not remove PID marker after sweep"),
            }
        }

        if let Some(pattern) = &self.pattern {
            for entry in self.processes.processes() {
                if entry.pid == self.own_pid || report.killed.contains(&entry.pid) {
                    continue;
                }
                if pattern.matches(&entry) {
                    tracing::warn!(pid = entry.pid, command = %entry.command_line(), "Killing prior instance");
                    self.kill(entry.pid, &mut report);
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                killed = report.killed.len(),
                failed = report.failed.len(),
                "Process sweep finished"
            );
        }
        report
    }

    fn kill(&self, pid: u32, report: &mut SweepReport) {
        match self.processes.terminate(pid) {
            Ok(()) => report.killed.push(pid),
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to kill prior instance");
                report.failed.push((pid, e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::instance::terminator::RecordingTerminator;

    fn exe(name: &str) -> ProcessMatch {
        ProcessMatch::Executable(name.to_string())
    }

    #[test]
    fn kills_marker_pid_and_removes_marker() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("bot.pid");
        fs::write(&marker, "4821").unwrap();
        let procs = RecordingTerminator::new().with_alive(4821);

        let report = ProcessSweeper::new(&procs, &marker, None).sweep();

        assert_eq!(report.killed, vec![4821]);
        assert!(!marker.exists());
    }

    #[test]
    fn dead_marker_pid_is_not_signalled() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("bot.pid");
        fs::write(&marker, "4821").unwrap();
        let procs = RecordingTerminator::new();

        let report = ProcessSweeper::new(&procs, &marker, None).sweep();
        assert!(report.is_empty());
        assert!(procs.killed().is_empty());
        assert!(!marker.exists());
    }

    #[test]
    fn never_kills_itself() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("bot.pid");
        fs::write(&marker, "100").unwrap();
        let procs = RecordingTerminator::new()
            .with_process(100, "/usr/bin/decistrip run")
            .with_process(200, "/usr/bin/decistrip run");

        let report = ProcessSweeper::new(&procs, &marker, Some(exe("decistrip")))
            .with_own_pid(100)
            .sweep();

        assert_eq!(report.killed, vec![200]);
        assert_eq!(procs.killed(), vec![200]);
    }

    #[test]
    fn matches_only_pattern() {
        let dir = TempDir::new().unwrap();
        let procs = RecordingTerminator::new()
            .with_process(10, "python3 main.py")
            .with_process(11, "/opt/decistrip run")
            .with_process(12, "vim notes.txt");

        let report =
            ProcessSweeper::new(&procs, dir.path().join("none.pid"), Some(exe("decistrip")))
                .with_own_pid(1)
                .sweep();
        assert_eq!(report.killed, vec![11]);
    }

    #[test]
    fn unrelated_processes_mentioning_the_name_survive() {
        let dir = TempDir::new().unwrap();
        let procs = RecordingTerminator::new()
            .with_process(20, "tail -f /var/log/decistrip.log")
            .with_process(21, "vim /home/bot/.decistrip/decistrip.pid")
            .with_process(22, "/usr/bin/decistrip status")
            .with_process(23, "/usr/bin/decistrip --home /srv/bot cleanup")
            .with_process(24, "/usr/bin/decistrip --home /srv/bot")
            .with_process(25, "/usr/bin/decistrip --log-json run");

        let report =
            ProcessSweeper::new(&procs, dir.path().join("none.pid"), Some(exe("decistrip")))
                .with_own_pid(1)
                .sweep();
        assert_eq!(report.killed, vec![24, 25]);
        assert!(procs.is_alive(20) && procs.is_alive(21) && procs.is_alive(22));
    }

    #[test]
    fn executable_image_matches_even_with_renamed_argv0() {
        let mut entry = ProcessEntry::from_command_line(30, "bot-worker run");
        entry.exe_name = Some("decistrip".into());
        assert!(exe("decistrip").matches(&entry));
        entry.args.push("status".into());
        assert!(exe("decistrip").matches(&entry), "first positional decides");
        entry.args = vec!["bot-worker".into(), "status".into()];
        assert!(!exe("decistrip").matches(&entry));
    }

    #[test]
    fn configured_text_matches_anywhere_in_the_command_line() {
        let dir = TempDir::new().unwrap();
        let procs = RecordingTerminator::new()
            .with_process(40, "python3 main.py --bot decimal")
            .with_process(41, "python3 other.py");

        let report = ProcessSweeper::new(
            &procs,
            dir.path().join("none.pid"),
            Some(ProcessMatch::CommandLine("main.py".into())),
        )
        .with_own_pid(1)
        .sweep();
        assert_eq!(report.killed, vec![40]);
    }

    #[test]
    fn marker_pid_killed_once_even_if_pattern_matches() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("bot.pid");
        fs::write(&marker, "11").unwrap();
        let procs = RecordingTerminator::new().with_process(11, "decistrip run");

        ProcessSweeper::new(&procs, &marker, Some(exe("decistrip")))
            .with_own_pid(1)
            .sweep();
        assert_eq!(procs.killed(), vec![11]);
    }

    #[test]
    fn kill_failures_are_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let procs = RecordingTerminator::new()
            .with_process(11, "decistrip run")
            .refusing(11);

        let report =
            ProcessSweeper::new(&procs, dir.path().join("none.pid"), Some(exe("decistrip")))
                .with_own_pid(1)
                .sweep();
        assert!(report.killed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 11);
    }

    #[test]
    fn blank_pattern_disables_table_scan() {
        let dir = TempDir::new().unwrap();
        let procs = RecordingTerminator::new().with_process(11, "anything");
        let report = ProcessSweeper::new(&procs, dir.path().join("none.pid"), Some(ProcessMatch::CommandLine("  ".into())))
            .with_own_pid(1)
            .sweep();
        assert!(report.is_empty());
    }
}
