//! `status` and `cleanup` subcommands.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::instance::{InstanceConfig, InstanceGuard, InstanceStatus, OsProcesses, SweepReport};

/// Print the observed lock stack without acquiring anything.
pub fn run_status_command(config: &InstanceConfig) -> anyhow::Result<()> {
    let status = InstanceStatus::probe(config, &OsProcesses);
    print!("{}", render_status(&status));
    Ok(())
}

/// Kill prior instances and remove stale lock files, then report what is
/// left.
pub fn run_cleanup_command(config: &InstanceConfig) -> anyhow::Result<()> {
    let guard = InstanceGuard::new(config.clone(), Arc::new(OsProcesses));
    let report = cleanup(&guard);
    print!("{}", render_cleanup(&report));
    print!("{}", render_status(&guard.status()));
    Ok(())
}

fn cleanup(guard: &InstanceGuard) -> SweepReport {
    let report = guard.sweep();
    guard.reclaim();
    report
}

fn render_status(status: &InstanceStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Instance Status");
    let _ = writeln!(out, "===============\n");

    let state = if status.looks_active() {
        "Running"
    } else if status.lock_owner.is_some() && !status.lock_owner_alive {
        "Not running (stale lock file)"
    } else {
        "Not running"
    };
    let _ = writeln!(out, "  Status: {state}");

    let owner = match status.lock_owner {
        Some(pid) if status.lock_owner_alive => format!("PID {pid} (alive)"),
        Some(pid) => format!("PID {pid} (dead)"),
        None => "none".to_string(),
    };
    let _ = writeln!(out, "  Lock file: {} [{owner}]", status.lock_path.display());

    let marker = status
        .marker_pid
        .map_or_else(|| "none".to_string(), |pid| format!("PID {pid}"));
    let _ = writeln!(out, "  PID marker: {} [{marker}]", status.marker_path.display());

    let port = if status.port_bound { "bound" } else { "free" };
    let _ = writeln!(out, "  Lock port: {} ({port})", status.port);
    out
}

fn render_cleanup(report: &SweepReport) -> String {
    let mut out = String::new();
    if report.is_empty() {
        let _ = writeln!(out, "No prior instances found.");
    }
    for pid in &report.killed {
        let _ = writeln!(out, "Killed prior instance (PID {pid})");
    }
    for (pid, reason) in &report.failed {
        let _ = writeln!(out, "Failed to kill PID {pid}: {reason}");
    }
    let _ = writeln!(out, "Stale lock files removed.\n");
    out
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::instance::RecordingTerminator;
    use crate::instance::test_support::{fast_config, free_port};

    #[test]
    fn status_of_empty_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path());
        config.port = free_port();
        let status = InstanceStatus::probe(&config, &RecordingTerminator::new());

        let text = render_status(&status);
        assert!(text.contains("  Status: Not running\n"));
        assert!(text.contains("[none]"));
        assert!(text.contains("(free)"));
    }

    #[test]
    fn status_flags_stale_lock() {
        let dir = TempDir::new().unwrap();
        let config = fast_config(dir.path());
        fs::write(&config.lock_path, "4821").unwrap();
        let status = InstanceStatus::probe(&config, &RecordingTerminator::new());

        let text = render_status(&status);
        assert!(text.contains("stale lock file"));
        assert!(text.contains("[PID 4821 (dead)]"));
    }

    #[test]
    fn cleanup_kills_marker_process_and_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let config = fast_config(dir.path());
        fs::write(&config.pid_marker_path, "4821").unwrap();
        fs::write(&config.lock_path, "4821").unwrap();
        let processes = Arc::new(RecordingTerminator::new().with_alive(4821));
        let guard = InstanceGuard::new(config.clone(), processes.clone());

        let report = cleanup(&guard);

        assert_eq!(report.killed, vec![4821]);
        assert!(!config.lock_path.exists());
        assert!(!config.pid_marker_path.exists());
        assert!(!guard.status().lock_owner_alive);
        assert!(render_cleanup(&report).contains("Killed prior instance (PID 4821)"));
    }

    #[test]
    fn cleanup_with_nothing_to_do() {
        assert!(render_cleanup(&SweepReport::default()).starts_with("No prior instances found."));
    }
}
