//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the bot (`run`, the default)
//! - Inspecting the instance lock stack (`status`)
//! - Killing prior instances and removing stale lock files (`cleanup`)

mod status;

pub use status::{run_cleanup_command, run_status_command};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "decistrip")]
#[command(about = "Chat bot that splits forwarded numbers into amounts and charges")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory holding the lock file and PID marker
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the bot (default if no subcommand given)
    Run,

    /// Show lock file, PID marker and port state without acquiring anything
    Status,

    /// Kill prior instances and remove stale lock files, then exit
    Cleanup,
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}
