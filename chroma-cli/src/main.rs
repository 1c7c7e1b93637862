//! Chroma: event routing between theme managers and monitors.
//!
//! # Usage
//!
//! ```text
//! chroma daemon start|stop|status [--json]
//! chroma publish <event_type> <kind> [--operation-id <id>] [--payload <json>]
//! chroma subscribe <event_type> [--count <n>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, publish::PublishArgs, subscribe::SubscribeArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "chroma",
    version,
    about = "Route operation-lifecycle events from managers to monitors",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop, or inspect the event daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Publish one envelope. Succeeds silently when the daemon is not running.
    Publish(PublishArgs),

    /// Stream envelopes for one event type as JSON lines.
    Subscribe(SubscribeArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Publish(args) => args.run(),
        Commands::Subscribe(args) => args.run(),
    }
}
