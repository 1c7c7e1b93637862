//! `chroma daemon`: event daemon lifecycle and introspection.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use chroma_daemon::paths::query_address;
use chroma_daemon::{request_status, request_stop, start_blocking, DaemonError, DaemonStatus};

use super::{block_on, load_config};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until Ctrl-C or `chroma daemon stop`.
    Start,
    /// Request graceful daemon shutdown over the query socket.
    Stop,
    /// Show active event types and subscriber counts.
    Status(DaemonStatusArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let config = load_config()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match block_on(request_stop(&config))? {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status(args) => match block_on(request_status(&config))? {
            Ok(status) if args.json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Ok(status) => print_table(&status),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let socket = query_address(&config).to_string();
                if args.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": socket,
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                } else {
                    println!("{} ({socket})", "daemon is not running".red().bold());
                }
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}

#[derive(Tabled)]
struct EventTypeRow {
    #[tabled(rename = "event type")]
    event_type: String,
    #[tabled(rename = "subscribers")]
    subscribers: usize,
    #[tabled(rename = "delivered")]
    delivered: u64,
    #[tabled(rename = "dropped")]
    dropped: u64,
    #[tabled(rename = "socket")]
    address: String,
}

fn print_table(status: &DaemonStatus) {
    println!(
        "{} pid {} · since {} (up {}s) · command {} · query {}",
        "running".green().bold(),
        status.pid,
        status
            .started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S"),
        status.uptime_secs,
        status.command,
        status.query,
    );

    if status.event_types.is_empty() {
        println!("{}", "no event types yet".bright_black());
        return;
    }

    let rows: Vec<EventTypeRow> = status
        .event_types
        .iter()
        .map(|t| EventTypeRow {
            event_type: t.event_type.clone(),
            subscribers: t.subscribers,
            delivered: t.delivered,
            dropped: t.dropped,
            address: t.address.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
