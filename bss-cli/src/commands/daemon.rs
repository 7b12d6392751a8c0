//! `apsbss daemon`: periodic sync in the foreground, and its control socket.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;

use bss_daemon::paths::socket_path;
use bss_daemon::{request_status, request_stop, request_sync, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the sync loop in the foreground until ctrl-c or `daemon stop`.
    Start,
    /// Request graceful shutdown over the Unix socket.
    Stop,
    /// Query the running daemon over the Unix socket.
    Status,
    /// Ask the running daemon for an immediate cycle.
    Sync,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(_) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync => {
            let report = request_sync(&home).context("failed to request a sync cycle")?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
