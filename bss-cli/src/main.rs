//! apsbss: publish the active APS proposal and ESAF for a beamline.
//!
//! # Usage
//!
//! ```text
//! apsbss init --beamline <name> [--sector <s>] [--prefix <p>] [--interval <secs>]
//! apsbss sync [--dry-run] [--at <timestamp>] [--json]
//! apsbss report [--json]
//! apsbss clear [--json]
//! apsbss daemon start|stop|status
//! apsbss esaf <id>
//! apsbss proposal <id> <run> <beamline>
//! apsbss runs [--full] [--ascending]
//! apsbss beamlines
//! apsbss list [--run <name>] [<beamline>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    clear::ClearArgs,
    daemon::DaemonCommand,
    init::InitArgs,
    lookup::{EsafArgs, ListArgs, ProposalArgs, RunsArgs},
    report::ReportArgs,
    sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "apsbss",
    version,
    about = "Read-only bridge from the APS scheduling system to beamline process variables",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.apsbss/config.yaml for this station.
    Init(InitArgs),

    /// Run one fetch/project/publish cycle against the snapshot file.
    Sync(SyncArgs),

    /// Print the published field table.
    Report(ReportArgs),

    /// Blank every published field, status included.
    Clear(ClearArgs),

    /// Run or control the periodic sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Print one ESAF.
    Esaf(EsafArgs),

    /// Print one proposal from a run on a beamline.
    Proposal(ProposalArgs),

    /// List the scheduling runs.
    Runs(RunsArgs),

    /// List the active beamlines.
    Beamlines,

    /// List the proposals and ESAFs of a run on a beamline.
    List(ListArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Report(args) => args.run(),
        Commands::Clear(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Esaf(args) => args.run(),
        Commands::Proposal(args) => args.run(),
        Commands::Runs(args) => args.run(),
        Commands::Beamlines => commands::lookup::beamlines(),
        Commands::List(args) => args.run(),
    }
}
