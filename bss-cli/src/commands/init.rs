//! `apsbss init --beamline <name> [--sector <s>] [--prefix <p>] [--interval <secs>]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use bss_core::config::{self, Config};
use bss_core::ConfigError;

/// Configure the station this host publishes for.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Beamline name as the scheduling system spells it (e.g. "9-ID-B,C").
    #[arg(long, short = 'b')]
    pub beamline: String,

    /// Sector number. Derived from the beamline when omitted.
    #[arg(long, short = 's')]
    pub sector: Option<String>,

    /// Process variable prefix. Defaults to "<sector>:bss:".
    #[arg(long, short = 'p')]
    pub prefix: Option<String>,

    /// Seconds between cycle starts.
    #[arg(long)]
    pub interval: Option<u64>,

    /// File holding "username password" for the scheduling services.
    #[arg(long, value_name = "PATH")]
    pub credentials_file: Option<PathBuf>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        // Keep tuning from an earlier init; the station fields are replaced.
        let mut cfg = match config::load_at(&home) {
            Ok(existing) => existing,
            Err(ConfigError::NotFound { .. }) => Config::default(),
            Err(err) => return Err(err).context("failed to read existing configuration"),
        };
        cfg.beamline = Some(self.beamline);
        cfg.sector = self.sector;
        cfg.prefix = self.prefix;
        if let Some(interval) = self.interval {
            cfg.interval_secs = interval;
        }
        if let Some(path) = self.credentials_file {
            cfg.upstream.credentials_file = Some(path);
        }

        let settings = cfg.validate().context("invalid configuration")?;
        let path = config::save_at(&home, &cfg).context("failed to save configuration")?;

        println!(
            "✓ Configured sector {} (prefix '{}', every {}s)",
            settings.sector,
            settings.prefix,
            settings.interval.as_secs()
        );
        println!("  Saved to: {}", path.display());
        if cfg.upstream.credentials_file.is_none() {
            println!("  No credentials file set; upstream queries will be refused.");
        }
        Ok(())
    }
}
