//! `apsbss clear`: blank every published field, status included.

use anyhow::{anyhow, Context, Result};
use clap::Args;

use bss_core::config;

/// Arguments for `apsbss clear`.
#[derive(Args, Debug)]
pub struct ClearArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ClearArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let settings = config::load_at(&home)
            .context("failed to load configuration")?
            .validate()
            .context("invalid configuration")?;

        let mut driver =
            bss_sync::driver_at(&home, &settings).context("failed to set up sync driver")?;
        let report = driver.clear();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize clear report")?
            );
        } else {
            println!(
                "✓ cleared {} field(s) under '{}' ({} already empty)",
                report.written, settings.prefix, report.unchanged
            );
        }
        if !report.failed.is_empty() {
            return Err(anyhow!(
                "{} field(s) could not be cleared: {}",
                report.failed.len(),
                report.failed.join(", ")
            ));
        }
        Ok(())
    }
}
