//! `apsbss report`: what consumers currently see.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use bss_core::{config, text::trim};
use bss_sync::{snapshot_file, snapshot_name, FieldTable, STATUS_KEY};

const VALUE_WIDTH: usize = 60;

/// Arguments for `apsbss report`.
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Include empty fields.
    #[arg(long)]
    pub all_fields: bool,
}

#[derive(Serialize)]
struct ReportJson {
    sector: String,
    prefix: String,
    updated_at: Option<String>,
    status: Option<String>,
    fields: std::collections::BTreeMap<String, String>,
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "pv")]
    handle: String,
    #[tabled(rename = "value")]
    value: String,
}

impl ReportArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let settings = config::load_at(&home)
            .context("failed to load configuration")?
            .validate()
            .context("invalid configuration")?;
        let table = FieldTable::new(&settings.prefix);
        let status_handle = table.handle(STATUS_KEY).unwrap_or_default().to_owned();

        let published = snapshot_file::load_at(&home, &snapshot_name(&settings))
            .context("failed to read published snapshot")?;
        let never = published.fields.is_empty();
        let status = published.fields.get(&status_handle).cloned();

        if self.json {
            let payload = ReportJson {
                sector: settings.sector.to_string(),
                prefix: settings.prefix.clone(),
                updated_at: (!never).then(|| published.updated_at.to_rfc3339()),
                status,
                fields: published.fields,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize report")?
            );
            return Ok(());
        }

        if never {
            println!("Nothing published yet for sector {}. Run `apsbss sync` first.", settings.sector);
            return Ok(());
        }

        let status_text = match status.as_deref() {
            Some("ok") => "ok".green().bold().to_string(),
            Some("") | None => "unset".bright_black().to_string(),
            Some("error") => "error".red().bold().to_string(),
            Some(other) => other.yellow().bold().to_string(),
        };
        println!(
            "apsbss v{} | sector {} | status {} | updated {}",
            env!("CARGO_PKG_VERSION"),
            settings.sector,
            status_text,
            published
                .updated_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
        );

        let rows: Vec<FieldRow> = published
            .fields
            .iter()
            .filter(|(_, value)| self.all_fields || !value.is_empty())
            .map(|(handle, value)| FieldRow {
                handle: handle.clone(),
                value: trim(&value.replace('\n', " "), VALUE_WIDTH),
            })
            .collect();
        let mut out = Table::new(rows);
        out.with(Style::rounded());
        println!("{out}");
        Ok(())
    }
}
