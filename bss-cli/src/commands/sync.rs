//! `apsbss sync`: one cycle against the snapshot file.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use bss_core::{config, text::trim, Timestamp};
use bss_sync::{CancelToken, CycleReport, Preview, Status};

/// Widest value shown in a table cell.
const VALUE_WIDTH: usize = 60;

/// Arguments for `apsbss sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Print the projected table without publishing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Evaluate the schedule at this instant instead of now.
    #[arg(long, value_name = "TIMESTAMP")]
    pub at: Option<String>,

    /// Include empty fields in the dry-run table.
    #[arg(long, requires = "dry_run")]
    pub all_fields: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "pv")]
    handle: String,
    #[tabled(rename = "value")]
    value: String,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let settings = config::load_at(&home)
            .context("failed to load configuration")?
            .validate()
            .context("invalid configuration")?;
        let as_of = match self.at.as_deref() {
            Some(text) => Timestamp::parse(text).with_context(|| format!("bad --at '{text}'"))?,
            None => Timestamp::now(),
        };

        let mut driver =
            bss_sync::driver_at(&home, &settings).context("failed to set up sync driver")?;

        if self.dry_run {
            let preview = driver
                .preview(as_of)
                .context("could not fetch from the scheduling services")?;
            if self.json {
                print_preview_json(&preview)?;
            } else {
                print_preview(&preview, as_of, self.all_fields);
            }
            return Ok(());
        }

        let report = driver.run_cycle(as_of, &CancelToken::new());
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize cycle report")?
            );
        } else {
            print_report(&report);
        }
        Ok(())
    }
}

fn status_label(status: Status) -> String {
    match status {
        Status::Ok => "ok".green().bold().to_string(),
        Status::Partial => "partial".yellow().bold().to_string(),
        Status::Stale => "stale".yellow().bold().to_string(),
        Status::Error => "error".red().bold().to_string(),
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "✓ cycle at {} finished {} ({} written, {} unchanged)",
        report.as_of,
        status_label(report.status),
        report.written,
        report.unchanged,
    );
    match (report.proposal_id, report.esaf_id) {
        (None, None) => println!("  no active proposal or ESAF"),
        (proposal, esaf) => {
            if let Some(id) = proposal {
                println!("  proposal {id}");
            }
            if let Some(id) = esaf {
                println!("  esaf     {id}");
            }
        }
    }
    if let Some(err) = &report.fetch_error {
        println!("  {} {err}", "fetch failed:".red());
    }
    if !report.failed.is_empty() {
        println!("  {} {}", "rejected:".yellow(), report.failed.join(", "));
    }
    if report.dropped_records > 0 {
        println!("  {} malformed upstream record(s) skipped", report.dropped_records);
    }
    if let Some(ms) = report.retry_in_ms {
        println!("  next attempt backs off {}s", ms / 1000);
    }
}

fn print_preview(preview: &Preview, as_of: Timestamp, all_fields: bool) {
    println!("[dry-run] schedule at {as_of}");
    match &preview.proposal {
        Some(p) => {
            println!("  proposal {}: {}", p.id.0, trim(&p.title, VALUE_WIDTH));
            if let Some(pi) = p.pi() {
                println!("  PI       {pi}");
            }
        }
        None => println!("  no active proposal"),
    }
    match &preview.esaf {
        Some(e) => println!("  esaf     {}: {}", e.id.0, trim(&e.title, VALUE_WIDTH)),
        None => println!("  no active ESAF"),
    }
    if preview.dropped_records > 0 {
        println!("  {} malformed upstream record(s) skipped", preview.dropped_records);
    }

    let rows: Vec<FieldRow> = preview
        .snapshot
        .iter()
        .filter(|(_, value)| all_fields || !value.is_empty())
        .filter_map(|(key, value)| {
            preview.table.handle(key).map(|handle| FieldRow {
                handle: handle.to_owned(),
                value: trim(&value.replace('\n', " "), VALUE_WIDTH),
            })
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn print_preview_json(preview: &Preview) -> Result<()> {
    let fields: serde_json::Map<String, serde_json::Value> = preview
        .snapshot
        .iter()
        .filter_map(|(key, value)| {
            preview
                .table
                .handle(key)
                .map(|handle| (handle.to_owned(), serde_json::Value::from(value)))
        })
        .collect();
    let payload = serde_json::json!({
        "proposal_id": preview.proposal.as_ref().map(|p| p.id.0),
        "pi": preview.proposal.as_ref().and_then(|p| p.pi()).map(|u| u.to_string()),
        "esaf_id": preview.esaf.as_ref().map(|e| e.id.0),
        "dropped_records": preview.dropped_records,
        "fields": fields,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize preview")?
    );
    Ok(())
}
