//! Read-only lookups against the scheduling services: one ESAF, one
//! proposal, the run calendar, the beamline list, and a per-run listing.
//!
//! These need credentials but no station, so they run before `apsbss init`
//! with the default service URLs.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use bss_client::{HttpUpstream, Upstream};
use bss_core::config::{self, Config};
use bss_core::text::trim;
use bss_core::{
    BeamlineName, ConfigError, Esaf, EsafId, Proposal, ProposalId, Run, SectorId, Timestamp,
    UserList,
};
use bss_sync::pair_by_badges;

const TITLE_WIDTH: usize = 40;
const USERS_WIDTH: usize = 20;

/// Arguments for `apsbss esaf`.
#[derive(Args, Debug)]
pub struct EsafArgs {
    /// ESAF number.
    pub id: u64,
}

/// Arguments for `apsbss proposal`.
#[derive(Args, Debug)]
pub struct ProposalArgs {
    /// Proposal number.
    pub id: u64,
    /// Run name, e.g. "2020-2".
    pub run: String,
    /// Beamline name, e.g. "9-ID-B,C".
    pub beamline: String,
}

/// Arguments for `apsbss runs`.
#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Include start and end dates.
    #[arg(long, short)]
    pub full: bool,

    /// Oldest run first.
    #[arg(long, short)]
    pub ascending: bool,
}

/// Arguments for `apsbss list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Run name, or one of now/current, previous/prior/past, next/future.
    #[arg(long, short, default_value = "now")]
    pub run: String,

    /// Beamline name. Defaults to the configured beamline.
    pub beamline: Option<String>,
}

#[derive(Tabled)]
struct RunRow {
    run: String,
    start: String,
    end: String,
}

#[derive(Tabled)]
struct ProposalRow {
    id: u64,
    start: String,
    end: String,
    #[tabled(rename = "user(s)")]
    users: String,
    title: String,
}

#[derive(Tabled)]
struct EsafRow {
    id: u64,
    status: String,
    start: String,
    end: String,
    #[tabled(rename = "user(s)")]
    users: String,
    title: String,
}

fn home() -> Result<std::path::PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Configuration if `apsbss init` ran, defaults otherwise.
fn load_config(home: &Path) -> Result<Config> {
    match config::load_at(home) {
        Ok(cfg) => Ok(cfg),
        Err(ConfigError::NotFound { .. }) => Ok(Config::default()),
        Err(err) => Err(err).context("failed to load configuration"),
    }
}

fn upstream(cfg: &Config) -> Result<HttpUpstream> {
    HttpUpstream::from_config(cfg).context("failed to read credentials")
}

fn day(t: Timestamp) -> String {
    t.0.format("%Y-%m-%d").to_string()
}

fn last_names(users: &UserList) -> String {
    let names: Vec<&str> = users.all().iter().map(|u| u.last_name.as_str()).collect();
    trim(&names.join(","), USERS_WIDTH)
}

/// Headline for a proposal, PI included.
pub(crate) fn describe_proposal(p: &Proposal) -> Vec<String> {
    let mut lines = vec![
        format!("proposal {}: {}", p.id, p.title),
        format!("  beamline {}, {} .. {}", p.beamline, p.start, p.end),
    ];
    match p.pi() {
        Some(pi) => lines.push(format!("  PI {pi}")),
        None => lines.push("  no users listed".to_owned()),
    }
    lines
}

fn describe_esaf(e: &Esaf) -> Vec<String> {
    vec![
        format!("esaf {}: {} [{}]", e.id, e.title, e.status),
        format!("  sector {}, run {}, {} .. {}", e.sector, e.run, e.start, e.end),
    ]
}

/// Runs ordered by start, newest first unless `ascending`.
pub(crate) fn order_runs(mut runs: Vec<Run>, ascending: bool) -> Vec<Run> {
    runs.sort_by_key(|r| r.start);
    if !ascending {
        runs.reverse();
    }
    runs
}

/// Resolves a run name or alias against the calendar, relative to `now`.
pub(crate) fn resolve_run(runs: &[Run], wanted: &str, now: Timestamp) -> Option<Run> {
    let ordered = order_runs(runs.to_vec(), true);
    let current = || ordered.iter().position(|r| r.covers(now));
    let picked = match wanted.trim().to_lowercase().as_str() {
        "now" | "current" => current().map(|i| &ordered[i]),
        "previous" | "prior" | "past" => current()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| ordered.get(i)),
        "next" | "future" => current().and_then(|i| ordered.get(i + 1)),
        name => ordered.iter().find(|r| r.name == name),
    };
    picked.cloned()
}

impl EsafArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config(&home()?)?;
        let esaf = upstream(&cfg)?
            .fetch_esaf(EsafId(self.id))
            .context("ESAF lookup failed")?
            .ok_or_else(|| anyhow!("ESAF {} not found", self.id))?;
        for line in describe_esaf(&esaf) {
            println!("{line}");
        }
        println!();
        print!("{}", esaf.raw.as_str());
        Ok(())
    }
}

impl ProposalArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config(&home()?)?;
        let beamline = BeamlineName::from(self.beamline.as_str());
        let proposal = upstream(&cfg)?
            .fetch_proposal(ProposalId(self.id), &self.run, &beamline)
            .context("proposal lookup failed")?
            .ok_or_else(|| {
                anyhow!("proposal {} not found on {} in run {}", self.id, beamline, self.run)
            })?;
        for line in describe_proposal(&proposal) {
            println!("{line}");
        }
        println!();
        print!("{}", proposal.raw.as_str());
        Ok(())
    }
}

impl RunsArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config(&home()?)?;
        let runs = upstream(&cfg)?.runs().context("run lookup failed")?;
        let runs = order_runs(runs, self.ascending);
        if !self.full {
            for run in &runs {
                println!("{}", run.name);
            }
            return Ok(());
        }
        let rows: Vec<RunRow> = runs
            .into_iter()
            .map(|r| RunRow {
                run: r.name,
                start: r.start.to_string(),
                end: r.end.to_string(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

pub fn beamlines() -> Result<()> {
    let cfg = load_config(&home()?)?;
    for name in upstream(&cfg)?.beamlines().context("beamline lookup failed")? {
        println!("{name}");
    }
    Ok(())
}

impl ListArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config(&home()?)?;
        let beamline = self
            .beamline
            .or_else(|| cfg.beamline.clone())
            .map(BeamlineName::from)
            .ok_or_else(|| anyhow!("no beamline given and none configured; run `apsbss init`"))?;
        let sector = SectorId::from_beamline(&beamline.0)
            .ok_or_else(|| anyhow!("cannot derive a sector from beamline {beamline:?}"))?;

        let client = upstream(&cfg)?;
        let runs = client.runs().context("run lookup failed")?;
        let run = resolve_run(&runs, &self.run, Timestamp::now())
            .ok_or_else(|| anyhow!("no run matches {:?}", self.run))?;

        let proposals = client
            .proposals_in_run(&beamline, &run.name)
            .context("proposal lookup failed")?
            .records;
        let esafs = client
            .esafs_in_run(&sector, &run)
            .context("ESAF lookup failed")?
            .records;

        println!("Proposal(s): beamline {beamline}, run {}", run.name);
        let mut rows: Vec<ProposalRow> = proposals
            .iter()
            .map(|p| ProposalRow {
                id: p.id.0,
                start: day(p.start),
                end: day(p.end),
                users: last_names(&p.users),
                title: trim(&p.title, TITLE_WIDTH),
            })
            .collect();
        rows.sort_by(|a, b| b.start.cmp(&a.start));
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        println!("ESAF(s): sector {sector}, run {}", run.name);
        let mut rows: Vec<EsafRow> = esafs
            .iter()
            .map(|e| EsafRow {
                id: e.id.0,
                status: e.status.clone(),
                start: day(e.start),
                end: day(e.end),
                users: last_names(&e.users),
                title: trim(&e.title, TITLE_WIDTH),
            })
            .collect();
        rows.sort_by(|a, b| b.start.cmp(&a.start));
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        let pairs = pair_by_badges(&proposals, &esafs);
        if !pairs.is_empty() {
            println!("Same people on proposal and ESAF:");
            for (proposal, esaf_ids) in pairs {
                let ids: Vec<String> = esaf_ids.iter().map(ToString::to_string).collect();
                println!("  proposal {proposal}: ESAF {}", ids.join(", "));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bss_core::{RawText, User};

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).expect("timestamp")
    }

    fn run(name: &str, start: &str, end: &str) -> Run {
        Run { name: name.into(), start: ts(start), end: ts(end) }
    }

    fn calendar() -> Vec<Run> {
        vec![
            run("2020-2", "2020-06-09 08:00:00", "2020-10-01 08:00:00"),
            run("2020-1", "2020-01-28 08:00:00", "2020-06-09 08:00:00"),
            run("2020-3", "2020-10-01 08:00:00", "2020-12-22 08:00:00"),
        ]
    }

    #[test]
    fn runs_are_newest_first_by_default() {
        let names: Vec<String> = order_runs(calendar(), false).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["2020-3", "2020-2", "2020-1"]);
        let names: Vec<String> = order_runs(calendar(), true).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["2020-1", "2020-2", "2020-3"]);
    }

    #[test]
    fn run_aliases_resolve_around_the_current_run() {
        let now = ts("2020-07-01 12:00:00");
        let name = |wanted: &str| resolve_run(&calendar(), wanted, now).map(|r| r.name);
        assert_eq!(name("now").as_deref(), Some("2020-2"));
        assert_eq!(name("Current").as_deref(), Some("2020-2"));
        assert_eq!(name("previous").as_deref(), Some("2020-1"));
        assert_eq!(name("next").as_deref(), Some("2020-3"));
        assert_eq!(name("2020-1").as_deref(), Some("2020-1"));
        assert_eq!(name("2019-3"), None);
    }

    #[test]
    fn no_previous_before_the_first_run() {
        let now = ts("2020-02-01 12:00:00");
        assert!(resolve_run(&calendar(), "prior", now).is_none());
        assert!(resolve_run(&calendar(), "now", ts("2021-06-01 00:00:00")).is_none());
    }

    #[test]
    fn proposal_headline_names_the_pi() {
        let user = |first: &str, last: &str, pi: bool| User {
            first_name: first.into(),
            last_name: last.into(),
            email: format!("{}@anl.gov", last.to_lowercase()),
            is_pi: pi,
            ..User::default()
        };
        let proposal = Proposal {
            id: ProposalId(64629),
            title: "USAXS of battery slurries".into(),
            start: ts("2020-06-01 08:00:00"),
            end: ts("2020-06-05 08:00:00"),
            submitted: None,
            beamline: "9-ID-B,C".into(),
            mail_in: false,
            proprietary: false,
            users: UserList::new(vec![user("Ivan", "Kuzmenko", false), user("Jan", "Ilavsky", true)]),
            raw: RawText::default(),
        };

        let lines = describe_proposal(&proposal);

        assert_eq!(lines[0], "proposal 64629: USAXS of battery slurries");
        assert_eq!(lines[2], "  PI Jan Ilavsky <ilavsky@anl.gov>");
    }
}
