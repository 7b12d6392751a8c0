//! The sync driver: one owner for the published snapshot and the cycle
//! state machine around it.
//!
//! ```text
//! IDLE → FETCHING → SELECTING → PROJECTING → DIFFING → PUBLISHING → IDLE
//!            │
//!            └──(fetch failure)──→ DEGRADED ──(next cycle)──→ FETCHING
//! any phase boundary ──(cancel)──→ STOPPED
//! ```
//!
//! A cycle never returns an error. Fetch failures become `stale` (or `error`
//! before anything was ever published), field write failures become
//! `partial`, and both are visible in `status_msg` and the [`CycleReport`].
//!
//! A new driver starts from whatever the broadcast layer already shows, so a
//! restarted process serves the previous table as `stale` rather than wiping it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use bss_client::{FetchBatch, Upstream};
use bss_core::{Esaf, FetchError, Proposal, Settings, Station, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::broadcast::Broadcast;
use crate::fields::{FieldTable, STATUS_KEY};
use crate::projector::project;
use crate::select::{select_current, SelectionPolicy};
use crate::snapshot::Snapshot;
use crate::status::{Status, StatusReporter};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Fetching,
    Selecting,
    Projecting,
    Diffing,
    Publishing,
    Degraded,
    Stopped,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::Fetching => "FETCHING",
            SyncState::Selecting => "SELECTING",
            SyncState::Projecting => "PROJECTING",
            SyncState::Diffing => "DIFFING",
            SyncState::Publishing => "PUBLISHING",
            SyncState::Degraded => "DEGRADED",
            SyncState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Shared stop flag, checked at every phase boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    pub station: Station,
    pub prefix: String,
    pub policy: SelectionPolicy,
    /// Status when the fetch worked but nothing is active.
    pub idle_status: Status,
    pub backoff: Backoff,
    /// Write the empty projection when the driver stops.
    pub clear_on_stop: bool,
}

impl DriverOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            station: Station {
                sector: settings.sector.clone(),
                beamline: settings.beamline.clone(),
            },
            prefix: settings.prefix.clone(),
            policy: SelectionPolicy {
                preferred_esaf_status: settings.preferred_esaf_status.clone(),
            },
            idle_status: settings.idle_status.into(),
            backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
            clear_on_stop: settings.clear_on_stop,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub as_of: String,
    pub status: Status,
    /// State the driver was left in.
    pub state: SyncState,
    pub proposal_id: Option<u64>,
    pub esaf_id: Option<u64>,
    pub written: usize,
    pub unchanged: usize,
    /// Keys whose write was refused; retried next cycle.
    pub failed: Vec<String>,
    pub dropped_records: usize,
    pub fetch_error: Option<String>,
    pub consecutive_failures: u32,
    /// Suggested wait before the next attempt, set while degraded.
    pub retry_in_ms: Option<u64>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(as_of: Timestamp) -> Self {
        Self {
            as_of: as_of.canonical(),
            status: Status::Ok,
            state: SyncState::Idle,
            proposal_id: None,
            esaf_id: None,
            written: 0,
            unchanged: 0,
            failed: Vec::new(),
            dropped_records: 0,
            fetch_error: None,
            consecutive_failures: 0,
            retry_in_ms: None,
            cancelled: false,
            duration_ms: 0,
        }
    }
}

/// Result of a dry run: what would be published, without publishing.
#[derive(Debug, Clone)]
pub struct Preview {
    pub snapshot: Snapshot,
    pub table: FieldTable,
    pub proposal: Option<Proposal>,
    pub esaf: Option<Esaf>,
    pub dropped_records: usize,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct SyncDriver {
    upstream: Arc<dyn Upstream>,
    broadcast: Box<dyn Broadcast>,
    table: FieldTable,
    options: DriverOptions,
    state: SyncState,
    /// What consumers currently see. `None` until something is published.
    published: Option<Snapshot>,
    /// Keys whose last write failed.
    unconfirmed: BTreeSet<String>,
    reporter: StatusReporter,
    consecutive_failures: u32,
    /// Next successful cycle writes every key (start-up, recovery).
    force_full: bool,
    subscribers: Vec<mpsc::Sender<CycleReport>>,
}

impl fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDriver")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl SyncDriver {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        broadcast: Box<dyn Broadcast>,
        options: DriverOptions,
    ) -> Self {
        let table = FieldTable::new(options.prefix.clone());
        let published = Snapshot::from_handles(&table, &broadcast.current());
        if let Some(previous) = &published {
            info!(
                "resuming from the published table (status {:?})",
                previous.status()
            );
        }
        Self {
            upstream,
            broadcast,
            table,
            options,
            state: SyncState::Idle,
            published,
            unconfirmed: BTreeSet::new(),
            reporter: StatusReporter::new(),
            consecutive_failures: 0,
            force_full: true,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn table(&self) -> &FieldTable {
        &self.table
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn published(&self) -> Option<&Snapshot> {
        self.published.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Receives a [`CycleReport`] after every cycle. Dropped receivers are
    /// pruned on the next send.
    pub fn subscribe_status(&mut self) -> mpsc::Receiver<CycleReport> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Backoff delay implied by the current failure streak.
    pub fn retry_delay(&self) -> Duration {
        self.options.backoff.delay(self.consecutive_failures)
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            debug!("sync state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Runs one full cycle for instant `as_of`.
    pub fn run_cycle(&mut self, as_of: Timestamp, cancel: &CancelToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(as_of);

        if self.state == SyncState::Stopped || cancel.is_cancelled() {
            return self.finish_cancelled(report, started);
        }
        self.reporter.begin();

        // FETCHING
        self.transition(SyncState::Fetching);
        let (proposals, esafs) = match self.fetch(as_of) {
            Ok(batches) => batches,
            Err(err) => return self.degrade(err, report, started),
        };
        report.dropped_records = proposals.dropped + esafs.dropped;
        if cancel.is_cancelled() {
            return self.finish_cancelled(report, started);
        }

        // SELECTING
        self.transition(SyncState::Selecting);
        let policy = &self.options.policy;
        let proposal = select_current(&proposals.records, as_of, policy);
        let esaf = select_current(&esafs.records, as_of, policy);
        report.proposal_id = proposal.map(|p| p.id.0);
        report.esaf_id = esaf.map(|e| e.id.0);
        if cancel.is_cancelled() {
            return self.finish_cancelled(report, started);
        }

        // PROJECTING
        self.transition(SyncState::Projecting);
        let mut target = project(proposal, esaf);
        if proposal.is_none() && esaf.is_none() {
            debug!("no active proposal or ESAF at {as_of}");
            self.reporter.observe(self.options.idle_status);
        }
        if cancel.is_cancelled() {
            return self.finish_cancelled(report, started);
        }

        // DIFFING
        self.transition(SyncState::Diffing);
        let baseline = if self.force_full { None } else { self.published.as_ref() };
        let mut changes = target.diff(baseline);
        for key in &self.unconfirmed {
            if let Some(value) = target.get(key) {
                changes.insert(key.clone(), value.to_owned());
            }
        }
        changes.remove(STATUS_KEY);
        report.unchanged = target.len() - 1 - changes.len();
        if cancel.is_cancelled() {
            return self.finish_cancelled(report, started);
        }

        // PUBLISHING: past this point the cycle runs to the end.
        self.transition(SyncState::Publishing);
        let (written, failed) = self.write(&changes);
        report.written = written;
        report.failed = failed;
        if !report.failed.is_empty() {
            self.reporter.observe(Status::Partial);
        }
        let status = self.reporter.finish();
        target.set(STATUS_KEY, status.as_str());
        self.write_status(&target, &mut report);
        report.status = if report.failed.is_empty() { status } else { status.max(Status::Partial) };

        self.published = Some(target);
        self.force_full = false;
        self.consecutive_failures = 0;
        self.transition(SyncState::Idle);
        self.finish(report, started)
    }

    /// Fetch, select and project without touching the broadcast layer.
    pub fn preview(&self, as_of: Timestamp) -> Result<Preview, FetchError> {
        let (proposals, esafs) = self.fetch(as_of)?;
        let policy = &self.options.policy;
        let proposal = select_current(&proposals.records, as_of, policy).cloned();
        let esaf = select_current(&esafs.records, as_of, policy).cloned();
        let mut snapshot = project(proposal.as_ref(), esaf.as_ref());
        let status = if proposal.is_none() && esaf.is_none() {
            self.options.idle_status
        } else {
            Status::Ok
        };
        snapshot.set(STATUS_KEY, status.as_str());
        Ok(Preview {
            snapshot,
            table: self.table.clone(),
            proposal,
            esaf,
            dropped_records: proposals.dropped + esafs.dropped,
        })
    }

    /// Writes the empty table, status included, so consumers see nothing
    /// published. The next fetch failure reports `error` again.
    pub fn clear(&mut self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(Timestamp::now());
        let blank = Snapshot::blank();
        let baseline = if self.force_full { None } else { self.published.as_ref() };
        let mut changes = blank.diff(baseline);
        for key in &self.unconfirmed {
            changes.insert(key.clone(), String::new());
        }
        report.unchanged = blank.len() - changes.len();
        let (written, failed) = self.write(&changes);
        info!("cleared {written} fields ({} failed)", failed.len());
        report.written = written;
        report.status = if failed.is_empty() { Status::Ok } else { Status::Partial };
        report.failed = failed;
        self.published = None;
        self.force_full = true;
        self.finish(report, started)
    }

    /// Moves to `STOPPED`. With `clear_on_stop`, first writes the empty table.
    pub fn stop(&mut self) {
        if self.state == SyncState::Stopped {
            return;
        }
        if self.options.clear_on_stop && self.published.is_some() {
            self.clear();
        }
        self.transition(SyncState::Stopped);
    }

    /// Both fetches run in parallel and both must finish before selection.
    fn fetch(
        &self,
        as_of: Timestamp,
    ) -> Result<(FetchBatch<Proposal>, FetchBatch<Esaf>), FetchError> {
        let upstream = &self.upstream;
        let station = &self.options.station;
        let (proposals, esafs) = std::thread::scope(|scope| {
            let esaf_fetch = scope.spawn(|| upstream.fetch_esafs(station, as_of));
            let proposals = upstream.fetch_proposals(station, as_of);
            let esafs = esaf_fetch
                .join()
                .unwrap_or_else(|_| Err(FetchError::Network("ESAF fetch panicked".to_owned())));
            (proposals, esafs)
        });
        match (proposals, esafs) {
            (Ok(p), Ok(e)) => Ok((p, e)),
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
            (Err(err), Err(other)) => {
                debug!("ESAF fetch also failed: {other}");
                Err(err)
            }
        }
    }

    /// Fetch failure: keep serving the last snapshot and flag it.
    fn degrade(&mut self, err: FetchError, mut report: CycleReport, started: Instant) -> CycleReport {
        self.transition(SyncState::Degraded);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.force_full = true;
        warn!(
            "fetch failed ({}), attempt {}: {err}",
            err.kind(),
            self.consecutive_failures
        );

        let mut target = match &self.published {
            Some(previous) => {
                self.reporter.observe(Status::Stale);
                previous.clone()
            }
            None => {
                // Nothing was ever published: consumers get the empty table.
                self.reporter.observe(Status::Error);
                let blank = Snapshot::blank();
                let mut changes = blank.diff(None);
                changes.remove(STATUS_KEY);
                let (written, failed) = self.write(&changes);
                report.written = written;
                report.failed = failed;
                blank
            }
        };
        let status = self.reporter.finish();
        target.set(STATUS_KEY, status.as_str());
        self.write_status(&target, &mut report);
        self.published = Some(target);

        let retry = self.retry_delay();
        report.status = status;
        report.fetch_error = Some(err.to_string());
        report.retry_in_ms = Some(u64::try_from(retry.as_millis()).unwrap_or(u64::MAX));
        self.finish(report, started)
    }

    fn finish_cancelled(&mut self, mut report: CycleReport, started: Instant) -> CycleReport {
        info!("cycle cancelled in {}", self.state);
        self.stop();
        report.cancelled = true;
        report.status = self.reporter.last().unwrap_or(Status::Ok);
        self.finish(report, started)
    }

    /// Writes the status field if it differs from what consumers see.
    fn write_status(&mut self, target: &Snapshot, report: &mut CycleReport) {
        let value = target.status();
        let shown = self.published.as_ref().map(Snapshot::status);
        let must_write = self.unconfirmed.contains(STATUS_KEY)
            || shown != Some(value)
            || (self.force_full && self.state != SyncState::Degraded);
        if !must_write {
            report.unchanged += 1;
            return;
        }
        let mut single = BTreeMap::new();
        single.insert(STATUS_KEY.to_owned(), value.to_owned());
        let (written, failed) = self.write(&single);
        report.written += written;
        report.failed.extend(failed);
    }

    /// Publishes `changes` (key → value), continuing past failures.
    /// Returns the number written and the keys that failed.
    fn write(&mut self, changes: &BTreeMap<String, String>) -> (usize, Vec<String>) {
        let mut keys = Vec::with_capacity(changes.len());
        let mut writes = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            if let Some(handle) = self.table.handle(key) {
                keys.push(key.clone());
                writes.push((handle.to_owned(), value.clone()));
            }
        }
        if writes.is_empty() {
            return (0, Vec::new());
        }

        let results = self.broadcast.publish_many(&writes);
        let mut written = 0;
        let mut failed = Vec::new();
        for (index, key) in keys.into_iter().enumerate() {
            match results.get(index) {
                Some(Ok(())) => {
                    written += 1;
                    self.unconfirmed.remove(&key);
                }
                Some(Err(e)) => {
                    warn!("publish {} failed: {e}", writes[index].0);
                    self.unconfirmed.insert(key.clone());
                    failed.push(key);
                }
                None => {
                    warn!("publish {}: no result from broadcast layer", writes[index].0);
                    self.unconfirmed.insert(key.clone());
                    failed.push(key);
                }
            }
        }
        (written, failed)
    }

    fn finish(&mut self, mut report: CycleReport, started: Instant) -> CycleReport {
        report.state = self.state;
        report.consecutive_failures = self.consecutive_failures;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "cycle {} at {}: {} written, {} unchanged, {} failed, {} dropped ({} ms)",
            report.status,
            report.as_of,
            report.written,
            report.unchanged,
            report.failed.len(),
            report.dropped_records,
            report.duration_ms
        );
        self.subscribers.retain(|tx| tx.send(report.clone()).is_ok());
        report
    }
}
