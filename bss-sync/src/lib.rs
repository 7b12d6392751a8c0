//! # bss-sync
//!
//! The synchronization engine: select the active records, project them onto
//! the fixed field table, diff against what is published, publish only the
//! changes, and report the cycle status.
//!
//! Build a [`SyncDriver`] with [`driver_at`] (HTTP upstream, snapshot file
//! broadcast) or [`SyncDriver::new`] for custom collaborators, then call
//! [`SyncDriver::run_cycle`] once per tick.

pub mod backoff;
pub mod broadcast;
pub mod driver;
pub mod error;
pub mod fields;
pub mod pairing;
pub mod projector;
pub mod select;
pub mod snapshot;
pub mod snapshot_file;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use bss_client::HttpUpstream;
use bss_core::Settings;

pub use backoff::Backoff;
pub use broadcast::{Broadcast, MemoryBroadcast};
pub use driver::{CancelToken, CycleReport, DriverOptions, Preview, SyncDriver, SyncState};
pub use error::SyncError;
pub use fields::{FieldTable, STATUS_KEY};
pub use pairing::pair_by_badges;
pub use projector::project;
pub use select::{select_current, Candidate, SelectionPolicy};
pub use snapshot::Snapshot;
pub use snapshot_file::SnapshotFileBroadcast;
pub use status::{Status, StatusReporter};

/// Name of the published snapshot file for these settings.
pub fn snapshot_name(settings: &Settings) -> String {
    settings.sector.0.clone()
}

/// Driver wired to the facility services and to
/// `<home>/.apsbss/published/<sector>.json`.
pub fn driver_at(home: &Path, settings: &Settings) -> Result<SyncDriver, SyncError> {
    let upstream = HttpUpstream::from_settings(settings)?;
    let broadcast = SnapshotFileBroadcast::open_at(home, &snapshot_name(settings))?;
    Ok(SyncDriver::new(
        Arc::new(upstream),
        Box::new(broadcast),
        DriverOptions::from_settings(settings),
    ))
}
