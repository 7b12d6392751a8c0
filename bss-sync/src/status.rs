//! Cycle health, as published in `status_msg`.

use std::fmt;

use bss_core::IdleStatus;
use serde::{Deserialize, Serialize};

/// Outcome of one cycle. Variants are declared in precedence order so the
/// worst condition observed is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Snapshot reflects the latest successful fetch.
    Ok,
    /// Some fields failed to publish this cycle.
    Partial,
    /// Last fetch failed; the previous snapshot is still being served.
    Stale,
    /// The current record cannot be determined at all.
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Partial => "partial",
            Status::Stale => "stale",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<IdleStatus> for Status {
    fn from(idle: IdleStatus) -> Self {
        match idle {
            IdleStatus::Ok => Status::Ok,
            IdleStatus::Error => Status::Error,
        }
    }
}

/// Folds the conditions seen during a cycle into one [`Status`].
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    current: Option<Status>,
    last: Option<Status>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a cycle at `ok`.
    pub fn begin(&mut self) {
        self.current = Some(Status::Ok);
    }

    /// Records a condition; the cycle keeps the worst one seen.
    pub fn observe(&mut self, status: Status) {
        self.current = Some(self.current.map_or(status, |c| c.max(status)));
    }

    /// The status the cycle would finish with right now.
    pub fn pending(&self) -> Status {
        self.current.unwrap_or(Status::Ok)
    }

    /// Ends the cycle and remembers its status.
    pub fn finish(&mut self) -> Status {
        let status = self.pending();
        self.current = None;
        self.last = Some(status);
        status
    }

    /// Status of the last finished cycle.
    pub fn last(&self) -> Option<Status> {
        self.last
    }
}
