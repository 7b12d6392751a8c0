//! Picks the single active proposal and ESAF for an instant.
//!
//! Only records whose inclusive `[start, end]` window contains the instant
//! are candidates. Among those the highest [`Candidate::rank`] wins; ranks
//! end with the record id so equal-looking records still resolve the same
//! way regardless of the order the upstream returned them in.

use bss_core::{Esaf, EsafId, Proposal, ProposalId, Timestamp};

/// Tunable part of the selection rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// ESAFs with this status beat every other status (compared ignoring case).
    pub preferred_esaf_status: String,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self { preferred_esaf_status: "Approved".to_owned() }
    }
}

/// A record that can compete for "current".
pub trait Candidate {
    type Rank: Ord;

    fn window(&self) -> (Timestamp, Timestamp);

    fn rank(&self, policy: &SelectionPolicy) -> Self::Rank;

    fn covers(&self, as_of: Timestamp) -> bool {
        let (start, end) = self.window();
        start <= as_of && as_of <= end
    }
}

impl Candidate for Proposal {
    /// Latest submission, then latest start, then highest id.
    /// A proposal without a submission date ranks below any that has one.
    type Rank = (Option<Timestamp>, Timestamp, ProposalId);

    fn window(&self) -> (Timestamp, Timestamp) {
        (self.start, self.end)
    }

    fn rank(&self, _policy: &SelectionPolicy) -> Self::Rank {
        (self.submitted, self.start, self.id)
    }
}

impl Candidate for Esaf {
    /// Preferred status, then latest start, then highest id.
    type Rank = (bool, Timestamp, EsafId);

    fn window(&self) -> (Timestamp, Timestamp) {
        (self.start, self.end)
    }

    fn rank(&self, policy: &SelectionPolicy) -> Self::Rank {
        let preferred = self
            .status
            .trim()
            .eq_ignore_ascii_case(policy.preferred_esaf_status.trim());
        (preferred, self.start, self.id)
    }
}

/// The active record at `as_of`, or `None` between experiments.
pub fn select_current<'a, T: Candidate>(
    records: &'a [T],
    as_of: Timestamp,
    policy: &SelectionPolicy,
) -> Option<&'a T> {
    records
        .iter()
        .filter(|r| r.covers(as_of))
        .max_by_key(|r| r.rank(policy))
}
