//! The fetch contract the sync driver depends on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bss_core::{BeamlineName, Esaf, EsafId, FetchError, Proposal, ProposalId, Station, Timestamp};

/// Records from one upstream query plus the count of documents dropped as
/// malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch<T> {
    pub records: Vec<T>,
    pub dropped: usize,
}

impl<T> FetchBatch<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self { records, dropped: 0 }
    }

    pub fn empty() -> Self {
        Self { records: Vec::new(), dropped: 0 }
    }
}

impl<T> Default for FetchBatch<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// A source of proposals and ESAFs overlapping an instant.
///
/// Implementations never retry and never panic on bad input: a failed query
/// is a [`FetchError`], a bad document is dropped and counted.
pub trait Upstream: Send + Sync {
    fn fetch_proposals(
        &self,
        station: &Station,
        as_of: Timestamp,
    ) -> Result<FetchBatch<Proposal>, FetchError>;

    fn fetch_esafs(
        &self,
        station: &Station,
        as_of: Timestamp,
    ) -> Result<FetchBatch<Esaf>, FetchError>;

    /// One ESAF by number. `Ok(None)` when the service has no such ESAF.
    fn fetch_esaf(&self, id: EsafId) -> Result<Option<Esaf>, FetchError>;

    /// One proposal scheduled on `beamline` during `run`.
    fn fetch_proposal(
        &self,
        id: ProposalId,
        run: &str,
        beamline: &BeamlineName,
    ) -> Result<Option<Proposal>, FetchError>;
}

/// An in-process upstream whose answers are set by the caller.
///
/// Used for embedding and for exercising the sync driver without a network.
#[derive(Debug)]
pub struct StaticUpstream {
    proposals: Mutex<Result<FetchBatch<Proposal>, FetchError>>,
    esafs: Mutex<Result<FetchBatch<Esaf>, FetchError>>,
    calls: AtomicUsize,
}

impl Default for StaticUpstream {
    fn default() -> Self {
        Self {
            proposals: Mutex::new(Ok(FetchBatch::empty())),
            esafs: Mutex::new(Ok(FetchBatch::empty())),
            calls: AtomicUsize::new(0),
        }
    }
}

impl StaticUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_proposals(&self, answer: Result<FetchBatch<Proposal>, FetchError>) {
        if let Ok(mut slot) = self.proposals.lock() {
            *slot = answer;
        }
    }

    pub fn set_esafs(&self, answer: Result<FetchBatch<Esaf>, FetchError>) {
        if let Ok(mut slot) = self.esafs.lock() {
            *slot = answer;
        }
    }

    /// Makes both queries fail with `err`.
    pub fn fail_with(&self, err: FetchError) {
        self.set_proposals(Err(err.clone()));
        self.set_esafs(Err(err));
    }

    /// Number of fetch calls answered so far (proposal and ESAF counted separately).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn answer<T: Clone>(slot: &Mutex<Result<FetchBatch<T>, FetchError>>) -> Result<FetchBatch<T>, FetchError> {
    slot.lock()
        .map_err(|_| FetchError::Network("static upstream poisoned".to_owned()))?
        .clone()
}

impl Upstream for StaticUpstream {
    fn fetch_proposals(
        &self,
        _station: &Station,
        _as_of: Timestamp,
    ) -> Result<FetchBatch<Proposal>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        answer(&self.proposals)
    }

    fn fetch_esafs(
        &self,
        _station: &Station,
        _as_of: Timestamp,
    ) -> Result<FetchBatch<Esaf>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        answer(&self.esafs)
    }

    fn fetch_esaf(&self, id: EsafId) -> Result<Option<Esaf>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(answer(&self.esafs)?.records.into_iter().find(|e| e.id == id))
    }

    fn fetch_proposal(
        &self,
        id: ProposalId,
        _run: &str,
        beamline: &BeamlineName,
    ) -> Result<Option<Proposal>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(answer(&self.proposals)?
            .records
            .into_iter()
            .find(|p| p.id == id && p.beamline == beamline.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bss_core::{RawText, SectorId, UserList};

    fn esaf(id: u64) -> Esaf {
        Esaf {
            id: EsafId(id),
            title: format!("ESAF {id}"),
            description: String::new(),
            run: "2020-2".into(),
            sector: SectorId::from("09"),
            start: Timestamp::parse("2020-06-01 08:00:00").unwrap(),
            end: Timestamp::parse("2020-06-05 08:00:00").unwrap(),
            status: "Approved".into(),
            users: UserList::default(),
            raw: RawText::default(),
        }
    }

    #[test]
    fn esaf_lookup_searches_the_configured_answer() {
        let upstream = StaticUpstream::new();
        upstream.set_esafs(Ok(FetchBatch::new(vec![esaf(226319), esaf(226320)])));
        assert_eq!(upstream.fetch_esaf(EsafId(226320)).unwrap().map(|e| e.id), Some(EsafId(226320)));
        assert!(upstream.fetch_esaf(EsafId(1)).unwrap().is_none());
        assert_eq!(upstream.calls(), 2);
    }

    #[test]
    fn lookups_share_the_failure() {
        let upstream = StaticUpstream::new();
        upstream.fail_with(FetchError::Auth("401".into()));
        assert!(upstream.fetch_esaf(EsafId(226319)).is_err());
        let beamline = BeamlineName::from("9-ID-B,C");
        assert!(upstream.fetch_proposal(ProposalId(64629), "2020-2", &beamline).is_err());
    }
}
