//! Blocking HTTP client for the scheduling and ESAF services.
//!
//! Proposals come from the beamline scheduling API in two steps: the run
//! covering the instant, then the beamtime requests for that run and
//! beamline. ESAFs come from the ESAF service by sector and year. The run is
//! resolved once per instant and shared by both fetches of a cycle.

use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bss_core::config::{Config, Credentials, Settings, UpstreamConfig};
use bss_core::{
    BeamlineName, ConfigError, Esaf, EsafId, FetchError, Proposal, ProposalId, Run, SectorId,
    Station, Timestamp,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{
    beamline_from_document, esaf_from_document, normalize_batch, proposal_from_document,
    run_from_document,
};
use crate::upstream::{FetchBatch, Upstream};

pub struct HttpUpstream {
    agent: ureq::Agent,
    scheduling_url: String,
    esaf_url: String,
    authorization: Option<String>,
    /// Last run lookup, keyed by the instant it was made for.
    run_at: Mutex<Option<(Timestamp, Option<Run>)>>,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("scheduling_url", &self.scheduling_url)
            .field("esaf_url", &self.esaf_url)
            .field("authenticated", &self.authorization.is_some())
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(upstream: &UpstreamConfig, credentials: Option<Credentials>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let authorization = credentials.map(|c| {
            let token = STANDARD.encode(format!("{}:{}", c.username, c.password));
            format!("Basic {token}")
        });
        Self {
            agent,
            scheduling_url: upstream.scheduling_url.trim_end_matches('/').to_owned(),
            esaf_url: upstream.esaf_url.trim_end_matches('/').to_owned(),
            authorization,
            run_at: Mutex::new(None),
        }
    }

    /// Reads the credentials file named in `settings` and builds the client.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let credentials = settings.upstream.credentials()?;
        Ok(Self::new(&settings.upstream, credentials, settings.fetch_timeout))
    }

    /// Client for one-off lookups, which need no station.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let credentials = config.upstream.credentials()?;
        let timeout = Duration::from_secs(config.fetch_timeout_secs.max(1));
        Ok(Self::new(&config.upstream, credentials, timeout))
    }

    /// The body of `url`, or `None` on 404.
    fn call(&self, url: &str) -> Result<Option<Value>, FetchError> {
        let authorization = self
            .authorization
            .as_deref()
            .ok_or_else(|| FetchError::Auth("no credentials configured".to_owned()))?;
        debug!("GET {url}");
        let response = match self
            .agent
            .get(url)
            .set("Authorization", authorization)
            .set("Accept", "application/json")
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(map_error(url, e)),
        };
        response
            .into_json::<Value>()
            .map(Some)
            .map_err(|e| FetchError::Malformed(format!("{url}: {e}")))
    }

    fn get(&self, url: &str) -> Result<Value, FetchError> {
        self.call(url)?
            .ok_or_else(|| FetchError::Network(format!("{url}: HTTP 404 Not Found")))
    }

    fn get_list(&self, url: &str) -> Result<Vec<Value>, FetchError> {
        match self.get(url)? {
            Value::Array(items) => Ok(items),
            other => Err(FetchError::Malformed(format!(
                "{url}: expected a list, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// The run covering `as_of`, or `None` between runs. Repeated calls for
    /// the same instant reuse the first answer; the lock is held across the
    /// request so concurrent fetches wait for it instead of asking again.
    pub fn run_at(&self, as_of: Timestamp) -> Result<Option<Run>, FetchError> {
        let mut cached = self
            .run_at
            .lock()
            .map_err(|_| FetchError::Network("run cache poisoned".to_owned()))?;
        if let Some((at, run)) = cached.as_ref() {
            if *at == as_of {
                return Ok(run.clone());
            }
        }
        let url = format!("{}/run/getRunByDateTime/{}", self.scheduling_url, as_of.iso());
        let run = self
            .get_list(&url)?
            .iter()
            .find_map(|doc| run_from_document(doc).ok());
        *cached = Some((as_of, run.clone()));
        Ok(run)
    }

    /// Every run the scheduling service knows about.
    pub fn runs(&self) -> Result<Vec<Run>, FetchError> {
        let url = format!("{}/run/getAllRuns", self.scheduling_url);
        let docs = self.get_list(&url)?;
        let batch = normalize_batch("run", &docs, run_from_document);
        Ok(batch.records)
    }

    /// Active beamline names, sorted.
    pub fn beamlines(&self) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/beamline/findAllActiveBeamlines", self.scheduling_url);
        let docs = self.get_list(&url)?;
        let mut names = normalize_batch("beamline", &docs, beamline_from_document).records;
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Every proposal scheduled on `beamline` during `run`.
    pub fn proposals_in_run(
        &self,
        beamline: &BeamlineName,
        run: &str,
    ) -> Result<FetchBatch<Proposal>, FetchError> {
        let url = format!(
            "{}/beamtimeRequests/findBeamtimeRequestsByRunAndBeamline/{}/{}",
            self.scheduling_url, run, beamline
        );
        let docs = self.get_list(&url)?;
        Ok(normalize_batch("proposal", &docs, |doc| {
            proposal_from_document(doc, &beamline.0)
        }))
    }

    /// ESAFs for `sector` whose experiment starts within `run`.
    pub fn esafs_in_run(&self, sector: &SectorId, run: &Run) -> Result<FetchBatch<Esaf>, FetchError> {
        let Some(year) = run.year() else {
            warn!("run name {:?} has no year; no ESAFs to list", run.name);
            return Ok(FetchBatch::empty());
        };
        let url = format!("{}/esafs/{}/{}", self.esaf_url, sector, year);
        let docs = self.get_list(&url)?;
        let mut batch = normalize_batch("esaf", &docs, |doc| esaf_from_document(doc, sector, &run.name));
        batch.records.retain(|e| run.covers(e.start));
        Ok(batch)
    }
}

impl Upstream for HttpUpstream {
    fn fetch_proposals(
        &self,
        station: &Station,
        as_of: Timestamp,
    ) -> Result<FetchBatch<Proposal>, FetchError> {
        let Some(beamline) = &station.beamline else {
            debug!("no beamline configured; skipping proposal query");
            return Ok(FetchBatch::empty());
        };
        let Some(run) = self.run_at(as_of)? else {
            debug!("no run covers {as_of}");
            return Ok(FetchBatch::empty());
        };
        self.proposals_in_run(beamline, &run.name)
    }

    fn fetch_esafs(
        &self,
        station: &Station,
        as_of: Timestamp,
    ) -> Result<FetchBatch<Esaf>, FetchError> {
        let run = self.run_at(as_of)?.map(|r| r.name).unwrap_or_default();
        let url = format!("{}/esafs/{}/{}", self.esaf_url, station.sector, as_of.year());
        let docs = self.get_list(&url)?;
        Ok(normalize_batch("esaf", &docs, |doc| {
            esaf_from_document(doc, &station.sector, &run)
        }))
    }

    fn fetch_esaf(&self, id: EsafId) -> Result<Option<Esaf>, FetchError> {
        let url = format!("{}/esaf/{}", self.esaf_url, id);
        let Some(doc) = self.call(&url)? else {
            return Ok(None);
        };
        let sector = SectorId::from("");
        esaf_from_document(&doc, &sector, "")
            .map(Some)
            .map_err(|e| FetchError::Malformed(format!("{url}: {e}")))
    }

    fn fetch_proposal(
        &self,
        id: ProposalId,
        run: &str,
        beamline: &BeamlineName,
    ) -> Result<Option<Proposal>, FetchError> {
        let batch = self.proposals_in_run(beamline, run)?;
        Ok(batch.records.into_iter().find(|p| p.id == id))
    }
}

/// 401 and 403 are credential problems; everything else that kept us from a
/// body is a network problem.
pub fn map_error(url: &str, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(code @ (401 | 403), response) => {
            FetchError::Auth(format!("{url}: HTTP {code} {}", response.status_text()))
        }
        ureq::Error::Status(code, response) => {
            FetchError::Network(format!("{url}: HTTP {code} {}", response.status_text()))
        }
        ureq::Error::Transport(transport) => FetchError::Network(format!("{url}: {transport}")),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
