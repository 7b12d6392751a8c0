//! Normalizer from upstream JSON documents to the record model.
//!
//! The scheduling services return two shapes for a proposal: the flat one
//! (`id`, `title`, `startTime`, `experimenters`) and the nested beamtime
//! request (`proposal.gupId`, `proposalTitle`, `activity.startTime`,
//! `beamtime.proposal.experimenters`). Every field is looked up along an
//! ordered list of dotted paths; the first hit wins.

use bss_core::types::{parse_yes_flag, RawText};
use bss_core::{Esaf, EsafId, Proposal, ProposalId, Run, SectorId, Timestamp, User, UserList};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RecordError;
use crate::upstream::FetchBatch;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

const PROPOSAL_ID: &[&str] = &["id", "proposal.gupId"];
const PROPOSAL_TITLE: &[&str] = &["title", "proposalTitle"];
const PROPOSAL_START: &[&str] = &["startTime", "activity.startTime", "run.startTime"];
const PROPOSAL_END: &[&str] = &["endTime", "activity.endTime", "run.endTime"];
const PROPOSAL_SUBMITTED: &[&str] = &["submittedDate", "proposal.submittedDate", "beamtime.submittedDate"];
const PROPOSAL_BEAMLINE: &[&str] = &["beamline", "beamlineId", "beamtime.beamline.beamlineId"];
const PROPOSAL_MAIL_IN: &[&str] = &["mailInFlag", "beamtime.mailInFlag"];
const PROPOSAL_PROPRIETARY: &[&str] = &["proprietaryFlag", "beamtime.proprietaryFlag"];
const PROPOSAL_USERS: &[&str] = &["experimenters", "beamtime.proposal.experimenters"];

const ESAF_ID: &[&str] = &["esafId"];
const ESAF_TITLE: &[&str] = &["esafTitle"];
const ESAF_DESCRIPTION: &[&str] = &["description"];
const ESAF_STATUS: &[&str] = &["esafStatus"];
const ESAF_START: &[&str] = &["experimentStartDate"];
const ESAF_END: &[&str] = &["experimentEndDate"];
const ESAF_SECTOR: &[&str] = &["sector"];
const ESAF_RUN: &[&str] = &["run", "esafRun"];
const ESAF_USERS: &[&str] = &["experimentUsers"];

const RUN_NAME: &[&str] = &["runName", "name"];
const RUN_START: &[&str] = &["startTime"];
const RUN_END: &[&str] = &["endTime"];

const BEAMLINE_NAME: &[&str] = &["beamlineId", "name"];

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

/// Follows a dotted path (`"beamtime.proposal.experimenters"`) through nested
/// objects. `None` as soon as a segment is missing or not an object.
pub fn dig<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, part| node.as_object()?.get(part))
}

fn first<'a>(doc: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|p| dig(doc, p))
        .find(|v| !v.is_null())
}

/// Scalar as text. Numbers and booleans are rendered, null and containers are not.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text(doc: &Value, paths: &[&str]) -> String {
    first(doc, paths).and_then(scalar).unwrap_or_default()
}

fn numeric_id(doc: &Value, paths: &[&'static str]) -> Result<u64, RecordError> {
    let field = paths[0];
    let value = first(doc, paths).ok_or(RecordError::MissingField(field))?;
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| RecordError::BadId { field, value: value.to_string() })
}

fn timestamp(doc: &Value, paths: &[&'static str]) -> Result<Timestamp, RecordError> {
    let field = paths[0];
    let raw = first(doc, paths)
        .and_then(scalar)
        .filter(|s| !s.trim().is_empty())
        .ok_or(RecordError::MissingField(field))?;
    Timestamp::parse(&raw).map_err(|source| RecordError::BadTimestamp { field, source })
}

fn users(doc: &Value, paths: &[&'static str]) -> Result<UserList, RecordError> {
    let Some(value) = first(doc, paths) else {
        return Ok(UserList::default());
    };
    let entries = value
        .as_array()
        .ok_or(RecordError::NotAList { field: paths[0] })?;
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| user(entry).ok_or(RecordError::BadUser { index }))
        .collect::<Result<Vec<_>, _>>()
        .map(UserList::new)
}

fn user(entry: &Value) -> Option<User> {
    entry.as_object()?;
    Some(User {
        badge: text(entry, &["badge"]),
        email: text(entry, &["email"]),
        first_name: text(entry, &["firstName"]),
        last_name: text(entry, &["lastName"]),
        institution: text(entry, &["institution"]),
        institution_id: text(entry, &["instId"]),
        is_pi: User::parse_pi_flag(&text(entry, &["piFlag"])),
        user_id: dig(entry, "id").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }),
    })
}

/// The upstream document as YAML, captured once and never re-parsed.
fn raw_text(doc: &Value) -> Result<RawText, RecordError> {
    serde_yaml::to_string(doc)
        .map(RawText::new)
        .map_err(|e| RecordError::Raw(e.to_string()))
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Builds a [`Proposal`]. `beamline` fills in when the document has none.
pub fn proposal_from_document(doc: &Value, beamline: &str) -> Result<Proposal, RecordError> {
    if !doc.is_object() {
        return Err(RecordError::NotAnObject);
    }
    let id = numeric_id(doc, PROPOSAL_ID)?;
    // An unreadable submission date only weakens the tie-break.
    let submitted = match timestamp(doc, PROPOSAL_SUBMITTED) {
        Ok(t) => Some(t),
        Err(RecordError::MissingField(_)) => None,
        Err(e) => {
            debug!("proposal {id}: ignoring {e}");
            None
        }
    };
    let doc_beamline = text(doc, PROPOSAL_BEAMLINE);
    Ok(Proposal {
        id: ProposalId(id),
        title: text(doc, PROPOSAL_TITLE),
        start: timestamp(doc, PROPOSAL_START)?,
        end: timestamp(doc, PROPOSAL_END)?,
        submitted,
        beamline: if doc_beamline.is_empty() { beamline.to_owned() } else { doc_beamline },
        mail_in: parse_yes_flag(&text(doc, PROPOSAL_MAIL_IN)),
        proprietary: parse_yes_flag(&text(doc, PROPOSAL_PROPRIETARY)),
        users: users(doc, PROPOSAL_USERS)?,
        raw: raw_text(doc)?,
    })
}

/// Builds an [`Esaf`]. `sector` and `run` fill in when the document has none.
pub fn esaf_from_document(doc: &Value, sector: &SectorId, run: &str) -> Result<Esaf, RecordError> {
    if !doc.is_object() {
        return Err(RecordError::NotAnObject);
    }
    let doc_sector = text(doc, ESAF_SECTOR);
    let doc_run = text(doc, ESAF_RUN);
    Ok(Esaf {
        id: EsafId(numeric_id(doc, ESAF_ID)?),
        title: text(doc, ESAF_TITLE),
        description: text(doc, ESAF_DESCRIPTION),
        run: if doc_run.is_empty() { run.to_owned() } else { doc_run },
        sector: if doc_sector.is_empty() { sector.clone() } else { SectorId::normalized(&doc_sector) },
        start: timestamp(doc, ESAF_START)?,
        end: timestamp(doc, ESAF_END)?,
        status: text(doc, ESAF_STATUS),
        users: users(doc, ESAF_USERS)?,
        raw: raw_text(doc)?,
    })
}

pub fn run_from_document(doc: &Value) -> Result<Run, RecordError> {
    if !doc.is_object() {
        return Err(RecordError::NotAnObject);
    }
    let name = text(doc, RUN_NAME);
    if name.is_empty() {
        return Err(RecordError::MissingField(RUN_NAME[0]));
    }
    Ok(Run {
        name,
        start: timestamp(doc, RUN_START)?,
        end: timestamp(doc, RUN_END)?,
    })
}

/// Beamline name from an active-beamline entry.
pub fn beamline_from_document(doc: &Value) -> Result<String, RecordError> {
    let name = text(doc, BEAMLINE_NAME);
    if name.is_empty() {
        return Err(RecordError::MissingField(BEAMLINE_NAME[0]));
    }
    Ok(name)
}

/// Normalizes every document, dropping and counting the ones that fail.
pub fn normalize_batch<T>(
    kind: &str,
    docs: &[Value],
    build: impl Fn(&Value) -> Result<T, RecordError>,
) -> FetchBatch<T> {
    let mut records = Vec::with_capacity(docs.len());
    let mut dropped = 0;
    for (index, doc) in docs.iter().enumerate() {
        match build(doc) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("dropping {kind} document #{index}: {e}");
                dropped += 1;
            }
        }
    }
    FetchBatch { records, dropped }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn flat_proposal() -> Value {
        json!({
            "id": 66083,
            "title": "Chemical heterogeneity in battery cathodes",
            "startTime": "2020-06-01 08:00:00",
            "endTime": "2020-06-05 08:00:00",
            "submittedDate": "2020-03-01 12:00:00",
            "mailInFlag": "Y",
            "proprietaryFlag": "N",
            "experimenters": [
                {"badge": "86312", "email": "a@example.org", "firstName": "Ann", "lastName": "Ames",
                 "institution": "ANL", "instId": 3927, "id": 421, "piFlag": "Y"},
                {"badge": "53748", "email": "b@example.org", "firstName": "Bo", "lastName": "Berg",
                 "institution": "UIC", "instId": 1234, "id": 422},
            ]
        })
    }

    fn nested_proposal() -> Value {
        json!({
            "proposal": {"gupId": "78243"},
            "proposalTitle": "In situ tomography",
            "run": {"runName": "2024-1", "startTime": "2024-01-30T08:00:00-06:00", "endTime": "2024-05-01T08:00:00-05:00"},
            "activity": {"startTime": "2024-02-10T08:00:00-06:00", "endTime": "2024-02-12T08:00:00-06:00"},
            "beamtime": {"proposal": {"experimenters": [
                {"badge": 64065, "firstName": "Cy", "lastName": "Chan", "piFlag": "yes"}
            ]}}
        })
    }

    #[rstest]
    #[case("a.b.c", Some(json!(1)))]
    #[case("a.b", Some(json!({"c": 1})))]
    #[case("a.x.c", None)]
    #[case("a.b.c.d", None)]
    fn dig_follows_dotted_paths(#[case] path: &str, #[case] expected: Option<Value>) {
        let doc = json!({"a": {"b": {"c": 1}}});
        assert_eq!(dig(&doc, path).cloned(), expected);
    }

    #[test]
    fn flat_proposal_normalizes() {
        let p = proposal_from_document(&flat_proposal(), "9-ID-B,C").unwrap();
        assert_eq!(p.id, ProposalId(66083));
        assert_eq!(p.start.canonical(), "2020-06-01 08:00:00");
        assert_eq!(p.submitted.unwrap().canonical(), "2020-03-01 12:00:00");
        assert_eq!(p.beamline, "9-ID-B,C");
        assert!(p.mail_in);
        assert!(!p.proprietary);
        let users = p.users.all();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].institution_id, "3927");
        assert_eq!(users[0].user_id, Some(421));
        assert!(users[0].is_pi);
        assert!(!users[1].is_pi);
    }

    #[test]
    fn nested_proposal_prefers_activity_window() {
        let p = proposal_from_document(&nested_proposal(), "32-ID-B,C").unwrap();
        assert_eq!(p.id, ProposalId(78243));
        assert_eq!(p.title, "In situ tomography");
        assert_eq!(p.start.canonical(), "2024-02-10 08:00:00");
        assert!(p.submitted.is_none());
        assert_eq!(p.users.all()[0].badge, "64065");
        assert!(p.users.all()[0].is_pi);
    }

    #[test]
    fn nested_proposal_falls_back_to_run_window() {
        let mut doc = nested_proposal();
        doc.as_object_mut().unwrap().remove("activity");
        let p = proposal_from_document(&doc, "32-ID-B,C").unwrap();
        assert_eq!(p.start.canonical(), "2024-01-30 08:00:00");
    }

    #[test]
    fn raw_text_is_yaml_of_document() {
        let p = proposal_from_document(&flat_proposal(), "9-ID-B,C").unwrap();
        assert!(p.raw.as_str().contains("title: Chemical heterogeneity in battery cathodes"));
    }

    #[rstest]
    #[case(json!({"title": "no id", "startTime": "2020-06-01", "endTime": "2020-06-02"}))]
    #[case(json!({"id": "abc", "startTime": "2020-06-01", "endTime": "2020-06-02"}))]
    #[case(json!({"id": 1, "startTime": "whenever", "endTime": "2020-06-02"}))]
    #[case(json!({"id": 1, "startTime": "2020-06-01", "endTime": "2020-06-02", "experimenters": "nobody"}))]
    #[case(json!({"id": 1, "startTime": "2020-06-01", "endTime": "2020-06-02", "experimenters": [7]}))]
    #[case(json!(["not", "an", "object"]))]
    fn malformed_proposals_are_rejected(#[case] doc: Value) {
        assert!(proposal_from_document(&doc, "").is_err());
    }

    #[test]
    fn esaf_normalizes_and_pads_sector() {
        let doc = json!({
            "esafId": 226319,
            "esafTitle": "Commission 9-ID",
            "description": "Commissioning",
            "esafStatus": "Approved",
            "experimentStartDate": "2020-05-26 08:00:00",
            "experimentEndDate": "2020-09-28 08:00:00",
            "sector": "9",
            "experimentUsers": [{"badge": "86312", "firstName": "Ann", "lastName": "Ames", "email": "a@example.org"}]
        });
        let e = esaf_from_document(&doc, &SectorId::from("09"), "2020-2").unwrap();
        assert_eq!(e.id, EsafId(226319));
        assert_eq!(e.sector.0, "09");
        assert_eq!(e.run, "2020-2");
        assert_eq!(e.status, "Approved");
        assert_eq!(e.users.total(), 1);
    }

    #[test]
    fn batch_counts_dropped_documents() {
        let docs = vec![flat_proposal(), json!({"id": "x"}), nested_proposal()];
        let batch = normalize_batch("proposal", &docs, |d| proposal_from_document(d, "9-ID-B,C"));
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.dropped, 1);
    }

    #[test]
    fn run_documents_accept_both_name_keys() {
        let scheduling = json!({"runName": "2020-2", "startTime": "2020-06-09T08:00:00-05:00", "endTime": "2020-10-01T08:00:00-05:00"});
        let dm = json!({"name": "2020-3", "startTime": "2020-10-01 08:00:00", "endTime": "2020-12-22 08:00:00"});
        assert_eq!(run_from_document(&scheduling).unwrap().name, "2020-2");
        assert_eq!(run_from_document(&dm).unwrap().year(), Some(2020));
        assert_eq!(
            run_from_document(&json!({"startTime": "2020-10-01 08:00:00"})),
            Err(RecordError::MissingField("runName"))
        );
    }

    #[test]
    fn beamline_entries_need_a_name() {
        assert_eq!(beamline_from_document(&json!({"beamlineId": "9-ID-B,C"})).unwrap(), "9-ID-B,C");
        assert!(beamline_from_document(&json!({"sector": 9})).is_err());
    }
}
