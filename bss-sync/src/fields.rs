//! The published field table.
//!
//! Keys are dotted (`esaf.title`, `proposal.user3.email`, `status_msg`).
//! Each key maps to an external handle under the configured prefix, with
//! colons for dots and the camel-case suffixes the beamline databases use
//! (`proposal.user5.pi_flag` → `<prefix>proposal:user5:piFlag`).
//!
//! The key set is fixed: it does not depend on what was fetched.

use std::collections::BTreeMap;

use bss_core::MAX_USERS;

/// The one field not derived from a record.
pub const STATUS_KEY: &str = "status_msg";
const STATUS_SUFFIX: &str = "status";

/// Which record a field is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Esaf,
    Proposal,
}

impl RecordKind {
    pub fn key_prefix(self) -> &'static str {
        match self {
            RecordKind::Esaf => "esaf",
            RecordKind::Proposal => "proposal",
        }
    }

    /// `(attribute, handle suffix)` for record-level fields.
    pub fn attributes(self) -> &'static [(&'static str, &'static str)] {
        match self {
            RecordKind::Esaf => ESAF_FIELDS,
            RecordKind::Proposal => PROPOSAL_FIELDS,
        }
    }

    /// `(attribute, handle suffix)` for each user slot.
    pub fn user_attributes(self) -> &'static [(&'static str, &'static str)] {
        match self {
            RecordKind::Esaf => ESAF_USER_FIELDS,
            RecordKind::Proposal => PROPOSAL_USER_FIELDS,
        }
    }
}

const ESAF_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("title", "title"),
    ("description", "description"),
    ("run", "run"),
    ("sector", "sector"),
    ("status", "status"),
    ("start_date", "startDate"),
    ("end_date", "endDate"),
    ("number_users_in_pvs", "users_in_pvs"),
    ("number_users_total", "users_total"),
    ("user_badges", "userBadges"),
    ("user_last_names", "users"),
    ("raw", "raw"),
];

const ESAF_USER_FIELDS: &[(&str, &str)] = &[
    ("badge_number", "badgeNumber"),
    ("email", "email"),
    ("first_name", "firstName"),
    ("last_name", "lastName"),
];

const PROPOSAL_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("title", "title"),
    ("beamline_name", "beamline"),
    ("start_date", "startDate"),
    ("end_date", "endDate"),
    ("submitted_date", "submittedDate"),
    ("mail_in_flag", "mailInFlag"),
    ("proprietary_flag", "proprietaryFlag"),
    ("number_users_in_pvs", "users_in_pvs"),
    ("number_users_total", "users_total"),
    ("user_badges", "userBadges"),
    ("user_last_names", "users"),
    ("raw", "raw"),
];

const PROPOSAL_USER_FIELDS: &[(&str, &str)] = &[
    ("badge_number", "badgeNumber"),
    ("email", "email"),
    ("first_name", "firstName"),
    ("last_name", "lastName"),
    ("institution", "institution"),
    ("institution_id", "instId"),
    ("user_id", "userId"),
    ("pi_flag", "piFlag"),
];

/// `esaf.title`
pub fn record_key(kind: RecordKind, attribute: &str) -> String {
    format!("{}.{attribute}", kind.key_prefix())
}

/// `esaf.user3.email`, with `slot` counted from 1.
pub fn user_key(kind: RecordKind, slot: usize, attribute: &str) -> String {
    format!("{}.user{slot}.{attribute}", kind.key_prefix())
}

/// Every `(key, handle suffix)` derived from one record kind, in table order.
fn record_fields(kind: RecordKind) -> Vec<(String, String)> {
    let prefix = kind.key_prefix();
    let mut fields: Vec<(String, String)> = kind
        .attributes()
        .iter()
        .map(|(attr, suffix)| (record_key(kind, attr), format!("{prefix}:{suffix}")))
        .collect();
    for slot in 1..=MAX_USERS {
        for (attr, suffix) in kind.user_attributes() {
            fields.push((
                user_key(kind, slot, attr),
                format!("{prefix}:user{slot}:{suffix}"),
            ));
        }
    }
    fields
}

/// All published keys: ESAF fields, proposal fields, then `status_msg`.
pub fn all_keys() -> Vec<String> {
    let mut keys: Vec<String> = [RecordKind::Esaf, RecordKind::Proposal]
        .into_iter()
        .flat_map(record_fields)
        .map(|(key, _)| key)
        .collect();
    keys.push(STATUS_KEY.to_owned());
    keys
}

/// Key → external handle, for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTable {
    prefix: String,
    handles: BTreeMap<String, String>,
}

impl FieldTable {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let mut handles: BTreeMap<String, String> = [RecordKind::Esaf, RecordKind::Proposal]
            .into_iter()
            .flat_map(record_fields)
            .map(|(key, suffix)| (key, format!("{prefix}{suffix}")))
            .collect();
        handles.insert(STATUS_KEY.to_owned(), format!("{prefix}{STATUS_SUFFIX}"));
        Self { prefix, handles }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn handle(&self, key: &str) -> Option<&str> {
        self.handles.get(key).map(String::as_str)
    }

    /// `(key, handle)` pairs, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handles.iter().map(|(k, h)| (k.as_str(), h.as_str()))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
