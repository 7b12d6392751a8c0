//! The flat key → value table mirrored into the broadcast layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fields::{all_keys, FieldTable, STATUS_KEY};
use crate::status::Status;

/// Every published key with its current value. Absent data is `""`, never a
/// missing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    fields: BTreeMap<String, String>,
}

impl Snapshot {
    /// The full key set with every value empty.
    pub fn blank() -> Self {
        Self {
            fields: all_keys().into_iter().map(|k| (k, String::new())).collect(),
        }
    }

    /// Sets an existing key. Unknown keys are ignored so the key set cannot grow.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        if let Some(slot) = self.fields.get_mut(key) {
            *slot = value.into();
        }
    }

    /// Rebuilds what a broadcast layer already shows, from its handle → value
    /// table. `None` unless something was published there: a record field
    /// with a value, or a status other than `error`.
    pub fn from_handles(table: &FieldTable, values: &BTreeMap<String, String>) -> Option<Self> {
        let mut snapshot = Self::blank();
        let mut published = false;
        for (key, handle) in table.iter() {
            let Some(value) = values.get(handle) else { continue };
            snapshot.set(key, value.as_str());
            published |= if key == STATUS_KEY {
                !value.is_empty() && value != Status::Error.as_str()
            } else {
                !value.is_empty()
            };
        }
        published.then_some(snapshot)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn status(&self) -> &str {
        self.get(STATUS_KEY).unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keys whose value differs from `previous`, with the new value.
    /// Against `None` every key is a change.
    pub fn diff(&self, previous: Option<&Snapshot>) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter(|(key, value)| {
                previous
                    .and_then(|p| p.fields.get(key.as_str()))
                    .map_or(true, |old| old != *value)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::blank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_has_every_key_empty() {
        let snap = Snapshot::blank();
        assert_eq!(snap.len(), all_keys().len());
        assert!(snap.iter().all(|(_, v)| v.is_empty()));
        assert_eq!(snap.status(), "");
    }

    #[test]
    fn diff_against_none_is_everything() {
        let snap = Snapshot::blank();
        assert_eq!(snap.diff(None).len(), snap.len());
    }

    #[test]
    fn diff_reports_only_changes() {
        let before = Snapshot::blank();
        let mut after = before.clone();
        after.set("esaf.title", "Commission 9ID and USAXS");
        after.set(STATUS_KEY, "ok");
        let changes = after.diff(Some(&before));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["esaf.title"], "Commission 9ID and USAXS");
        assert!(after.diff(Some(&after)).is_empty());
    }

    fn handles(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(h, v)| (h.to_string(), v.to_string())).collect()
    }

    #[test]
    fn from_handles_maps_back_to_keys() {
        let table = FieldTable::new("9id:bss:");
        let values = handles(&[
            ("9id:bss:esaf:id", "226319"),
            ("9id:bss:esaf:user2:lastName", "Kuzmenko"),
            ("9id:bss:status", "ok"),
            ("other:ioc:status", "ignored"),
        ]);
        let snap = Snapshot::from_handles(&table, &values).expect("published");
        assert_eq!(snap.get("esaf.id"), Some("226319"));
        assert_eq!(snap.get("esaf.user2.last_name"), Some("Kuzmenko"));
        assert_eq!(snap.status(), "ok");
        assert_eq!(snap.get("proposal.title"), Some(""));
        assert_eq!(snap.len(), all_keys().len());
    }

    #[test]
    fn from_handles_ignores_empty_and_error_tables() {
        let table = FieldTable::new("9id:bss:");
        assert!(Snapshot::from_handles(&table, &BTreeMap::new()).is_none());
        let error_only = handles(&[("9id:bss:esaf:id", ""), ("9id:bss:status", "error")]);
        assert!(Snapshot::from_handles(&table, &error_only).is_none());
        let idle = handles(&[("9id:bss:esaf:id", ""), ("9id:bss:status", "ok")]);
        assert!(Snapshot::from_handles(&table, &idle).is_some());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut snap = Snapshot::blank();
        snap.set("esaf.user10.email", "x");
        assert!(snap.get("esaf.user10.email").is_none());
    }
}
