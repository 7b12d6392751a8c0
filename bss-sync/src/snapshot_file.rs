//! File-backed broadcast: the published table as a JSON document.
//!
//! Persists a [`PublishedFile`] at `<home>/.apsbss/published/<name>.json`.
//! Writes use the same atomic `.tmp` + rename pattern as the configuration.
//! `publish_many` is one read-modify-write, so a cycle costs one file write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bss_core::PublishError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::Broadcast;
use crate::error::{io_err, SyncError};

/// On-disk payload: handle → value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedFile {
    pub updated_at: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
}

/// `<home>/.apsbss/published/<name>.json`
pub fn published_path_at(home: &Path, name: &str) -> PathBuf {
    home.join(".apsbss")
        .join("published")
        .join(format!("{name}.json"))
}

/// Load the published table for `name`. Empty if nothing was published yet.
pub fn load_at(home: &Path, name: &str) -> Result<PublishedFile, SyncError> {
    load_path(&published_path_at(home, name))
}

fn load_path(path: &Path) -> Result<PublishedFile, SyncError> {
    if !path.exists() {
        return Ok(PublishedFile {
            updated_at: Utc::now(),
            fields: BTreeMap::new(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_path(path: &Path, file: &PublishedFile) -> Result<(), SyncError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid published file path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// A [`Broadcast`] that keeps the table in memory and mirrors it to disk
/// after every write batch.
#[derive(Debug)]
pub struct SnapshotFileBroadcast {
    path: PathBuf,
    fields: BTreeMap<String, String>,
}

impl SnapshotFileBroadcast {
    /// Opens (or starts) the table for `name`, keeping any previously
    /// published values.
    pub fn open_at(home: &Path, name: &str) -> Result<Self, SyncError> {
        let path = published_path_at(home, name);
        let existing = load_path(&path)?;
        Ok(Self { path, fields: existing.fields })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    fn flush(&self) -> Result<(), PublishError> {
        let file = PublishedFile {
            updated_at: Utc::now(),
            fields: self.fields.clone(),
        };
        save_path(&self.path, &file).map_err(|e| PublishError::Unreachable(e.to_string()))
    }
}

impl Broadcast for SnapshotFileBroadcast {
    fn publish(&mut self, handle: &str, value: &str) -> Result<(), PublishError> {
        let previous = self.fields.insert(handle.to_owned(), value.to_owned());
        let result = self.flush();
        if result.is_err() {
            match previous {
                Some(old) => self.fields.insert(handle.to_owned(), old),
                None => self.fields.remove(handle),
            };
        }
        result
    }

    fn publish_many(&mut self, writes: &[(String, String)]) -> Vec<Result<(), PublishError>> {
        let before = self.fields.clone();
        for (handle, value) in writes {
            self.fields.insert(handle.clone(), value.clone());
        }
        match self.flush() {
            Ok(()) => writes.iter().map(|_| Ok(())).collect(),
            Err(e) => {
                self.fields = before;
                writes.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }

    fn current(&self) -> BTreeMap<String, String> {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(h, v)| (h.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_table_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let file = load_at(tmp.path(), "09").unwrap();
        assert!(file.fields.is_empty());
    }

    #[test]
    fn publish_many_persists_in_one_write() {
        let tmp = TempDir::new().unwrap();
        let mut b = SnapshotFileBroadcast::open_at(tmp.path(), "09").unwrap();
        let results = b.publish_many(&pairs(&[("09:bss:esaf:id", "226319"), ("09:bss:status", "ok")]));
        assert!(results.iter().all(Result::is_ok));

        let loaded = load_at(tmp.path(), "09").unwrap();
        assert_eq!(loaded.fields["09:bss:esaf:id"], "226319");
        assert_eq!(loaded.fields["09:bss:status"], "ok");
        let tmp_path = published_path_at(tmp.path(), "09").with_extension("json.tmp");
        assert!(!tmp_path.exists(), "tmp file should be removed after atomic rename");
    }

    #[test]
    fn reopen_keeps_previous_values() {
        let tmp = TempDir::new().unwrap();
        let mut b = SnapshotFileBroadcast::open_at(tmp.path(), "09").unwrap();
        b.publish("09:bss:esaf:title", "Commission").unwrap();
        drop(b);
        let mut b = SnapshotFileBroadcast::open_at(tmp.path(), "09").unwrap();
        assert_eq!(b.current()["09:bss:esaf:title"], "Commission");
        b.publish("09:bss:status", "ok").unwrap();
        assert_eq!(b.fields().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_directory_is_unreachable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let mut b = SnapshotFileBroadcast::open_at(tmp.path(), "09").unwrap();
        b.publish("09:bss:status", "ok").unwrap();
        let dir = b.path().parent().unwrap().to_path_buf();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        // root ignores directory permissions
        let marker = dir.join("writable");
        if std::fs::write(&marker, b"x").is_ok() {
            std::fs::remove_file(&marker).unwrap();
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
            return;
        }
        let results = b.publish_many(&pairs(&[("09:bss:status", "stale")]));
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(results[0], Err(PublishError::Unreachable(_))));
        assert_eq!(b.fields()["09:bss:status"], "ok");
    }
}
