/*!
 # Config entry store

 Entries created by finished flows, kept in a JSON file. The store also answers
 the "which devices are already configured" question the flow asks before it
 lists discovered devices.
*/

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::flow::{EntryData, FlowResult, DOMAIN};
use crate::{Error, Result};

/// Current storage format version
pub const STORAGE_VERSION: u32 = 1;

/// A configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier of the entry itself
    pub entry_id: String,
    /// Integration domain
    pub domain: String,
    /// Display name
    pub title: String,
    /// Normalized MAC address
    pub unique_id: String,
    /// Stored address and name
    pub data: EntryData,
    /// Flow version that created the entry
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl ConfigEntry {
    /// Builds an entry from a finished flow, `None` for forms and aborts
    pub fn from_result(result: &FlowResult) -> Option<Self> {
        match result {
            FlowResult::CreateEntry {
                title,
                unique_id,
                version,
                data,
            } => Some(Self {
                entry_id: Uuid::new_v4().simple().to_string(),
                domain: DOMAIN.to_string(),
                title: title.clone(),
                unique_id: unique_id.clone(),
                data: data.clone(),
                version: *version,
                created_at: Utc::now(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageFile {
    version: u32,
    entries: Vec<ConfigEntry>,
}

/// JSON file backed list of config entries
pub struct EntryStore {
    path: PathBuf,
    entries: RwLock<Vec<ConfigEntry>>,
}

impl EntryStore {
    /// Loads the store, starting empty if the file does not exist yet
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let file: StorageFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if file.version > STORAGE_VERSION {
                return Err(Error::Storage(format!(
                    "{} has version {}, newer than supported {}",
                    path.display(),
                    file.version,
                    STORAGE_VERSION
                )));
            }
            info!("Loaded {} config entries", file.entries.len());
            file.entries
        } else {
            debug!("No entry store yet, starting empty");
            Vec::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Unique ids of every stored entry
    pub fn current_ids(&self) -> HashSet<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.unique_id.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.entries.read().clone()
    }

    /// Adds an entry and saves; a second entry for the same device is rejected
    ///
    /// Memory is only updated once the file is written.
    #[instrument(skip_all, fields(unique_id = %entry.unique_id))]
    pub fn add(&self, entry: ConfigEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.unique_id == entry.unique_id) {
            return Err(Error::Storage(format!(
                "Entry already exists for {} with unique_id {}",
                entry.domain, entry.unique_id
            )));
        }

        info!("Adding config entry {} ({})", entry.entry_id, entry.title);
        let mut updated = entries.clone();
        updated.push(entry);
        self.write_file(&updated)?;
        *entries = updated;
        Ok(())
    }

    /// Removes an entry by id, returning it if it existed
    pub fn remove(&self, entry_id: &str) -> Result<Option<ConfigEntry>> {
        let mut entries = self.entries.write();
        let Some(index) = entries.iter().position(|e| e.entry_id == entry_id) else {
            return Ok(None);
        };

        let mut updated = entries.clone();
        let removed = updated.remove(index);
        self.write_file(&updated)?;
        *entries = updated;
        info!("Removed config entry {}", entry_id);
        Ok(Some(removed))
    }

    /// Writes the store to disk
    pub fn save(&self) -> Result<()> {
        self.write_file(&self.entries.read())
    }

    /// Writes `entries` through a temporary file
    fn write_file(&self, entries: &[ConfigEntry]) -> Result<()> {
        let file = StorageFile {
            version: STORAGE_VERSION,
            entries: entries.to_vec(),
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved {} config entries", file.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(mac: &str, name: &str) -> FlowResult {
        FlowResult::CreateEntry {
            title: name.to_string(),
            unique_id: crate::format_mac(mac),
            version: 1,
            data: EntryData {
                mac: mac.to_string(),
                name: name.to_string(),
            },
        }
    }

    #[test]
    fn test_from_result() {
        let entry = ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap();
        assert_eq!(entry.domain, "beurer");
        assert_eq!(entry.unique_id, "aa:bb:cc:dd:ee:02");
        assert_eq!(entry.data.mac, "AA:BB:CC:DD:EE:02");
        assert_eq!(entry.entry_id.len(), 32);

        let abort = FlowResult::Abort {
            reason: "cannot_connect".into(),
        };
        assert!(ConfigEntry::from_result(&abort).is_none());
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");

        let store = EntryStore::open(&path).unwrap();
        assert!(store.entries().is_empty());
        store
            .add(ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap())
            .unwrap();

        let reopened = EntryStore::open(&path).unwrap();
        assert_eq!(reopened.entries(), store.entries());
        assert!(reopened.current_ids().contains("aa:bb:cc:dd:ee:02"));
    }

    #[test]
    fn test_rejects_duplicate_unique_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.json")).unwrap();

        store
            .add(ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap())
            .unwrap();
        let err = store
            .add(ConfigEntry::from_result(&created("aa-bb-cc-dd-ee-02", "Desk 2")).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        let store = EntryStore::open(&path).unwrap();
        let entry = ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap();
        let id = entry.entry_id.clone();
        store.add(entry).unwrap();

        assert!(store.remove(&id).unwrap().is_some());
        assert!(store.remove(&id).unwrap().is_none());
        assert!(EntryStore::open(&path).unwrap().entries().is_empty());
    }

    #[test]
    fn test_failed_add_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("missing").join("entries.json")).unwrap();
        let entry = ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap();

        let err = store.add(entry.clone()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(store.entries().is_empty());
        assert!(store.current_ids().is_empty());

        // Not reported as a duplicate on the next attempt
        assert!(matches!(store.add(entry), Err(Error::Io(_))));
    }

    #[test]
    fn test_failed_remove_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir(&store_dir).unwrap();
        let store = EntryStore::open(store_dir.join("entries.json")).unwrap();
        let entry = ConfigEntry::from_result(&created("AA:BB:CC:DD:EE:02", "Desk")).unwrap();
        let id = entry.entry_id.clone();
        store.add(entry).unwrap();

        fs::remove_dir_all(&store_dir).unwrap();
        assert!(matches!(store.remove(&id), Err(Error::Io(_))));
        assert_eq!(store.entries().len(), 1);
        assert!(store.current_ids().contains("aa:bb:cc:dd:ee:02"));
    }

    #[test]
    fn test_rejects_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        fs::write(&path, r#"{"version": 9, "entries": []}"#).unwrap();

        assert!(matches!(EntryStore::open(&path), Err(Error::Storage(_))));
    }
}
