//! Durable snapshot of stateful zones.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ZoneId;
use crate::zone::ZoneSnapshot;

/// One top-level zone in a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub zone_id: ZoneId,
    pub zone: ZoneSnapshot,
}

/// Load/save of the stateful-zone snapshot.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<ArchiveEntry>>>;
    fn save(&self, entries: &[ArchiveEntry]) -> Result<()>;
}

/// Pretty JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<Vec<ArchiveEntry>>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(&self.path, err)),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, entries: &[ArchiveEntry]) -> Result<()> {
        let text = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|err| Error::io(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| Error::io(&self.path, err))
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Option<Vec<ArchiveEntry>>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ArchiveEntry>) -> Self {
        Self {
            entries: Mutex::new(Some(entries)),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().expect("store mutex poisoned")
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<ArchiveEntry>>> {
        Ok(self.entries.lock().expect("store mutex poisoned").clone())
    }

    fn save(&self, entries: &[ArchiveEntry]) -> Result<()> {
        *self.entries.lock().expect("store mutex poisoned") = Some(entries.to_vec());
        *self.saves.lock().expect("store mutex poisoned") += 1;
        Ok(())
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<Vec<ArchiveEntry>>> {
        (**self).load()
    }

    fn save(&self, entries: &[ArchiveEntry]) -> Result<()> {
        (**self).save(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZonePhase;

    fn entry(zone_id: ZoneId) -> ArchiveEntry {
        ArchiveEntry {
            zone_id,
            zone: ZoneSnapshot {
                phase: ZonePhase::Loading,
                zone_items: Vec::new(),
                subzones: Vec::new(),
                door_opened: true,
                zone_type: Some(2),
                zone_name: "Archive".into(),
            },
        }
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("archive.json"));
        assert!(store.load().expect("load empty").is_none());
        store.save(&[entry(4)]).expect("save");
        let loaded = store.load().expect("load").expect("snapshot present");
        assert_eq!(loaded, vec![entry(4)]);
    }

    #[test]
    fn file_store_reports_corrupt_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("archive.json");
        fs::write(&path, "{not json").expect("write");
        let err = JsonFileStore::new(&path).load().expect_err("corrupt");
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn file_store_write_failure_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("missing").join("archive.json"));
        let err = store.save(&[entry(1)]).expect_err("no parent dir");
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        assert!(store.load().expect("load").is_none());
        store.save(&[entry(1), entry(2)]).expect("save");
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().expect("load").map(|e| e.len()), Some(2));
    }
}
