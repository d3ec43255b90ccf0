use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::Assignment;
use crate::error::StoreError;

/// Durable assignment records keyed by source id (one record per source)
pub trait AssignmentStore {
    fn get(&self, source_id: &str) -> Result<Option<Assignment>, StoreError>;
    fn list(&self) -> Result<Vec<Assignment>, StoreError>;
    /// Insert or replace the record for `assignment.source_id`
    fn upsert(&mut self, assignment: Assignment) -> Result<(), StoreError>;
    fn remove(&mut self, source_id: &str) -> Result<bool, StoreError>;

    fn upsert_many(&mut self, assignments: Vec<Assignment>) -> Result<(), StoreError> {
        for assignment in assignments {
            self.upsert(assignment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAssignmentStore {
    records: BTreeMap<String, Assignment>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn get(&self, source_id: &str) -> Result<Option<Assignment>, StoreError> {
        Ok(self.records.get(source_id).cloned())
    }

    fn list(&self) -> Result<Vec<Assignment>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn upsert(&mut self, assignment: Assignment) -> Result<(), StoreError> {
        self.records.insert(assignment.source_id.clone(), assignment);
        Ok(())
    }

    fn remove(&mut self, source_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(source_id).is_some())
    }
}

/// JSON file holding every record; rewritten in full after each mutation
#[derive(Debug)]
pub struct JsonFileAssignmentStore {
    path: PathBuf,
    records: BTreeMap<String, Assignment>,
}

impl JsonFileAssignmentStore {
    /// Open the store, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<Assignment> = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;
                list.into_iter().map(|a| (a.source_id.clone(), a)).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(path = %path.display(), records = records.len(), "opened assignment store");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let list: Vec<&Assignment> = self.records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|source| StoreError::Corrupt { path: self.path.clone(), source })?;
        fs::write(&self.path, bytes).map_err(io_err)
    }
}

impl AssignmentStore for JsonFileAssignmentStore {
    fn get(&self, source_id: &str) -> Result<Option<Assignment>, StoreError> {
        Ok(self.records.get(source_id).cloned())
    }

    fn list(&self) -> Result<Vec<Assignment>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn upsert(&mut self, assignment: Assignment) -> Result<(), StoreError> {
        self.records.insert(assignment.source_id.clone(), assignment);
        self.flush()
    }

    fn remove(&mut self, source_id: &str) -> Result<bool, StoreError> {
        let removed = self.records.remove(source_id).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    fn upsert_many(&mut self, assignments: Vec<Assignment>) -> Result<(), StoreError> {
        if assignments.is_empty() {
            return Ok(());
        }
        for assignment in assignments {
            self.records.insert(assignment.source_id.clone(), assignment);
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(source: &str, target: &str, distance: f64) -> Assignment {
        Assignment {
            source_id: source.to_string(),
            target_id: target.to_string(),
            distance,
        }
    }

    #[test]
    fn test_upsert_replaces_existing_record() {
        let mut store = InMemoryAssignmentStore::new();
        store.upsert(record("h1", "s1", 1.0)).unwrap();
        store.upsert(record("h1", "s2", 0.5)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("h1").unwrap(), Some(record("h1", "s2", 0.5)));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("assignments.json");

        let mut store = JsonFileAssignmentStore::open(&path).unwrap();
        store
            .upsert_many(vec![record("h1", "s1", 1.25), record("h2", "s1", 0.5)])
            .unwrap();
        assert!(store.remove("h2").unwrap());

        let reopened = JsonFileAssignmentStore::open(&path).unwrap();
        assert_eq!(reopened.list().unwrap(), vec![record("h1", "s1", 1.25)]);
    }

    #[test]
    fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonFileAssignmentStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
