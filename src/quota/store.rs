use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Lifetime of a stored quota key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Survives restarts (monthly counter, month tag)
    Persistent,
    /// Lives as long as the running process (session-initialized flag)
    Session,
}

/// String key/value storage behind the quota governor
pub trait QuotaStore {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, scope: Scope, key: &str) -> Result<(), StoreError>;

    /// Write several keys in order. Stores that can should persist them together.
    fn set_many(&mut self, scope: Scope, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(scope, key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryQuotaStore {
    persistent: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, scope: Scope) -> &BTreeMap<String, String> {
        match scope {
            Scope::Persistent => &self.persistent,
            Scope::Session => &self.session,
        }
    }

    fn map_mut(&mut self, scope: Scope) -> &mut BTreeMap<String, String> {
        match scope {
            Scope::Persistent => &mut self.persistent,
            Scope::Session => &mut self.session,
        }
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map(scope).get(key).cloned())
    }

    fn set(&mut self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError> {
        self.map_mut(scope).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, scope: Scope, key: &str) -> Result<(), StoreError> {
        self.map_mut(scope).remove(key);
        Ok(())
    }
}

/// Persistent keys in a JSON file, session keys in memory
#[derive(Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
    persistent: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
}

impl FileQuotaStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let persistent = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            persistent,
            session: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.persistent)
            .map_err(|source| StoreError::Corrupt { path: self.path.clone(), source })?;
        fs::write(&self.path, bytes).map_err(io_err)
    }
}

impl QuotaStore for FileQuotaStore {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
        let map = match scope {
            Scope::Persistent => &self.persistent,
            Scope::Session => &self.session,
        };
        Ok(map.get(key).cloned())
    }

    fn set(&mut self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError> {
        match scope {
            Scope::Persistent => {
                self.persistent.insert(key.to_string(), value.to_string());
                self.flush()
            }
            Scope::Session => {
                self.session.insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    fn set_many(&mut self, scope: Scope, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let map = match scope {
            Scope::Persistent => &mut self.persistent,
            Scope::Session => &mut self.session,
        };
        for (key, value) in entries {
            map.insert(key.to_string(), value.to_string());
        }
        match scope {
            Scope::Persistent => self.flush(),
            Scope::Session => Ok(()),
        }
    }

    fn remove(&mut self, scope: Scope, key: &str) -> Result<(), StoreError> {
        match scope {
            Scope::Persistent => {
                if self.persistent.remove(key).is_some() {
                    self.flush()?;
                }
                Ok(())
            }
            Scope::Session => {
                self.session.remove(key);
                Ok(())
            }
        }
    }
}
