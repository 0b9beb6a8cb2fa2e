use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    flock::{self, FileLock},
    model::ModuleName,
};

use super::{Step, WorkKey};

pub const STATE_FILE: &str = "pib-state.toml";
const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State location {location} is not a directory")]
    BadLocation { location: PathBuf },
    #[error("State lock cannot be acquired: {0}")]
    Lock(#[from] crate::flock::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Error parsing state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Unsupported state file version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("Error writing state: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A step that succeeded for the module version identified by `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub module: ModuleName,
    pub step: Step,
    pub fingerprint: String,
}

/// Persisted completion state, keyed by `(module, step)`. Updates are atomic per key.
pub trait CompletionStore: Send + Sync {
    fn get(&self, key: &WorkKey) -> Option<String>;

    fn set(&self, key: WorkKey, fingerprint: String) -> Result<(), StoreError>;

    fn remove_module(&self, module: &ModuleName) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// All records, sorted by module and step.
    fn records(&self) -> Vec<CompletionRecord>;
}

fn sorted_records(records: &DashMap<WorkKey, String>) -> Vec<CompletionRecord> {
    let mut records: Vec<CompletionRecord> = records
        .iter()
        .map(|entry| CompletionRecord {
            module: entry.key().module.clone(),
            step: entry.key().step,
            fingerprint: entry.value().clone(),
        })
        .collect();
    records.sort();
    records
}

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<WorkKey, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompletionStore for MemoryStore {
    fn get(&self, key: &WorkKey) -> Option<String> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: WorkKey, fingerprint: String) -> Result<(), StoreError> {
        self.records.insert(key, fingerprint);
        Ok(())
    }

    fn remove_module(&self, module: &ModuleName) -> Result<(), StoreError> {
        self.records.retain(|key, _| &key.module != module);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.clear();
        Ok(())
    }

    fn records(&self) -> Vec<CompletionRecord> {
        sorted_records(&self.records)
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    records: Vec<CompletionRecord>,
}

/// Completion state in `{dir}/pib-state.toml`, rewritten on each update. The directory is
/// locked for as long as the store is alive.
pub struct FileStore {
    path: PathBuf,
    records: DashMap<WorkKey, String>,
    write: Mutex<()>,
    _lock: FileLock,
}

impl FileStore {
    pub fn open(location: &Path) -> Result<FileStore, StoreError> {
        if location.exists() {
            if !location.is_dir() {
                return Err(StoreError::BadLocation {
                    location: location.to_path_buf(),
                });
            }
        } else {
            std::fs::create_dir_all(location)?;
        }

        let lock = Self::acquire_lock(location)?;
        let path = location.join(STATE_FILE);
        let records = DashMap::new();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let state: StateFile =
                toml::from_str(&contents).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            if state.version != STATE_VERSION {
                return Err(StoreError::UnsupportedVersion {
                    path,
                    version: state.version,
                });
            }
            for record in state.records {
                records.insert(WorkKey::new(record.module, record.step), record.fingerprint);
            }
            debug!("Loaded {} completion record(s) from {}", records.len(), path.display());
        }

        Ok(FileStore {
            path,
            records,
            write: Mutex::new(()),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_lock(location: &Path) -> Result<FileLock, StoreError> {
        debug!("Acquiring a lock on the state location: {}", location.display());
        let lock = FileLock::acquire(location, flock::DEFAULT_TIMEOUT)?;
        debug!("Acquired a lock on the state location");
        Ok(lock)
    }

    /// Writes the records as they are after `change`, then applies `change` in memory. A
    /// failed write leaves both the file and the in-memory records untouched.
    fn commit<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: Fn(&DashMap<WorkKey, String>),
    {
        let _guard = self
            .write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = self.records.clone();
        change(&next);
        let state = StateFile {
            version: STATE_VERSION,
            records: sorted_records(&next),
        };
        let contents = toml::to_string(&state)?;
        let temporary = self.path.with_extension("toml.tmp");
        std::fs::write(&temporary, contents)?;
        std::fs::rename(&temporary, &self.path)?;
        change(&self.records);
        Ok(())
    }
}

impl CompletionStore for FileStore {
    fn get(&self, key: &WorkKey) -> Option<String> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: WorkKey, fingerprint: String) -> Result<(), StoreError> {
        self.commit(|records| {
            records.insert(key.clone(), fingerprint.clone());
        })
    }

    fn remove_module(&self, module: &ModuleName) -> Result<(), StoreError> {
        self.commit(|records| records.retain(|key, _| &key.module != module))
    }

    fn clear(&self) -> Result<(), StoreError> {
        info!("Clearing completion state {}", self.path.display());
        self.commit(|records| records.clear())
    }

    fn records(&self) -> Vec<CompletionRecord> {
        sorted_records(&self.records)
    }
}
