//! Backing stores for the run ledger.
//!
//! The store contract is transactional: every `commit_*` call must leave the
//! record durable before it returns, and a failed commit must surface as an
//! error. The JSON store writes through a temporary file and renames into
//! place so a crash cannot leave a half-written record; a mutex serializes
//! writers, which is how concurrent pipeline invocations may safely share
//! one store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use super::{GroupId, RunGroup, RunId, RunRecord};
use crate::error::LedgerError;

/// Persistence contract for run groups and run records.
///
/// Each call is one committed transaction.
pub trait LedgerStore: Send + Sync {
    /// Commits the current state of a run group.
    fn commit_group(&self, group: &RunGroup) -> Result<(), LedgerError>;

    /// Commits the current state of a run record.
    fn commit_run(&self, record: &RunRecord) -> Result<(), LedgerError>;

    /// Loads a run group by id.
    fn load_group(&self, id: GroupId) -> Result<Option<RunGroup>, LedgerError>;

    /// Loads a run record by id.
    fn load_run(&self, id: RunId) -> Result<Option<RunRecord>, LedgerError>;
}

/// File-backed store: one JSON document per group or run.
///
/// # Layout
///
/// ```text
/// {root}/
/// ├── groups/{group-uuid}.json
/// └── runs/{run-uuid}.json
/// ```
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Opens (and creates if needed) a store rooted at the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Commit`] if the directory layout cannot be
    /// created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let root = root.into();
        for dir in [root.join("groups"), root.join("runs")] {
            fs::create_dir_all(&dir).map_err(|e| LedgerError::Commit {
                context: format!("ledger directory {}", dir.display()),
                source: e,
            })?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn group_path(&self, id: GroupId) -> PathBuf {
        self.root.join("groups").join(format!("{id}.json"))
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.root.join("runs").join(format!("{id}.json"))
    }

    /// Serializes `value` and renames it into place atomically.
    fn save<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(value).map_err(|e| LedgerError::Commit {
            context: format!("serialize {}", path.display()),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let _guard = self.write_lock.lock().map_err(|_| LedgerError::Corrupt {
            reason: "ledger write lock poisoned".to_string(),
        })?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| LedgerError::Commit {
            context: format!("create {}", temp_path.display()),
            source: e,
        })?;
        file.write_all(json.as_bytes())
            .map_err(|e| LedgerError::Commit {
                context: format!("write {}", temp_path.display()),
                source: e,
            })?;
        file.sync_all().map_err(|e| LedgerError::Commit {
            context: format!("sync {}", temp_path.display()),
            source: e,
        })?;
        fs::rename(&temp_path, path).map_err(|e| LedgerError::Commit {
            context: format!("rename {} to {}", temp_path.display(), path.display()),
            source: e,
        })
    }

    fn load<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, LedgerError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| LedgerError::Commit {
            context: format!("read {}", path.display()),
            source: e,
        })?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LedgerError::Corrupt {
                reason: format!("failed to parse {}: {}", path.display(), e),
            })
    }
}

impl LedgerStore for JsonStore {
    fn commit_group(&self, group: &RunGroup) -> Result<(), LedgerError> {
        self.save(&self.group_path(group.id), group)
    }

    fn commit_run(&self, record: &RunRecord) -> Result<(), LedgerError> {
        self.save(&self.run_path(record.id), record)
    }

    fn load_group(&self, id: GroupId) -> Result<Option<RunGroup>, LedgerError> {
        self.load(&self.group_path(id))
    }

    fn load_run(&self, id: RunId) -> Result<Option<RunRecord>, LedgerError> {
        self.load(&self.run_path(id))
    }
}

/// In-memory store for unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: Mutex<BTreeMap<Uuid, RunGroup>>,
    runs: Mutex<BTreeMap<Uuid, RunRecord>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn commit_group(&self, group: &RunGroup) -> Result<(), LedgerError> {
        let mut groups = self.groups.lock().map_err(|_| LedgerError::Corrupt {
            reason: "group table lock poisoned".to_string(),
        })?;
        groups.insert(group.id, group.clone());
        Ok(())
    }

    fn commit_run(&self, record: &RunRecord) -> Result<(), LedgerError> {
        let mut runs = self.runs.lock().map_err(|_| LedgerError::Corrupt {
            reason: "run table lock poisoned".to_string(),
        })?;
        runs.insert(record.id, record.clone());
        Ok(())
    }

    fn load_group(&self, id: GroupId) -> Result<Option<RunGroup>, LedgerError> {
        let groups = self.groups.lock().map_err(|_| LedgerError::Corrupt {
            reason: "group table lock poisoned".to_string(),
        })?;
        Ok(groups.get(&id).cloned())
    }

    fn load_run(&self, id: RunId) -> Result<Option<RunRecord>, LedgerError> {
        let runs = self.runs.lock().map_err(|_| LedgerError::Corrupt {
            reason: "run table lock poisoned".to_string(),
        })?;
        Ok(runs.get(&id).cloned())
    }
}
