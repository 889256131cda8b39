//! State store — durable record of the last-known applied state.
//!
//! The store is an injected dependency of the planner and executor, never
//! ambient global state; tests use `MemoryStore`, real runs use `DirStore`
//! (one YAML file per resource, atomic temp-file + rename writes, per-key
//! write locking). A `RunLock` file guards the directory against
//! concurrent processes.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::StateError;
use super::types::{ResourceKey, StateRecord};

/// Point-in-time view of the store, read fully at plan time.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub records: Vec<StateRecord>,

    /// Records that exist but cannot be read. Never auto-deleted; the
    /// planner quarantines these keys.
    pub corrupt: Vec<(ResourceKey, String)>,
}

impl StateSnapshot {
    pub fn get(&self, key: &ResourceKey) -> Option<&StateRecord> {
        self.records.iter().find(|r| &r.key == key)
    }
}

/// Durable mapping of `(kind, name)` to `StateRecord`.
///
/// Read-modify-write against a single record is serialized per key;
/// distinct keys may be written concurrently.
pub trait StateStore: Send + Sync {
    fn snapshot(&self) -> Result<StateSnapshot, StateError>;
    fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError>;
    fn upsert(&self, record: StateRecord) -> Result<(), StateError>;
    fn remove(&self, key: &ResourceKey) -> Result<(), StateError>;
}

/// Recover the guard from a poisoned mutex; state mutexes only guard
/// short critical sections with no invariant that survives a panic.
pub(crate) fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store for isolated tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<IndexMap<ResourceKey, StateRecord>>,
    corrupt: Mutex<Vec<(ResourceKey, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = relock(store.records.lock());
            for record in records {
                map.insert(record.key.clone(), record);
            }
        }
        store
    }

    /// Simulate an unreadable record for quarantine tests.
    pub fn mark_corrupt(&self, key: ResourceKey, message: impl Into<String>) {
        relock(self.corrupt.lock()).push((key, message.into()));
    }

    pub fn len(&self) -> usize {
        relock(self.records.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        Ok(StateSnapshot {
            records: relock(self.records.lock()).values().cloned().collect(),
            corrupt: relock(self.corrupt.lock()).clone(),
        })
    }

    fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError> {
        Ok(relock(self.records.lock()).get(key).cloned())
    }

    fn upsert(&self, record: StateRecord) -> Result<(), StateError> {
        relock(self.records.lock()).insert(record.key.clone(), record);
        Ok(())
    }

    fn remove(&self, key: &ResourceKey) -> Result<(), StateError> {
        relock(self.records.lock()).shift_remove(key);
        Ok(())
    }
}

// ============================================================================
// Directory store
// ============================================================================

/// One YAML file per resource under a state directory:
/// `<root>/<kind>.<name>.yaml`.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    key_locks: Mutex<FxHashMap<ResourceKey, Arc<Mutex<()>>>>,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StateError::Io(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            key_locks: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &ResourceKey) -> PathBuf {
        self.root.join(format!("{}.{}.yaml", key.kind, key.name))
    }

    fn key_lock(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        let mut registry = relock(self.key_locks.lock());
        registry.entry(key.clone()).or_default().clone()
    }

    fn read_record(&self, path: &Path, key: &ResourceKey) -> Result<StateRecord, StateError> {
        let content = std::fs::read_to_string(path).map_err(|e| StateError::Corrupt {
            key: key.clone(),
            message: e.to_string(),
        })?;
        let record: StateRecord =
            serde_yaml_ng::from_str(&content).map_err(|e| StateError::Corrupt {
                key: key.clone(),
                message: e.to_string(),
            })?;
        if &record.key != key {
            return Err(StateError::Corrupt {
                key: key.clone(),
                message: format!("record claims key {}", record.key),
            });
        }
        Ok(record)
    }
}

/// Parse `<kind>.<name>.yaml` back into a key.
fn key_from_file_name(name: &str) -> Option<ResourceKey> {
    name.strip_suffix(".yaml")?.parse().ok()
}

impl StateStore for DirStore {
    fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let read_dir = std::fs::read_dir(&self.root)
            .map_err(|e| StateError::Io(format!("cannot read {}: {}", self.root.display(), e)))?;

        let mut names: Vec<String> = read_dir
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.') && n.ends_with(".yaml"))
            .collect();
        names.sort();

        let mut snapshot = StateSnapshot::default();
        for name in names {
            let Some(key) = key_from_file_name(&name) else {
                continue;
            };
            match self.read_record(&self.root.join(&name), &key) {
                Ok(record) => snapshot.records.push(record),
                Err(StateError::Corrupt { key, message }) => {
                    snapshot.corrupt.push((key, message));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(snapshot)
    }

    fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record(&path, key).map(Some)
    }

    fn upsert(&self, record: StateRecord) -> Result<(), StateError> {
        let lock = self.key_lock(&record.key);
        let _guard = relock(lock.lock());

        let path = self.record_path(&record.key);
        let yaml = serde_yaml_ng::to_string(&record)
            .map_err(|e| StateError::Io(format!("serialize {}: {}", record.key, e)))?;

        // Atomic write: temp file + rename.
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, &yaml)
            .map_err(|e| StateError::Io(format!("cannot write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            StateError::Io(format!(
                "cannot rename {} -> {}: {}",
                tmp.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn remove(&self, key: &ResourceKey) -> Result<(), StateError> {
        let lock = self.key_lock(key);
        let _guard = relock(lock.lock());

        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Io(format!("cannot remove {}: {}", key, e))),
        }
    }
}

// ============================================================================
// Cross-process run lock
// ============================================================================

/// Exclusive lock file guarding a state directory for the duration of a
/// run. Created with `O_EXCL`; contention surfaces immediately as
/// `StateError::Locked` with no retry.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Path) -> Result<Self, StateError> {
        let path = root.join(".run.lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "pid {}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                Err(StateError::Locked {
                    holder: if holder.is_empty() {
                        "unknown".to_string()
                    } else {
                        holder
                    },
                })
            }
            Err(e) => Err(StateError::Io(format!(
                "cannot create lock {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// Tests
// ============================================================================
