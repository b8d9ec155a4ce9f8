//! State persistence adapters
//!
//! The engine hands a full snapshot to its store after every confirmed
//! mutation. Locking and remote backends are left to other implementations
//! of [`StateStore`].

use super::State;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Destination for state snapshots
pub trait StateStore: Send + Sync {
    /// Last written snapshot, if any
    fn read(&self) -> Result<Option<State>>;

    /// Persist a snapshot, replacing the previous one
    fn write(&self, state: &State) -> Result<()>;
}

/// Keeps every snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<Vec<State>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot written so far, oldest first
    pub fn snapshots(&self) -> Vec<State> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> Result<Option<State>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned())
    }

    fn write(&self, state: &State) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        Ok(())
    }
}

/// On-disk wrapper around a snapshot
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    serial: u64,
    written_at: DateTime<Utc>,
    state: State,
}

const ENVELOPE_VERSION: u32 = 1;

/// Pretty JSON file, replaced atomically on each write
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<Option<State>> {
        if !self.path.exists() {
            log::debug!("State file {} does not exist", self.path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let envelope: Envelope = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;

        if envelope.version > ENVELOPE_VERSION {
            anyhow::bail!(
                "State file {} has version {}, newer than supported {}",
                self.path.display(),
                envelope.version,
                ENVELOPE_VERSION
            );
        }

        log::debug!(
            "Loaded state serial {} written at {}",
            envelope.serial,
            envelope.written_at
        );
        Ok(Some(envelope.state))
    }

    fn write(&self, state: &State) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            serial: state.serial,
            written_at: Utc::now(),
            state: state.clone(),
        };
        let content =
            serde_json::to_string_pretty(&envelope).context("Failed to serialize state to JSON")?;

        let tmp = self.temp_path();
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        log::debug!("Saved state serial {} to {}", state.serial, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{ModulePath, ResourceAddress, ResourceKey};
    use crate::state::{InstanceState, ResourceState};
    use crate::value::Value;

    fn sample() -> State {
        let mut state = State::new();
        state.serial = 7;
        state.set_resource(
            &ResourceAddress::new(
                ModulePath::new(["child"]),
                ResourceKey::indexed("aws_instance", "foo", 1),
            ),
            ResourceState::new("aws_instance", InstanceState::new("i-1").with_attr("num", "2"))
                .with_dependency("aws_instance.bar")
                .with_deposed(InstanceState::new("i-0").tainted()),
        );
        state
            .ensure_module(&ModulePath::root())
            .outputs
            .insert("ips".into(), Value::list(["a", "b"]));
        state
    }

    #[test]
    fn test_file_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_file_store_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state.json"));
        let state = sample();

        store.write(&state).unwrap();
        assert!(!store.temp_path().exists());

        let loaded = store.read().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.to_string(), state.to_string());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileStateStore::new(&path).read().is_err());
    }

    #[test]
    fn test_memory_store_keeps_snapshots() {
        let store = MemoryStateStore::new();
        let mut state = State::new();
        store.write(&state).unwrap();
        state.serial = 1;
        store.write(&state).unwrap();

        assert_eq!(store.snapshots().len(), 2);
        assert_eq!(store.read().unwrap().unwrap().serial, 1);
    }
}
