//! Registers persistable objects under unique names, saves/loads them all at
//! once into timestamped state directories, and sweeps old ones on a rolling
//! retention policy.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use pamiq_threads::ReadOnlyController;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state name '{0}' is already registered")]
    DuplicateName(String),
    #[error("state directory '{0}' already exists")]
    AlreadyExists(PathBuf),
    #[error("state path '{0}' not found")]
    NotFound(PathBuf),
    #[error("io error reading/writing state: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// A capability, not a requirement: implementors that have nothing to
/// persist simply keep the default no-op bodies so aggregates compose
/// without every leaf needing to opt in.
pub trait PersistentState: Send {
    fn save_state(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
    fn load_state(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes `obj` to `path` with bincode, mirroring the original
/// `save_pickle` helper for the (far more common in Rust) case where a
/// concrete [`PersistentState`] just wants to dump a serializable value.
pub fn save_bincode<T: Serialize>(obj: &T, path: &Path) -> io::Result<()> {
    let bytes = bincode::serialize(obj).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, bytes)
}

pub fn load_bincode<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let bytes = std::fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Saves/loads every registered [`PersistentState`] at once, into/from a
/// directory named after the moment `save_state` was called.
pub struct StateStore {
    states_dir: PathBuf,
    registered: Vec<(String, Arc<Mutex<dyn PersistentState>>)>,
}

impl StateStore {
    pub fn new(states_dir: impl Into<PathBuf>) -> Result<Self> {
        let states_dir = states_dir.into();
        std::fs::create_dir_all(&states_dir)?;
        Ok(Self {
            states_dir,
            registered: Vec::new(),
        })
    }

    pub fn register(&mut self, name: impl Into<String>, state: Arc<Mutex<dyn PersistentState>>) -> Result<()> {
        let name = name.into();
        if self.registered.iter().any(|(n, _)| n == &name) {
            return Err(StateError::DuplicateName(name));
        }
        self.registered.push((name, state));
        Ok(())
    }

    /// Mints `states_dir/<micros-since-epoch>.state/`, then saves every
    /// registered object into a same-named subdirectory.
    #[tracing::instrument(skip(self))]
    pub fn save_state(&self) -> Result<PathBuf> {
        let state_path = self.states_dir.join(Self::mint_state_name());
        std::fs::create_dir(&state_path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StateError::AlreadyExists(state_path.clone())
            } else {
                StateError::Io(e)
            }
        })?;
        for (name, state) in &self.registered {
            let entry_path = state_path.join(name);
            std::fs::create_dir_all(&entry_path)?;
            state.lock().save_state(&entry_path)?;
        }
        Ok(state_path)
    }

    /// Requires `path` to exist; loads every registered object from its
    /// same-named subdirectory.
    #[tracing::instrument(skip(self))]
    pub fn load_state(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(StateError::NotFound(path.to_path_buf()));
        }
        for (name, state) in &self.registered {
            state.lock().load_state(&path.join(name))?;
        }
        Ok(())
    }

    fn mint_state_name() -> String {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        format!("{micros:020}.state")
    }
}

/// Scans `states_dir` for `*.state` directories every 100ms, keeping only
/// the `max_keep` most recently modified and deleting the rest. Stops
/// sweeping once the shared controller shuts down.
pub struct RetentionKeeper {
    states_dir: PathBuf,
    max_keep: usize,
    controller: ReadOnlyController,
}

impl RetentionKeeper {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(states_dir: impl Into<PathBuf>, max_keep: usize, controller: ReadOnlyController) -> Self {
        Self {
            states_dir: states_dir.into(),
            max_keep,
            controller,
        }
    }

    /// One scan-and-delete pass. Exposed separately from `run` so callers
    /// can drive it deterministically in tests.
    #[tracing::instrument(skip(self))]
    pub fn sweep(&self) -> Result<()> {
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        let read_dir = match std::fs::read_dir(&self.states_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StateError::Io(e)),
        };
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("state") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            entries.push((path, modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in entries.into_iter().skip(self.max_keep) {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Polls every 100ms until the controller shuts down.
    pub fn run(&self) {
        while !self.controller.is_shutdown() {
            if let Err(error) = self.sweep() {
                tracing::warn!(%error, "retention sweep failed");
            }
            std::thread::sleep(Self::POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pamiq_threads::ThreadController;

    struct Counter {
        saved: Option<i32>,
        loaded: Option<i32>,
        value: i32,
    }

    impl PersistentState for Counter {
        fn save_state(&mut self, path: &Path) -> io::Result<()> {
            save_bincode(&self.value, &path.join("value.bin"))?;
            self.saved = Some(self.value);
            Ok(())
        }
        fn load_state(&mut self, path: &Path) -> io::Result<()> {
            self.value = load_bincode(&path.join("value.bin"))?;
            self.loaded = Some(self.value);
            Ok(())
        }
    }

    #[test]
    fn save_then_load_round_trips_registered_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("states")).unwrap();
        let counter = Arc::new(Mutex::new(Counter {
            saved: None,
            loaded: None,
            value: 42,
        }));
        store.register("counter", counter.clone()).unwrap();

        let saved_path = store.save_state().unwrap();
        assert_eq!(counter.lock().saved, Some(42));

        counter.lock().value = 0;
        store.load_state(&saved_path).unwrap();
        assert_eq!(counter.lock().value, 42);
        assert_eq!(counter.lock().loaded, Some(42));
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("states")).unwrap();
        let counter = Arc::new(Mutex::new(Counter {
            saved: None,
            loaded: None,
            value: 1,
        }));
        store.register("counter", counter.clone()).unwrap();
        assert!(matches!(
            store.register("counter", counter),
            Err(StateError::DuplicateName(_))
        ));
    }

    #[test]
    fn load_state_requires_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("states")).unwrap();
        assert!(matches!(
            store.load_state(&dir.path().join("missing")),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn retention_keeper_deletes_all_but_the_newest_max_keep() {
        let dir = tempfile::tempdir().unwrap();
        let states_dir = dir.path().join("states");
        std::fs::create_dir_all(&states_dir).unwrap();
        for i in 0..5 {
            let p = states_dir.join(format!("{i:020}.state"));
            std::fs::create_dir(&p).unwrap();
            // Force distinct mtimes regardless of filesystem timestamp
            // resolution.
            std::thread::sleep(Duration::from_millis(5));
            std::fs::File::create(p.join("touch")).unwrap();
        }
        let controller = ThreadController::new();
        let keeper = RetentionKeeper::new(&states_dir, 2, controller.read_only());
        keeper.sweep().unwrap();

        let remaining: Vec<_> = std::fs::read_dir(&states_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn retention_keeper_with_max_keep_zero_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let states_dir = dir.path().join("states");
        std::fs::create_dir_all(&states_dir).unwrap();
        std::fs::create_dir(states_dir.join("00000000000000000001.state")).unwrap();

        let controller = ThreadController::new();
        let keeper = RetentionKeeper::new(&states_dir, 0, controller.read_only());
        keeper.sweep().unwrap();

        assert_eq!(std::fs::read_dir(&states_dir).unwrap().count(), 0);
    }
}
