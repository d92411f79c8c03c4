//! Last known (state, run) pair per run id, so an interrupted run can pick up
//! where it stopped instead of regenerating.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::state_machine::{RunId, RunState, State};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub state: State,
    pub run: RunState,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: State, run: &RunState) -> Self {
        Self {
            run_id: run.run_id.clone(),
            state,
            run: run.clone(),
            updated_at: Utc::now(),
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, run_id: &RunId) -> Result<Option<Checkpoint>, PersistenceError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;
    /// Remove the checkpoint of a run. Clearing a missing one is not an error.
    fn clear(&self, run_id: &RunId) -> Result<(), PersistenceError>;
}

/// One JSON file per run under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes temp-file writes for the same run id.
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id.as_str()))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, run_id: &RunId) -> Result<Option<Checkpoint>, PersistenceError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|_| PersistenceError::Corrupt { path, line: 1 })
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock();
        let path = self.path_for(&checkpoint.run_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn clear(&self, run_id: &RunId) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock();
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<RunId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, run_id: &RunId) -> Result<Option<Checkpoint>, PersistenceError> {
        Ok(self.checkpoints.lock().get(run_id).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.checkpoints
            .lock()
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn clear(&self, run_id: &RunId) -> Result<(), PersistenceError> {
        self.checkpoints.lock().remove(run_id);
        Ok(())
    }
}
