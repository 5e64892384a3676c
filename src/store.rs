//! Durable inter-phase state.
//!
//! One JSON record per phase under `<root>/state/` and one per active
//! savepoint under `<root>/savepoints/`. Every write atomically replaces the
//! previous record, so a reader sees either the old value or the new one.
//! The store has no policy of its own; the orchestrator decides what to write.

use crate::errors::PersistenceError;
use crate::phase::PipelinePhase;
use crate::schema::PhaseResult;
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where a savepoint was taken in one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSavepoint {
    pub repo: String,
    pub created_at_commit: String,
}

/// Durable metadata for one named savepoint across all repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub repos: Vec<RepoSavepoint>,
}

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn result_path(&self, phase: PipelinePhase) -> PathBuf {
        self.root
            .join("state")
            .join(format!("{}-result.json", phase.as_str()))
    }

    fn savepoint_path(&self, name: &str) -> PathBuf {
        self.root
            .join("savepoints")
            .join(format!("{}.json", name.replace('/', "__")))
    }

    /// Record `result` as the output of `phase`, replacing any prior value.
    pub fn save(&self, phase: PipelinePhase, result: &PhaseResult) -> Result<(), PersistenceError> {
        let path = self.result_path(phase);
        if result.phase() != phase {
            return Err(PersistenceError::PhaseMismatch {
                path,
                expected: phase,
                found: result.phase(),
            });
        }
        write_json(&path, result)
    }

    /// The recorded result for `phase`, or `None` if none has been saved.
    pub fn get(&self, phase: PipelinePhase) -> Result<Option<PhaseResult>, PersistenceError> {
        let path = self.result_path(phase);
        let Some(result) = read_json::<PhaseResult>(&path)? else {
            return Ok(None);
        };
        if result.phase() != phase {
            return Err(PersistenceError::PhaseMismatch {
                path,
                expected: phase,
                found: result.phase(),
            });
        }
        Ok(Some(result))
    }

    pub fn has(&self, phase: PipelinePhase) -> bool {
        self.result_path(phase).exists()
    }

    /// Remove the recorded results of `phase` and every later phase.
    pub fn clear_from(&self, phase: PipelinePhase) -> Result<(), PersistenceError> {
        for later in phase.remaining() {
            remove_if_exists(&self.result_path(*later))?;
        }
        Ok(())
    }

    pub fn save_savepoint(&self, record: &SavepointRecord) -> Result<(), PersistenceError> {
        write_json(&self.savepoint_path(&record.name), record)
    }

    pub fn get_savepoint(&self, name: &str) -> Result<Option<SavepointRecord>, PersistenceError> {
        read_json(&self.savepoint_path(name))
    }

    pub fn remove_savepoint(&self, name: &str) -> Result<(), PersistenceError> {
        remove_if_exists(&self.savepoint_path(name))
    }

    /// All savepoint records, oldest first.
    pub fn list_savepoints(&self) -> Result<Vec<SavepointRecord>, PersistenceError> {
        let dir = self.root.join("savepoints");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistenceError::Io { path: dir, source }),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(record) = read_json::<SavepointRecord>(&path)?
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &json).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, PersistenceError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| PersistenceError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
