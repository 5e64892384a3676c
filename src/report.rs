//! Outcome of one orchestrator run.
//!
//! A report names every phase's final status and, for a halted run, the
//! exact phase and rule or failure kind that stopped it. Rollbacks are
//! always listed. Reports are written to `runs/<timestamp>_<run>.json`.

use crate::errors::{GateError, PersistenceError, RunnerFailure};
use crate::orchestrator::state::PhaseStatus;
use crate::phase::PipelinePhase;
use crate::store::write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Why a run stopped before completing Validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum HaltReason {
    Runner {
        phase: PipelinePhase,
        failure: RunnerFailure,
    },
    Gate {
        error: GateError,
    },
}

impl HaltReason {
    pub fn phase(&self) -> PipelinePhase {
        match self {
            HaltReason::Runner { phase, .. } => *phase,
            HaltReason::Gate { error } => error.phase,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Runner { phase, failure } => {
                write!(f, "{} runner failure ({}): {}", phase, failure.kind, failure.detail)
            }
            HaltReason::Gate { error } => write!(f, "{}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Halted {
        halt: HaltReason,
    },
    /// Stopped by request. `mid_phase` is set when `phase` was interrupted
    /// while its worker was running and is left recorded as `running`.
    Cancelled {
        phase: PipelinePhase,
        mid_phase: bool,
    },
}

/// A savepoint restore that discarded working-tree changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub savepoint: String,
    /// Phase whose failure triggered the rollback
    pub phase: PipelinePhase,
    pub reason: String,
    pub repos: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: PipelinePhase,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,
    pub started_from: PipelinePhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackEvent>,
    /// Savepoint still active when the run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_savepoint: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn halt(&self) -> Option<&HaltReason> {
        match &self.outcome {
            RunOutcome::Halted { halt } => Some(halt),
            _ => None,
        }
    }

    /// Phase a follow-up `resume` should start from. A rollback undid the
    /// migration, so Migration has to run again.
    pub fn resume_from(&self) -> Option<PipelinePhase> {
        let halt = self.halt()?;
        if self.rollback.is_some() {
            Some(PipelinePhase::Migration)
        } else {
            Some(halt.phase())
        }
    }

    pub fn phase_status(&self, phase: PipelinePhase) -> Option<PhaseStatus> {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.status)
    }

    /// Write the report under `runs_dir` and return its path.
    pub fn save(&self, runs_dir: &Path) -> Result<PathBuf, PersistenceError> {
        let filename = format!(
            "{}_{}.json",
            self.started_at.format("%Y-%m-%dT%H-%M-%S"),
            self.run_id
        );
        let path = runs_dir.join(filename);
        write_json(&path, self)?;
        Ok(path)
    }
}
