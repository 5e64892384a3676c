//! Typed error hierarchy for the migration orchestrator.
//!
//! Phase-local failures (the run halts but can be resumed):
//! - `RunnerFailure`: the worker produced no usable result
//! - `DecodeError`: the worker's payload is not the declared result shape
//! - `GateError`: the result is well-formed but violates a phase invariant
//!
//! `BuildCheckError` never halts a run on its own: a build check that cannot
//! run becomes a failed Validation check.
//!
//! Fatal failures (the run aborts immediately, never retried):
//! - `PersistenceError`: the state store cannot record or read
//! - `SavepointError`: a recovery point cannot be created, restored or deleted
//!
//! `OrchestratorError` wraps the fatal ones with the phase they occurred in.

use crate::phase::PipelinePhase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Why the worker failed to produce a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerFailureKind {
    Timeout,
    SessionError,
    MalformedOutput,
}

impl std::fmt::Display for RunnerFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerFailureKind::Timeout => write!(f, "timeout"),
            RunnerFailureKind::SessionError => write!(f, "session_error"),
            RunnerFailureKind::MalformedOutput => write!(f, "malformed_output"),
        }
    }
}

/// Failure signal from the PhaseRunner boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct RunnerFailure {
    pub kind: RunnerFailureKind,
    pub detail: String,
}

impl RunnerFailure {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: RunnerFailureKind::Timeout,
            detail: detail.into(),
        }
    }

    pub fn session_error(detail: impl Into<String>) -> Self {
        Self {
            kind: RunnerFailureKind::SessionError,
            detail: detail.into(),
        }
    }

    pub fn malformed_output(detail: impl Into<String>) -> Self {
        Self {
            kind: RunnerFailureKind::MalformedOutput,
            detail: detail.into(),
        }
    }
}

/// A raw payload could not be decoded into the phase's result variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Result must be a JSON object, found {found}")]
    NotAnObject { found: String },

    #[error("Result has no string 'phase' tag")]
    MissingPhaseTag,

    #[error("Result has phase='{found}', expected '{expected}'")]
    WrongPhaseTag {
        expected: PipelinePhase,
        found: String,
    },

    #[error("Invalid {phase} result: {detail}")]
    InvalidShape {
        phase: PipelinePhase,
        detail: String,
    },
}

impl DecodeError {
    /// Machine-readable reason code returned to the worker on a rejected save.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::NotAnObject { .. } => "not_an_object",
            DecodeError::MissingPhaseTag => "missing_phase_tag",
            DecodeError::WrongPhaseTag { .. } => "wrong_phase_tag",
            DecodeError::InvalidShape { .. } => "invalid_shape",
        }
    }
}

impl From<DecodeError> for RunnerFailure {
    fn from(err: DecodeError) -> Self {
        RunnerFailure::malformed_output(err.to_string())
    }
}

/// A decoded result violates one of its phase's admission rules.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{phase} gate rule '{rule}' failed: {reason}")]
pub struct GateError {
    pub phase: PipelinePhase,
    pub rule: String,
    pub reason: String,
}

impl GateError {
    pub fn new(phase: PipelinePhase, rule: &str, reason: impl Into<String>) -> Self {
        Self {
            phase,
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// The state store could not durably record or read a record.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record at {path} holds a {found} result, expected {expected}")]
    PhaseMismatch {
        path: PathBuf,
        expected: PipelinePhase,
        found: PipelinePhase,
    },
}

/// A recovery point could not be created, restored or deleted.
#[derive(Debug, Error)]
pub enum SavepointError {
    #[error("Savepoint '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Savepoint '{name}' not found")]
    NotFound { name: String },

    #[error("Invalid savepoint name '{name}'")]
    InvalidName { name: String },

    #[error("Working tree at {path} cannot be snapshotted: {reason}")]
    Uncommittable { path: PathBuf, reason: String },

    #[error("Failed to open git repository at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Git {op} failed: {source}")]
    Git {
        op: &'static str,
        #[source]
        source: git2::Error,
    },

    #[error("Repository '{repo}': {source}")]
    InRepo {
        repo: String,
        #[source]
        source: Box<SavepointError>,
    },
}

impl SavepointError {
    pub(crate) fn in_repo(repo: &str, source: SavepointError) -> Self {
        SavepointError::InRepo {
            repo: repo.to_string(),
            source: Box::new(source),
        }
    }
}

/// A repository's build check could not run.
#[derive(Debug, Error)]
pub enum BuildCheckError {
    #[error("No build.gradle found in {path}")]
    NoBuildFile { path: PathBuf },

    #[error("Failed to run '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list test reports in {path}: {source}")]
    Reports {
        path: PathBuf,
        #[source]
        source: glob::PatternError,
    },
}

/// Fatal orchestrator failures. Phase-local halts are reported through
/// `report::RunOutcome` instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("State store failure during {phase}: {source}")]
    Persistence {
        phase: PipelinePhase,
        #[source]
        source: PersistenceError,
    },

    #[error("Savepoint failure during {phase}: {source}")]
    Savepoint {
        phase: PipelinePhase,
        #[source]
        source: SavepointError,
    },

    #[error("Cannot resume from {phase}: {reason}")]
    ResumeRejected {
        phase: PipelinePhase,
        reason: String,
    },

    #[error("Another run holds the lock at {path}")]
    Locked { path: PathBuf },

    #[error(transparent)]
    Store(#[from] PersistenceError),
}
