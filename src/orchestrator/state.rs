//! Run-wide progress record.
//!
//! Observability only: the orchestrator never decides what to run from this
//! record except to find where an interrupted run stopped. Every mutation is
//! written through to `progress.json` immediately.

use crate::errors::PersistenceError;
use crate::phase::PipelinePhase;
use crate::store::{read_json, write_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Running => write!(f, "running"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One worker session that ran during a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub model: String,
    pub turns: u32,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_log: Vec<SessionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub active_savepoint: Option<String>,
    pub phases: BTreeMap<PipelinePhase, PhaseProgress>,
}

impl RunProgress {
    fn new(run_id: &str, project: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            project: project.to_string(),
            started_at: Utc::now(),
            active_savepoint: None,
            phases: PipelinePhase::ALL
                .iter()
                .map(|p| (*p, PhaseProgress::default()))
                .collect(),
        }
    }

    pub fn status(&self, phase: PipelinePhase) -> PhaseStatus {
        self.phases
            .get(&phase)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    /// The first phase not recorded as completed.
    pub fn first_incomplete(&self) -> Option<PipelinePhase> {
        PipelinePhase::ALL
            .into_iter()
            .find(|p| self.status(*p) != PhaseStatus::Completed)
    }
}

pub struct ProgressTracker {
    path: PathBuf,
    progress: RunProgress,
}

impl ProgressTracker {
    /// Begin a fresh record with every phase pending.
    pub fn start(
        path: impl Into<PathBuf>,
        run_id: &str,
        project: &str,
    ) -> Result<Self, PersistenceError> {
        let tracker = Self {
            path: path.into(),
            progress: RunProgress::new(run_id, project),
        };
        tracker.save()?;
        Ok(tracker)
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Option<RunProgress>, PersistenceError> {
        read_json(&path.into())
    }

    /// Reopen an existing record for a resumed run.
    ///
    /// A phase left `running` by an interrupted process is recorded as
    /// `failed`, so a resume never believes it succeeded.
    pub fn reopen(
        path: impl Into<PathBuf>,
        run_id: &str,
        project: &str,
    ) -> Result<Self, PersistenceError> {
        let path = path.into();
        let Some(mut progress) = read_json::<RunProgress>(&path)? else {
            return Self::start(path, run_id, project);
        };

        for phase in PipelinePhase::ALL {
            let entry = progress.phases.entry(phase).or_default();
            if entry.status == PhaseStatus::Running {
                entry.status = PhaseStatus::Failed;
                entry.error = Some("interrupted".to_string());
                entry.ended_at.get_or_insert_with(Utc::now);
            }
        }
        progress.run_id = run_id.to_string();

        let tracker = Self { path, progress };
        tracker.save()?;
        Ok(tracker)
    }

    fn save(&self) -> Result<(), PersistenceError> {
        write_json(&self.path, &self.progress)
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    fn phase_mut(&mut self, phase: PipelinePhase) -> &mut PhaseProgress {
        self.progress.phases.entry(phase).or_default()
    }

    /// Return `phase` and every later phase to `pending`. Session logs are kept.
    pub fn reset_from(&mut self, phase: PipelinePhase) -> Result<(), PersistenceError> {
        for later in phase.remaining() {
            let entry = self.phase_mut(*later);
            entry.status = PhaseStatus::Pending;
            entry.started_at = None;
            entry.ended_at = None;
            entry.summary = None;
            entry.error = None;
        }
        self.save()
    }

    pub fn mark_running(&mut self, phase: PipelinePhase) -> Result<(), PersistenceError> {
        let entry = self.phase_mut(phase);
        entry.status = PhaseStatus::Running;
        entry.started_at = Some(Utc::now());
        entry.ended_at = None;
        entry.summary = None;
        entry.error = None;
        self.save()
    }

    pub fn mark_completed(
        &mut self,
        phase: PipelinePhase,
        summary: String,
    ) -> Result<(), PersistenceError> {
        let entry = self.phase_mut(phase);
        entry.status = PhaseStatus::Completed;
        entry.ended_at = Some(Utc::now());
        entry.summary = Some(summary);
        self.save()
    }

    pub fn mark_failed(
        &mut self,
        phase: PipelinePhase,
        error: String,
    ) -> Result<(), PersistenceError> {
        let entry = self.phase_mut(phase);
        entry.status = PhaseStatus::Failed;
        entry.ended_at = Some(Utc::now());
        entry.error = Some(error);
        self.save()
    }

    pub fn log_sessions(
        &mut self,
        phase: PipelinePhase,
        sessions: Vec<SessionEntry>,
    ) -> Result<(), PersistenceError> {
        if sessions.is_empty() {
            return Ok(());
        }
        self.phase_mut(phase).session_log.extend(sessions);
        self.save()
    }

    pub fn set_active_savepoint(&mut self, name: Option<String>) -> Result<(), PersistenceError> {
        self.progress.active_savepoint = name;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn session(id: &str) -> SessionEntry {
        SessionEntry {
            session_id: id.to_string(),
            model: "claude-sonnet-4-5".to_string(),
            turns: 12,
            logged_at: Utc::now(),
        }
    }

    #[test]
    fn test_start_records_all_phases_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let tracker = ProgressTracker::start(&path, "run1", "storefront").unwrap();
        assert_eq!(tracker.progress().phases.len(), 5);
        assert_eq!(
            tracker.progress().first_incomplete(),
            Some(PipelinePhase::Discovery)
        );

        let loaded = ProgressTracker::load(&path).unwrap().unwrap();
        assert_eq!(&loaded, tracker.progress());
    }

    #[test]
    fn test_lifecycle_is_written_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut tracker = ProgressTracker::start(&path, "run1", "p").unwrap();

        tracker.mark_running(PipelinePhase::Discovery).unwrap();
        tracker
            .log_sessions(PipelinePhase::Discovery, vec![session("sess-1")])
            .unwrap();
        tracker
            .mark_completed(PipelinePhase::Discovery, "3 usages discovered".to_string())
            .unwrap();
        tracker.mark_running(PipelinePhase::Narrowing).unwrap();
        tracker
            .mark_failed(PipelinePhase::Narrowing, "min_narrowed_usages".to_string())
            .unwrap();

        let loaded = ProgressTracker::load(&path).unwrap().unwrap();
        let discovery = &loaded.phases[&PipelinePhase::Discovery];
        assert_eq!(discovery.status, PhaseStatus::Completed);
        assert_eq!(discovery.summary.as_deref(), Some("3 usages discovered"));
        assert_eq!(discovery.session_log[0].session_id, "sess-1");
        assert!(discovery.ended_at >= discovery.started_at);
        assert_eq!(loaded.status(PipelinePhase::Narrowing), PhaseStatus::Failed);
        assert_eq!(loaded.first_incomplete(), Some(PipelinePhase::Narrowing));
    }

    #[test]
    fn test_reopen_marks_running_as_interrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        {
            let mut tracker = ProgressTracker::start(&path, "run1", "p").unwrap();
            tracker.mark_running(PipelinePhase::Discovery).unwrap();
        }

        let tracker = ProgressTracker::reopen(&path, "run2", "p").unwrap();
        let discovery = &tracker.progress().phases[&PipelinePhase::Discovery];
        assert_eq!(discovery.status, PhaseStatus::Failed);
        assert_eq!(discovery.error.as_deref(), Some("interrupted"));
        assert_eq!(tracker.progress().run_id, "run2");
    }

    #[test]
    fn test_reopen_without_record_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let tracker = ProgressTracker::reopen(&path, "run1", "p").unwrap();
        assert_eq!(tracker.progress().status(PipelinePhase::Discovery), PhaseStatus::Pending);
        assert!(path.exists());
    }

    #[test]
    fn test_reset_from_keeps_earlier_phases_and_sessions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut tracker = ProgressTracker::start(&path, "run1", "p").unwrap();
        for phase in [PipelinePhase::Discovery, PipelinePhase::Narrowing] {
            tracker.mark_running(phase).unwrap();
            tracker.log_sessions(phase, vec![session("s")]).unwrap();
            tracker.mark_completed(phase, "ok".to_string()).unwrap();
        }

        tracker.reset_from(PipelinePhase::Narrowing).unwrap();
        let progress = tracker.progress();
        assert_eq!(progress.status(PipelinePhase::Discovery), PhaseStatus::Completed);
        assert_eq!(progress.status(PipelinePhase::Narrowing), PhaseStatus::Pending);
        assert_eq!(
            progress.phases[&PipelinePhase::Narrowing].session_log.len(),
            1
        );
    }

    #[test]
    fn test_active_savepoint_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut tracker = ProgressTracker::start(&path, "run1", "p").unwrap();
        tracker
            .set_active_savepoint(Some("pre-migration-run1".to_string()))
            .unwrap();
        let loaded = ProgressTracker::load(&path).unwrap().unwrap();
        assert_eq!(loaded.active_savepoint.as_deref(), Some("pre-migration-run1"));
    }
}
