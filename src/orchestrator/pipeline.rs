//! The phase state machine.
//!
//! Phases run strictly in order. Each phase's worker output is decoded and
//! gated before it is persisted, and a phase only starts once its
//! predecessor's result is on disk. Migration runs under a savepoint that is
//! restored when Migration fails or a failed Validation gate asks for it.

use crate::config::PipelineConfig;
use crate::errors::{OrchestratorError, PersistenceError, RunnerFailure};
use crate::gates::{GateContext, GateValidator};
use crate::orchestrator::runner::PhaseRunner;
use crate::orchestrator::state::{PhaseStatus, ProgressTracker};
use crate::phase::PipelinePhase;
use crate::report::{HaltReason, PhaseReport, RollbackEvent, RunOutcome, RunReport};
use crate::savepoint::SavepointSet;
use crate::schema::{PhaseResult, decode};
use crate::store::{SavepointRecord, StateStore};
use crate::validation::run_build_checks;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything one invocation carries from phase to phase.
struct RunContext {
    run_id: String,
    started_from: PipelinePhase,
    started_at: DateTime<Utc>,
    progress: ProgressTracker,
    /// Validated results available to this run, keyed by phase
    results: BTreeMap<PipelinePhase, PhaseResult>,
    active_savepoint: Option<String>,
    rollback: Option<RollbackEvent>,
}

impl RunContext {
    fn into_report(self, outcome: RunOutcome) -> RunReport {
        let progress = self.progress.progress();
        let phases = PipelinePhase::ALL
            .iter()
            .map(|phase| {
                let entry = progress.phases.get(phase).cloned().unwrap_or_default();
                PhaseReport {
                    phase: *phase,
                    status: entry.status,
                    summary: entry.summary,
                    error: entry.error,
                }
            })
            .collect();

        RunReport {
            run_id: self.run_id,
            project: progress.project.clone(),
            started_from: self.started_from,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            phases,
            rollback: self.rollback,
            active_savepoint: self.active_savepoint,
        }
    }
}

enum PhaseStep {
    Advanced,
    Halted(HaltReason),
    Cancelled { mid_phase: bool },
}

/// Attach the phase to a store failure.
fn persisted<T>(
    phase: PipelinePhase,
    result: Result<T, PersistenceError>,
) -> Result<T, OrchestratorError> {
    result.map_err(|source| {
        error!(phase = %phase, error = %source, "State store failure");
        OrchestratorError::Persistence { phase, source }
    })
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct Orchestrator {
    config: PipelineConfig,
    runner: Arc<dyn PhaseRunner>,
    store: StateStore,
    gates: GateValidator,
    savepoints: SavepointSet,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, runner: Arc<dyn PhaseRunner>) -> Self {
        let store = StateStore::new(&config.work_dir);
        let gates = GateValidator::new(config.coverage_rules.clone());
        let savepoints = SavepointSet::new(config.repo_paths());
        Self {
            config,
            runner,
            store,
            gates,
            savepoints,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to request cancellation from outside the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run every phase from Discovery, discarding earlier results.
    pub async fn run(&self) -> Result<RunReport, OrchestratorError> {
        let _lock = self.lock()?;
        let run_id = new_run_id();

        let lingering = match ProgressTracker::load(self.config.progress_file()) {
            Ok(previous) => previous.and_then(|p| p.active_savepoint),
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable progress record from an earlier run");
                None
            }
        };
        let mut progress = ProgressTracker::start(
            self.config.progress_file(),
            &run_id,
            &self.config.project_name,
        )?;
        if lingering.is_some() {
            progress.set_active_savepoint(lingering.clone())?;
        }

        let mut ctx = RunContext {
            run_id,
            started_from: PipelinePhase::Discovery,
            started_at: Utc::now(),
            progress,
            results: BTreeMap::new(),
            active_savepoint: lingering,
            rollback: None,
        };
        self.restore_interrupted_migration(&mut ctx)?;
        self.store.clear_from(PipelinePhase::Discovery)?;
        ctx.progress.reset_from(PipelinePhase::Discovery)?;
        self.drive(ctx).await
    }

    /// Continue a previous run from `from`, or from its first incomplete
    /// phase. Results before the start phase are reused untouched.
    pub async fn resume(
        &self,
        from: Option<PipelinePhase>,
    ) -> Result<RunReport, OrchestratorError> {
        let _lock = self.lock()?;
        let run_id = new_run_id();

        let progress = ProgressTracker::reopen(
            self.config.progress_file(),
            &run_id,
            &self.config.project_name,
        )?;

        let start = match from.or_else(|| progress.progress().first_incomplete()) {
            Some(phase) => phase,
            None => {
                return Err(OrchestratorError::ResumeRejected {
                    phase: PipelinePhase::Validation,
                    reason: "every phase already completed".to_string(),
                });
            }
        };

        let mut results = BTreeMap::new();
        for earlier in PipelinePhase::ALL.iter().take(start.index()) {
            if let Some(result) = self.store.get(*earlier)? {
                results.insert(*earlier, result);
            }
        }

        if let Some(prev) = start.prev() {
            if !results.contains_key(&prev) {
                return Err(OrchestratorError::ResumeRejected {
                    phase: start,
                    reason: format!("no persisted {} result", prev),
                });
            }
            let status = progress.progress().status(prev);
            if status != PhaseStatus::Completed {
                return Err(OrchestratorError::ResumeRejected {
                    phase: start,
                    reason: format!("{} is recorded as {}", prev, status),
                });
            }
        }

        let active_savepoint = progress.progress().active_savepoint.clone();
        let mut ctx = RunContext {
            run_id,
            started_from: start,
            started_at: Utc::now(),
            progress,
            results,
            active_savepoint,
            rollback: None,
        };
        if start <= PipelinePhase::Migration {
            self.restore_interrupted_migration(&mut ctx)?;
        } else if let Some(name) = &ctx.active_savepoint {
            info!(savepoint = %name, "Resuming with active savepoint");
        }

        self.store.clear_from(start)?;
        ctx.progress.reset_from(start)?;
        self.drive(ctx).await
    }

    /// Exclusive lock on the work directory, held for the whole run.
    fn lock(&self) -> Result<File, OrchestratorError> {
        let path = self.config.lock_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::Locked { path });
        }
        Ok(file)
    }

    async fn drive(&self, mut ctx: RunContext) -> Result<RunReport, OrchestratorError> {
        info!(
            run_id = %ctx.run_id,
            project = %self.config.project_name,
            from = %ctx.started_from,
            "Pipeline starting"
        );

        let mut outcome = RunOutcome::Completed;
        for phase in ctx.started_from.remaining() {
            match self.run_phase(&mut ctx, *phase).await? {
                PhaseStep::Advanced => {}
                PhaseStep::Halted(halt) => {
                    warn!(phase = %phase, reason = %halt, "Pipeline halted");
                    outcome = RunOutcome::Halted { halt };
                    break;
                }
                PhaseStep::Cancelled { mid_phase } => {
                    warn!(phase = %phase, mid_phase, "Pipeline cancelled");
                    outcome = RunOutcome::Cancelled {
                        phase: *phase,
                        mid_phase,
                    };
                    break;
                }
            }
        }

        let report = ctx.into_report(outcome);
        let path = report.save(&self.config.runs_dir())?;
        info!(
            run_id = %report.run_id,
            success = report.is_success(),
            report = %path.display(),
            "Pipeline finished"
        );
        Ok(report)
    }

    async fn run_phase(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
    ) -> Result<PhaseStep, OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Ok(PhaseStep::Cancelled { mid_phase: false });
        }

        info!(run_id = %ctx.run_id, phase = %phase, "Phase starting");
        persisted(phase, ctx.progress.mark_running(phase))?;

        if phase.is_mutating() {
            self.create_savepoint(ctx, phase)?;
        }

        let timeout = self.config.phase_timeout();
        let predecessor = phase.prev().and_then(|p| ctx.results.get(&p));
        let invoked = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(
                timeout,
                self.runner.run(phase, predecessor, &self.config),
            ) => Some(result),
        };

        let raw = match invoked {
            None => {
                if phase.is_mutating() {
                    self.rollback(ctx, phase, "cancelled while the worker was running")?;
                }
                return Ok(PhaseStep::Cancelled { mid_phase: true });
            }
            Some(Err(_elapsed)) => {
                let failure =
                    RunnerFailure::timeout(format!("no result within {}s", timeout.as_secs()));
                return self.runner_failed(ctx, phase, failure);
            }
            Some(Ok(Err(failure))) => return self.runner_failed(ctx, phase, failure),
            Some(Ok(Ok(raw))) => raw,
        };

        persisted(phase, ctx.progress.log_sessions(phase, raw.sessions))?;

        let mut result = match decode(phase, raw.payload) {
            Ok(result) => result,
            Err(err) => return self.runner_failed(ctx, phase, err.into()),
        };
        debug!(phase = %phase, items = result.item_count(), "Worker output decoded");

        if let PhaseResult::Validation(validation) = &mut result {
            let checks = tokio::select! {
                _ = self.cancel.cancelled() => None,
                checks = run_build_checks(&self.config) => Some(checks),
            };
            match checks {
                Some(checks) => validation.checks.extend(checks),
                None => return Ok(PhaseStep::Cancelled { mid_phase: true }),
            }
        }

        let gate_ctx = GateContext {
            predecessor: phase.prev().and_then(|p| ctx.results.get(&p)),
            discovery: ctx
                .results
                .get(&PipelinePhase::Discovery)
                .and_then(PhaseResult::as_discovery),
        };
        let verdict = match self.gates.check(&result, gate_ctx) {
            Ok(verdict) => verdict,
            Err(error) => {
                warn!(phase = %phase, rule = %error.rule, reason = %error.reason, "Gate rejected result");
                persisted(phase, ctx.progress.mark_failed(phase, error.to_string()))?;
                let restore = match &result {
                    PhaseResult::Validation(validation) => {
                        self.config.rollback.applies(validation)
                    }
                    _ => phase.is_mutating(),
                };
                if restore {
                    self.rollback(ctx, phase, &error.to_string())?;
                }
                return Ok(PhaseStep::Halted(HaltReason::Gate { error }));
            }
        };
        for note in &verdict.notes {
            warn!(phase = %phase, "{}", note);
        }

        persisted(phase, self.store.save(phase, &result))?;

        let mut summary = result.summary();
        if !verdict.notes.is_empty() {
            summary = format!("{}; {}", summary, verdict.notes.join("; "));
        }
        ctx.results.insert(phase, result);
        persisted(phase, ctx.progress.mark_completed(phase, summary))?;

        if phase == PipelinePhase::Validation {
            self.release_savepoint(ctx, phase)?;
        }

        info!(phase = %phase, "Phase completed");
        Ok(PhaseStep::Advanced)
    }

    fn runner_failed(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
        failure: RunnerFailure,
    ) -> Result<PhaseStep, OrchestratorError> {
        warn!(phase = %phase, kind = %failure.kind, detail = %failure.detail, "Phase runner failed");
        persisted(phase, ctx.progress.mark_failed(phase, failure.to_string()))?;
        if phase.is_mutating() {
            self.rollback(ctx, phase, &failure.to_string())?;
        }
        Ok(PhaseStep::Halted(HaltReason::Runner { phase, failure }))
    }

    /// Snapshot every repository before Migration touches it. Nothing runs
    /// if any repository cannot be snapshotted.
    fn create_savepoint(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
    ) -> Result<(), OrchestratorError> {
        if let Some(previous) = &ctx.active_savepoint {
            warn!(savepoint = %previous, "Earlier savepoint still active; it is kept but superseded");
        }

        let taken: Vec<String> = persisted(phase, self.store.list_savepoints())?
            .into_iter()
            .map(|record| record.name)
            .collect();
        let base = format!("pre-migration-{}", ctx.run_id);

        let created = self
            .savepoints
            .unique_name(&base, &taken)
            .and_then(|name| self.savepoints.create(&name).map(|repos| (name, repos)));
        let (name, repos) = match created {
            Ok(created) => created,
            Err(source) => {
                error!(phase = %phase, error = %source, "Could not create savepoint; Migration not started");
                if let Err(err) = ctx
                    .progress
                    .mark_failed(phase, format!("savepoint: {}", source))
                {
                    warn!(error = %err, "Failed to record savepoint failure");
                }
                return Err(OrchestratorError::Savepoint { phase, source });
            }
        };

        let record = SavepointRecord {
            name: name.clone(),
            created_at: Utc::now(),
            repos,
        };
        persisted(phase, self.store.save_savepoint(&record))?;
        persisted(phase, ctx.progress.set_active_savepoint(Some(name.clone())))?;
        info!(savepoint = %name, repos = record.repos.len(), "Savepoint created");
        ctx.active_savepoint = Some(name);
        Ok(())
    }

    /// Restore the active savepoint. The savepoint itself is kept so a later
    /// Migration attempt gets a fresh name next to it.
    fn rollback(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let Some(name) = ctx.active_savepoint.clone() else {
            warn!(phase = %phase, "No active savepoint; working trees left as they are");
            return Ok(());
        };

        self.savepoints
            .rollback(&name)
            .map_err(|source| OrchestratorError::Savepoint { phase, source })?;

        let repos = match persisted(phase, self.store.get_savepoint(&name))? {
            Some(record) => record.repos.into_iter().map(|r| r.repo).collect(),
            None => self
                .config
                .repositories
                .iter()
                .map(|r| r.name.clone())
                .collect(),
        };
        warn!(savepoint = %name, phase = %phase, reason, "Rolled back working trees to savepoint");
        ctx.rollback = Some(RollbackEvent {
            savepoint: name,
            phase,
            reason: reason.to_string(),
            repos,
            at: Utc::now(),
        });
        ctx.active_savepoint = None;
        persisted(phase, ctx.progress.set_active_savepoint(None))?;
        self.discard_migration(ctx, phase, reason)
    }

    /// The restored trees no longer carry the migration, so its result goes
    /// and Migration is the next phase a resume will run.
    fn discard_migration(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let migration = PipelinePhase::Migration;
        let discarded = ctx.results.remove(&migration);
        if let Some(reverted) = discarded.as_ref().and_then(PhaseResult::as_migration) {
            info!(
                applied = reverted.applied_migrations.len(),
                "Discarding rolled-back migration result"
            );
        }
        persisted(phase, self.store.clear_from(migration))?;
        persisted(
            phase,
            ctx.progress
                .mark_failed(migration, format!("rolled back: {}", reason)),
        )
    }

    /// A savepoint still active when Migration is about to run again means
    /// an earlier attempt never finished. Its edits are undone first.
    fn restore_interrupted_migration(&self, ctx: &mut RunContext) -> Result<(), OrchestratorError> {
        let Some(name) = ctx.active_savepoint.clone() else {
            return Ok(());
        };
        warn!(savepoint = %name, "Savepoint left active by an unfinished run");
        self.rollback(
            ctx,
            PipelinePhase::Migration,
            "unfinished Migration from an earlier run",
        )
    }

    /// Validation passed: the savepoint is no longer needed.
    fn release_savepoint(
        &self,
        ctx: &mut RunContext,
        phase: PipelinePhase,
    ) -> Result<(), OrchestratorError> {
        let Some(name) = ctx.active_savepoint.take() else {
            debug!("No active savepoint to release");
            return Ok(());
        };
        self.savepoints
            .delete(&name)
            .map_err(|source| OrchestratorError::Savepoint { phase, source })?;
        persisted(phase, self.store.remove_savepoint(&name))?;
        persisted(phase, ctx.progress.set_active_savepoint(None))?;
        info!(savepoint = %name, "Savepoint released");
        Ok(())
    }
}
