//! Pipeline execution: `shift run` and `shift resume`.

use anyhow::{Context, Result};
use shift::orchestrator::{AgentRunner, Orchestrator, PhaseStatus};
use shift::phase::PipelinePhase;
use shift::report::{RunOutcome, RunReport};
use std::path::Path;
use std::sync::Arc;

use super::{absolute, load_config};

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// Command the worker runs to reach the tool bridge, minus the phase name.
fn bridge_command(config_path: &Path) -> Result<String> {
    let exe = std::env::current_exe().context("Failed to locate the shift executable")?;
    let config = absolute(config_path)?;
    Ok(format!(
        "{} --config {} bridge --phase",
        shell_quote(&exe),
        shell_quote(&config)
    ))
}

fn orchestrator(config_path: &Path, timeout: Option<u64>) -> Result<Orchestrator> {
    let config = load_config(config_path)?.with_timeout_override(timeout);
    let runner = AgentRunner::new(bridge_command(config_path)?);
    let orchestrator = Orchestrator::new(config, Arc::new(runner));

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    Ok(orchestrator)
}

/// Fresh run from Discovery. Returns whether the run completed.
pub async fn cmd_run(config_path: &Path, timeout: Option<u64>) -> Result<bool> {
    let orchestrator = orchestrator(config_path, timeout)?;
    let report = orchestrator.run().await?;
    print_report(&report);
    Ok(report.is_success())
}

pub async fn cmd_resume(config_path: &Path, from: Option<PipelinePhase>) -> Result<bool> {
    let orchestrator = orchestrator(config_path, None)?;
    let report = orchestrator.resume(from).await?;
    print_report(&report);
    Ok(report.is_success())
}

pub fn styled_status(status: PhaseStatus) -> console::StyledObject<String> {
    let text = console::style(status.to_string());
    match status {
        PhaseStatus::Completed => text.green(),
        PhaseStatus::Failed => text.red(),
        PhaseStatus::Running => text.yellow(),
        PhaseStatus::Pending => text.dim(),
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "Run {} of {} (from {})",
        report.run_id, report.project, report.started_from
    );
    println!();
    for phase in &report.phases {
        let status = styled_status(phase.status);
        let detail = phase
            .error
            .as_deref()
            .or(phase.summary.as_deref())
            .unwrap_or("");
        println!("  {:<12} {:<10} {}", phase.phase, status, detail);
    }
    println!();

    match &report.outcome {
        RunOutcome::Completed => {
            println!("{}", console::style("Pipeline completed.").green().bold());
        }
        RunOutcome::Halted { halt } => {
            println!(
                "{} {}",
                console::style("Halted:").red().bold(),
                halt
            );
        }
        RunOutcome::Cancelled { phase, mid_phase } => {
            let when = if *mid_phase { "during" } else { "before" };
            println!(
                "{} {} {}",
                console::style("Cancelled").yellow().bold(),
                when,
                phase
            );
        }
    }

    if let Some(rollback) = &report.rollback {
        println!(
            "{} restored savepoint {} in {} ({})",
            console::style("Rolled back:").yellow(),
            rollback.savepoint,
            rollback.repos.join(", "),
            rollback.reason
        );
    }
    if let Some(savepoint) = &report.active_savepoint {
        println!("Active savepoint: {}", savepoint);
    }
    if let Some(phase) = report.resume_from() {
        println!();
        println!("Retry with: shift resume --from {}", phase);
    }
    println!();
}
