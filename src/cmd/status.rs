//! Read-only views of the work directory: `shift status` and `shift savepoints`.

use anyhow::Result;
use shift::config::PipelineConfig;
use shift::orchestrator::ProgressTracker;
use shift::phase::PipelinePhase;
use shift::store::StateStore;
use std::path::Path;

use super::run::styled_status;

pub fn cmd_status(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;

    println!();
    println!("Shift Pipeline Status");
    println!("=====================");
    println!();

    let Some(progress) = ProgressTracker::load(config.progress_file())? else {
        println!("No run recorded in {}", config.work_dir.display());
        println!();
        println!("Run 'shift run' to start the pipeline.");
        println!();
        return Ok(());
    };

    println!("Project:    {}", progress.project);
    println!("Run:        {}", progress.run_id);
    println!("Started:    {}", progress.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("{:<12} {:<10} {:<9} Detail", "Phase", "Status", "Sessions");
    println!("{:<12} {:<10} {:<9} ------", "-----", "------", "--------");

    let store = StateStore::new(&config.work_dir);
    for phase in PipelinePhase::ALL {
        let entry = progress.phases.get(&phase).cloned().unwrap_or_default();
        let detail = match (&entry.error, &entry.summary) {
            (Some(error), _) => console::style(error.clone()).red().to_string(),
            (None, Some(summary)) => summary.clone(),
            (None, None) if store.has(phase) => "result stored".to_string(),
            (None, None) => String::new(),
        };
        println!(
            "{:<12} {:<10} {:<9} {}",
            phase.as_str(),
            styled_status(entry.status),
            entry.session_log.len(),
            detail
        );
    }
    println!();

    match &progress.active_savepoint {
        Some(name) => println!("Active savepoint: {}", console::style(name).yellow()),
        None => println!("Active savepoint: none"),
    }
    if let Some(next) = progress.first_incomplete() {
        println!("Next phase:       {}", next);
    }
    println!();
    Ok(())
}

pub fn cmd_savepoints(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;
    let store = StateStore::new(&config.work_dir);
    let records = store.list_savepoints()?;
    let active = ProgressTracker::load(config.progress_file())?
        .and_then(|p| p.active_savepoint);

    println!();
    if records.is_empty() {
        println!("No savepoints recorded.");
        println!();
        return Ok(());
    }

    for record in &records {
        let marker = if active.as_deref() == Some(record.name.as_str()) {
            console::style(" (active)").yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "{}{}  {}",
            console::style(&record.name).bold(),
            marker,
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        for repo in &record.repos {
            let short = repo
                .created_at_commit
                .get(..8)
                .unwrap_or(&repo.created_at_commit);
            println!("    {:<16} {}", repo.repo, short);
        }
    }
    println!();
    Ok(())
}
