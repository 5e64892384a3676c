//! Configuration view and validation commands: `shift config`.

use anyhow::Result;
use shift::config::PipelineConfig;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shift Configuration");
            println!("===================");
            println!();
            println!("Config file: {}", config_path.display());
            println!("Project:     {}", config.project_name);
            println!("Work dir:    {}", config.work_dir.display());
            println!();
            println!("[repositories]");
            for repo in &config.repositories {
                println!(
                    "  {} ({}, {}) -> {}",
                    repo.name,
                    repo.language,
                    repo.branch,
                    config.repo_path(repo).display()
                );
            }
            println!();
            println!("[rest_endpoints]");
            for endpoint in &config.rest_endpoints {
                println!("  {:<16} {} {}", endpoint.id, endpoint.method, endpoint.path);
            }
            println!();
            println!("[options]");
            println!("  model = \"{}\"", config.options.model);
            println!("  max_turns_per_phase = {}", config.options.max_turns_per_phase);
            println!("  phase_timeout_secs = {}", config.options.phase_timeout_secs);
            println!("  dry_run = {}", config.options.dry_run);
            println!("  branch_prefix = \"{}\"", config.options.branch_prefix);
            println!("  build_checks = {}", config.options.build_checks);
            println!("  gradle_cmd = \"{}\"", config.options.gradle_cmd);
            println!();
            println!("Effective values (with env overrides):");
            println!("  agent_cmd = \"{}\"", config.agent_cmd());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }
            println!("Configuration problems:");
            for problem in &problems {
                println!("  - {}", problem);
            }
            anyhow::bail!("{} configuration problem(s)", problems.len());
        }
    }
    Ok(())
}
