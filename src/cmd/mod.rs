//! CLI command implementations.
//!
//! | Module    | Commands handled        |
//! |-----------|-------------------------|
//! | `run`     | `Run`, `Resume`         |
//! | `status`  | `Status`, `Savepoints`  |
//! | `bridge`  | `Bridge`                |
//! | `config`  | `Config`                |

pub mod bridge;
pub mod config;
pub mod run;
pub mod status;

pub use bridge::cmd_bridge;
pub use config::cmd_config;
pub use run::{cmd_resume, cmd_run};
pub use status::{cmd_savepoints, cmd_status};

use anyhow::{Context, Result};
use shift::config::PipelineConfig;
use std::path::Path;

/// Load the config file, failing on any validation problem.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path)?;
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!(
            "Invalid configuration in {}:\n  - {}",
            path.display(),
            problems.join("\n  - ")
        );
    }
    Ok(config)
}

/// Absolute form of `path` for handing to child processes.
pub fn absolute(path: &Path) -> Result<std::path::PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve path: {}", path.display()))
}
