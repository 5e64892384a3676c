//! Tool bridge endpoint for worker sessions: `shift bridge --phase <phase>`.

use anyhow::Result;
use shift::bridge::ToolBridge;
use shift::config::PipelineConfig;
use shift::phase::PipelinePhase;
use shift::store::StateStore;
use std::path::Path;
use tokio::io::BufReader;

pub async fn cmd_bridge(config_path: &Path, phase: PipelinePhase) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;
    let store = StateStore::new(&config.work_dir);
    let bridge = ToolBridge::new(&config, &store, phase);
    tracing::debug!(phase = %phase, tools = ?bridge.tool_names(), "Bridge serving");
    bridge
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}
