//! Tool bridge exposed to the worker during a phase.
//!
//! The worker sends one JSON request per line, `{"tool": "...", "arguments": {...}}`,
//! and gets one JSON response per line. Reads expose configuration and
//! earlier phase results. `save_<phase>_result` is decoded against the
//! phase's result shape before it is accepted; a rejected save carries a
//! machine-readable reason so the worker can fix its payload and retry.
//!
//! Accepted saves land in `submissions/<phase>.json`. They are not phase
//! results yet: the orchestrator still gates them after the session ends.

use crate::config::PipelineConfig;
use crate::errors::PersistenceError;
use crate::phase::PipelinePhase;
use crate::schema::decode;
use crate::store::{StateStore, read_json, write_json};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

pub fn submission_path(dir: &Path, phase: PipelinePhase) -> PathBuf {
    dir.join(format!("{}.json", phase.as_str()))
}

/// The last payload accepted by the bridge for `phase`, if any.
pub fn read_submission(dir: &Path, phase: PipelinePhase) -> Result<Option<Value>, PersistenceError> {
    read_json(&submission_path(dir, phase))
}

pub fn clear_submission(dir: &Path, phase: PipelinePhase) -> Result<(), PersistenceError> {
    let path = submission_path(dir, phase);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistenceError::Io { path, source }),
    }
}

fn ok(data: Value) -> Value {
    json!({"status": "ok", "data": data})
}

fn absent() -> Value {
    json!({"status": "absent"})
}

fn rejected(kind: &str, detail: impl Into<String>) -> Value {
    json!({"status": "rejected", "reason": {"kind": kind, "detail": detail.into()}})
}

pub struct ToolBridge<'a> {
    config: &'a PipelineConfig,
    store: &'a StateStore,
    phase: PipelinePhase,
    submissions_dir: PathBuf,
}

impl<'a> ToolBridge<'a> {
    pub fn new(config: &'a PipelineConfig, store: &'a StateStore, phase: PipelinePhase) -> Self {
        Self {
            config,
            store,
            phase,
            submissions_dir: config.submissions_dir(),
        }
    }

    /// Tool names available during this bridge's phase.
    pub fn tool_names(&self) -> Vec<String> {
        let mut tools = vec![
            "get_config".to_string(),
            "get_endpoints".to_string(),
            "get_mappings".to_string(),
            "get_graphql_schema".to_string(),
        ];
        for earlier in PipelinePhase::ALL.iter().take(self.phase.index()) {
            tools.push(format!("get_{}_result", earlier));
        }
        tools.push(format!("save_{}_result", self.phase));
        tools
    }

    pub fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => self.handle(request),
            Err(e) => rejected("invalid_request", e.to_string()),
        }
    }

    pub fn handle(&self, request: ToolRequest) -> Value {
        let tool = request.tool.as_str();
        tracing::debug!(phase = %self.phase, tool, "Bridge request");
        match tool {
            "get_config" => match serde_json::to_value(self.config) {
                Ok(config) => ok(config),
                Err(e) => rejected("internal", e.to_string()),
            },
            "get_endpoints" => ok(json!(self.config.rest_endpoints)),
            "get_mappings" => {
                let filter = request.arguments.get("endpoint_id").and_then(Value::as_str);
                let mappings: Vec<_> = self
                    .config
                    .attribute_mappings
                    .iter()
                    .filter(|m| filter.is_none_or(|id| m.endpoint_id == id))
                    .collect();
                ok(json!(mappings))
            }
            "get_graphql_schema" => self.graphql_schema(),
            _ => {
                if let Some(name) = tool
                    .strip_prefix("save_")
                    .and_then(|t| t.strip_suffix("_result"))
                {
                    return self.save(name, request.arguments);
                }
                if let Some(name) = tool
                    .strip_prefix("get_")
                    .and_then(|t| t.strip_suffix("_result"))
                {
                    return self.get_result(name);
                }
                rejected("unknown_tool", format!("Unknown tool '{}'", tool))
            }
        }
    }

    fn graphql_schema(&self) -> Value {
        let Some(path) = &self.config.graphql_schema_path else {
            return absent();
        };
        match std::fs::read_to_string(path) {
            Ok(schema) => ok(Value::String(schema)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => absent(),
            Err(e) => rejected("persistence", format!("{}: {}", path.display(), e)),
        }
    }

    fn get_result(&self, name: &str) -> Value {
        let Ok(phase) = name.parse::<PipelinePhase>() else {
            return rejected("unknown_tool", format!("Unknown phase '{}'", name));
        };
        if phase >= self.phase {
            return rejected(
                "phase_mismatch",
                format!("{} result is not an input of the {} phase", phase, self.phase),
            );
        }
        match self.store.get(phase) {
            Ok(Some(result)) => match serde_json::to_value(&result) {
                Ok(value) => ok(value),
                Err(e) => rejected("internal", e.to_string()),
            },
            Ok(None) => absent(),
            Err(e) => rejected("persistence", e.to_string()),
        }
    }

    fn save(&self, name: &str, arguments: Value) -> Value {
        let Ok(phase) = name.parse::<PipelinePhase>() else {
            return rejected("unknown_tool", format!("Unknown phase '{}'", name));
        };
        if phase != self.phase {
            return rejected(
                "phase_mismatch",
                format!("This session runs the {} phase, not {}", self.phase, phase),
            );
        }

        // Accept either {"result": {...}} or the result object itself.
        let payload = match arguments {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        };

        if let Err(e) = decode(phase, payload.clone()) {
            tracing::info!(phase = %phase, kind = e.kind(), "Rejected worker save");
            return rejected(e.kind(), e.to_string());
        }

        let path = submission_path(&self.submissions_dir, phase);
        match write_json(&path, &payload) {
            Ok(()) => {
                tracing::info!(phase = %phase, "Accepted worker save");
                json!({"status": "saved", "phase": phase})
            }
            Err(e) => rejected("persistence", e.to_string()),
        }
    }

    /// Serve requests line by line until the reader is exhausted.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line);
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
