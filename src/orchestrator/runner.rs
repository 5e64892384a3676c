use crate::bridge::{clear_submission, read_submission};
use crate::config::PipelineConfig;
use crate::errors::RunnerFailure;
use crate::orchestrator::state::SessionEntry;
use crate::phase::PipelinePhase;
use crate::schema::PhaseResult;
use crate::stream::SessionTranscript;
use crate::util::extract_json_object;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// A worker's untyped output for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub payload: Value,
    pub sessions: Vec<SessionEntry>,
}

/// Performs the substantive work of a phase.
///
/// Called once per phase attempt with the predecessor's validated result.
/// Returns the whole payload or a failure; never partial output.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn run(
        &self,
        phase: PipelinePhase,
        predecessor: Option<&PhaseResult>,
        config: &PipelineConfig,
    ) -> Result<RawResult, RunnerFailure>;
}

/// Runs each phase as one session of the agent CLI.
pub struct AgentRunner {
    /// Shell command prefix the worker uses to reach the tool bridge;
    /// the phase name is appended.
    bridge_cmd: String,
}

impl AgentRunner {
    pub fn new(bridge_cmd: impl Into<String>) -> Self {
        Self {
            bridge_cmd: bridge_cmd.into(),
        }
    }

    fn agent_flags(config: &PipelineConfig) -> Vec<String> {
        vec![
            "--dangerously-skip-permissions".to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            config.options.model.clone(),
            "--max-turns".to_string(),
            config.options.max_turns_per_phase.to_string(),
        ]
    }

    pub fn build_prompt(
        &self,
        phase: PipelinePhase,
        predecessor: Option<&PhaseResult>,
        config: &PipelineConfig,
    ) -> String {
        let mut prompt = format!(
            "# {} phase of the REST to GraphQL migration for {}\n\n## GOAL\n{}\n\n",
            phase,
            config.project_name,
            phase_goal(phase)
        );

        prompt.push_str("## REPOSITORIES\n");
        for repo in &config.repositories {
            prompt.push_str(&format!(
                "- {} ({}, branch {}): {}\n",
                repo.name,
                repo.language,
                repo.branch,
                config.repo_path(repo).display()
            ));
        }

        if phase == PipelinePhase::Migration {
            prompt.push_str(&format!(
                "\n## OPTIONS\n- dry_run: {}\n- create_branches: {}\n- branch_prefix: {}\n",
                config.options.dry_run, config.options.create_branches, config.options.branch_prefix
            ));
        }

        if let Some(input) = predecessor {
            let json = serde_json::to_string_pretty(input)
                .unwrap_or_else(|e| format!("[unavailable: {}]", e));
            prompt.push_str(&format!(
                "\n## INPUT ({} result)\n```json\n{}\n```\n",
                input.phase(),
                json
            ));
        }

        let bridge = format!("{} {}", self.bridge_cmd, phase);
        prompt.push_str(&format!(
            r#"
## TOOLS
Send one JSON request per line to `{bridge}` on stdin, for example:
    echo '{{"tool": "get_endpoints"}}' | {bridge}
Available tools: get_config, get_endpoints, get_mappings (optional "endpoint_id"),
get_graphql_schema, get_<phase>_result for earlier phases.

## OUTPUT
Submit your result with:
    echo '{{"tool": "save_{phase}_result", "arguments": {{"result": <result>}}}}' | {bridge}
The result must be a JSON object with "phase": "{phase}". If the response is
"rejected", fix the payload using the reason and submit again. Finish by
printing the same JSON object as your final message.
"#,
            bridge = bridge,
            phase = phase
        ));

        prompt
    }
}

fn phase_goal(phase: PipelinePhase) -> &'static str {
    match phase {
        PipelinePhase::Discovery => {
            "Find every call site of the configured REST endpoints in every repository. \
             Report each as a usage with endpoint_id, repo, file, line, snippet and language."
        }
        PipelinePhase::Narrowing => {
            "Keep only the discovered usages whose REST attributes all have GraphQL mappings. \
             For each, list matched_mappings and rate complexity as low, medium or high."
        }
        PipelinePhase::Generation => {
            "For each narrowed usage, write the GraphQL query and the replacement code in the \
             repository's language, with any imports it needs. Both graphql_query and new_code \
             must be non-empty."
        }
        PipelinePhase::Migration => {
            "Apply each generated migration to its file. Record every attempt in \
             applied_migrations with status applied, skipped or failed, plus the diff and, \
             when committed, branch and commit."
        }
        PipelinePhase::Validation => {
            "Build and test every migrated repository and review the changes. Report each \
             check with check_name, passed and details."
        }
    }
}

#[async_trait]
impl PhaseRunner for AgentRunner {
    async fn run(
        &self,
        phase: PipelinePhase,
        predecessor: Option<&PhaseResult>,
        config: &PipelineConfig,
    ) -> Result<RawResult, RunnerFailure> {
        let io_failure =
            |what: &str, e: std::io::Error| RunnerFailure::session_error(format!("{}: {}", what, e));

        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir).map_err(|e| io_failure("Failed to create log dir", e))?;
        let submissions = config.submissions_dir();
        clear_submission(&submissions, phase)
            .map_err(|e| RunnerFailure::session_error(e.to_string()))?;

        let prompt = self.build_prompt(phase, predecessor, config);
        let prompt_file = log_dir.join(format!("{}-prompt.md", phase));
        std::fs::write(&prompt_file, &prompt)
            .map_err(|e| io_failure("Failed to write prompt file", e))?;

        let agent_cmd = config.agent_cmd();
        let flags = Self::agent_flags(config);
        tracing::info!(phase = %phase, cmd = %agent_cmd, "Spawning worker session");

        let start = Instant::now();
        let mut child = Command::new(&agent_cmd)
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&config.work_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_failure(&format!("Failed to spawn '{}'", agent_cmd), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| io_failure("Failed to write prompt", e))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| io_failure("Failed to close stdin", e))?;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerFailure::session_error("Worker stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = SessionTranscript::default();
        let mut raw_output = String::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| io_failure("Failed to read worker output", e))?
        {
            transcript.push_line(&line);
            raw_output.push_str(&line);
            raw_output.push('\n');
        }

        let status = child
            .wait()
            .await
            .map_err(|e| io_failure("Failed to wait for worker", e))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let output_file = log_dir.join(format!("{}-output.log", phase));
        if let Err(e) = std::fs::write(&output_file, &raw_output) {
            tracing::warn!(path = %output_file.display(), error = %e, "Failed to write worker output log");
        }

        tracing::info!(
            phase = %phase,
            exit_code = status.code().unwrap_or(-1),
            turns = transcript.turns,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Worker session finished"
        );

        if !status.success() {
            return Err(RunnerFailure::session_error(format!(
                "worker exited with code {}: {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        if transcript.is_error {
            return Err(RunnerFailure::session_error(format!(
                "worker reported {}: {}",
                transcript.result_subtype.as_deref().unwrap_or("error"),
                transcript.final_text().trim()
            )));
        }

        let payload = payload_from(
            read_submission(&submissions, phase)
                .map_err(|e| RunnerFailure::session_error(e.to_string()))?,
            transcript.final_text(),
        )?;

        let sessions = vec![SessionEntry {
            session_id: transcript
                .session_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            model: transcript
                .model
                .clone()
                .unwrap_or_else(|| config.options.model.clone()),
            turns: transcript.turns,
            logged_at: Utc::now(),
        }];

        Ok(RawResult { payload, sessions })
    }
}

/// The bridge submission wins; otherwise the first JSON object in the
/// worker's final text.
fn payload_from(submission: Option<Value>, final_text: &str) -> Result<Value, RunnerFailure> {
    if let Some(payload) = submission {
        return Ok(payload);
    }
    let json = extract_json_object(final_text)
        .ok_or_else(|| RunnerFailure::malformed_output("no JSON object in worker output"))?;
    serde_json::from_str(&json)
        .map_err(|e| RunnerFailure::malformed_output(format!("invalid JSON in worker output: {}", e)))
}
