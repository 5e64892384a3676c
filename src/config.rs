//! Pipeline configuration.
//!
//! Loaded from a TOML or JSON file (chosen by extension, TOML otherwise),
//! then layered: file → environment → CLI.
//!
//! ```toml
//! project_name = "storefront"
//! work_dir = ".shift"
//! graphql_endpoint = "https://api.example.com/graphql"
//! graphql_schema_path = "schema.graphql"
//!
//! [[repositories]]
//! name = "web"
//! url = "git@github.com:example/web.git"
//! branch = "main"
//! language = "javascript"
//!
//! [[rest_endpoints]]
//! id = "get-user"
//! method = "GET"
//! path = "/api/v1/users/{id}"
//! patterns = ["/api/v1/users/"]
//!
//! [[attribute_mappings]]
//! endpoint_id = "get-user"
//! rest_attribute = "user_name"
//! graphql_field = "name"
//! graphql_type = "User"
//!
//! [options]
//! model = "claude-sonnet-4-5-20250929"
//! phase_timeout_secs = 1800
//! build_checks = true
//! gradle_cmd = "gradle"
//!
//! [[coverage_rules]]
//! client = "web"
//! endpoints = ["get-user"]
//!
//! [rollback]
//! on_validation_failure = "matching"
//! check_patterns = ["*-build", "tests"]
//! ```

use crate::gates::coverage::ClientRule;
use crate::schema::ValidationResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Java,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Javascript => write!(f, "javascript"),
            Language::Java => write!(f, "java"),
        }
    }
}

/// A client repository to migrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub language: Language,
    /// Local checkout; defaults to `<work_dir>/repos/<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestEndpoint {
    pub id: String,
    pub method: String,
    pub path: String,
    /// Code patterns the worker searches for
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub endpoint_id: String,
    pub rest_attribute: String,
    pub graphql_field: String,
    pub graphql_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub create_branches: bool,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_max_concurrent_repos")]
    pub max_concurrent_repos: usize,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns_per_phase: u32,
    /// Upper bound on one phase's worker session
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Worker CLI command (falls back to `CLAUDE_CMD`, then `claude`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_cmd: Option<String>,
    /// Run `gradle test` in Java repositories during Validation
    #[serde(default = "default_true")]
    pub build_checks: bool,
    #[serde(default = "default_gradle_cmd")]
    pub gradle_cmd: String,
}

fn default_true() -> bool {
    true
}

fn default_branch_prefix() -> String {
    "migration/rest-to-graphql".to_string()
}

fn default_max_concurrent_repos() -> usize {
    2
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_turns() -> u32 {
    50
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_gradle_cmd() -> String {
    "gradle".to_string()
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            create_branches: true,
            branch_prefix: default_branch_prefix(),
            max_concurrent_repos: default_max_concurrent_repos(),
            model: default_model(),
            max_turns_per_phase: default_max_turns(),
            phase_timeout_secs: default_phase_timeout_secs(),
            agent_cmd: None,
            build_checks: true,
            gradle_cmd: default_gradle_cmd(),
        }
    }
}

/// When a failed Validation gate restores the pre-migration savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTrigger {
    /// Any Validation gate failure
    #[default]
    Any,
    /// Only when a failed check name matches `check_patterns`
    Matching,
    Never,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    #[serde(default)]
    pub on_validation_failure: RollbackTrigger,
    #[serde(default)]
    pub check_patterns: Vec<String>,
}

impl RollbackPolicy {
    /// Whether a failed Validation gate over `result` should roll back.
    pub fn applies(&self, result: &ValidationResult) -> bool {
        match self.on_validation_failure {
            RollbackTrigger::Any => true,
            RollbackTrigger::Never => false,
            RollbackTrigger::Matching => {
                let patterns: Vec<glob::Pattern> = self
                    .check_patterns
                    .iter()
                    .filter_map(|p| glob::Pattern::new(p).ok())
                    .collect();
                result
                    .failed_checks()
                    .any(|c| patterns.iter().any(|p| p.matches(&c.check_name)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub project_name: String,
    pub work_dir: PathBuf,
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub rest_endpoints: Vec<RestEndpoint>,
    #[serde(default)]
    pub attribute_mappings: Vec<AttributeMapping>,
    #[serde(default)]
    pub graphql_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql_schema_path: Option<PathBuf>,
    #[serde(default)]
    pub options: PipelineOptions,
    #[serde(default)]
    pub coverage_rules: Vec<ClientRule>,
    #[serde(default)]
    pub rollback: RollbackPolicy,
}

impl PipelineConfig {
    /// Load from `path`, resolve relative paths against its directory, and
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&content),
            _ => Self::parse_toml(&content),
        }
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON config")
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.work_dir.is_relative() {
            self.work_dir = base.join(&self.work_dir);
        }
        if let Some(schema) = &self.graphql_schema_path
            && schema.is_relative()
        {
            self.graphql_schema_path = Some(base.join(schema));
        }
        for repo in &mut self.repositories {
            if let Some(path) = &repo.path
                && path.is_relative()
            {
                repo.path = Some(base.join(path));
            }
        }
    }

    /// `SHIFT_MODEL` and `SHIFT_PHASE_TIMEOUT_SECS` override the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("SHIFT_MODEL")
            && !model.trim().is_empty()
        {
            self.options.model = model;
        }
        if let Ok(secs) = std::env::var("SHIFT_PHASE_TIMEOUT_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(secs) => self.options.phase_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %secs, "Ignoring invalid SHIFT_PHASE_TIMEOUT_SECS"),
            }
        }
    }

    /// CLI `--timeout` wins over file and environment.
    pub fn with_timeout_override(mut self, timeout_secs: Option<u64>) -> Self {
        if let Some(secs) = timeout_secs {
            self.options.phase_timeout_secs = secs;
        }
        self
    }

    /// Worker command (file → `CLAUDE_CMD` → `claude`).
    pub fn agent_cmd(&self) -> String {
        self.options
            .agent_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.options.phase_timeout_secs)
    }

    pub fn repo_path(&self, repo: &RepositoryConfig) -> PathBuf {
        repo.path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("repos").join(&repo.name))
    }

    /// `(name, checkout path)` for every repository.
    pub fn repo_paths(&self) -> Vec<(String, PathBuf)> {
        self.repositories
            .iter()
            .map(|r| (r.name.clone(), self.repo_path(r)))
            .collect()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.work_dir.join("runs")
    }

    pub fn submissions_dir(&self) -> PathBuf {
        self.work_dir.join("submissions")
    }

    pub fn progress_file(&self) -> PathBuf {
        self.work_dir.join("progress.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.work_dir.join("run.lock")
    }

    /// Problems that make the configuration unusable. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.project_name.trim().is_empty() {
            errors.push("project_name cannot be empty".to_string());
        }
        if self.repositories.is_empty() {
            errors.push("repositories cannot be empty".to_string());
        }

        let mut repo_names = HashSet::new();
        for repo in &self.repositories {
            if !repo_names.insert(repo.name.as_str()) {
                errors.push(format!("Duplicate repository name '{}'", repo.name));
            }
        }

        let mut endpoint_ids = HashSet::new();
        for endpoint in &self.rest_endpoints {
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                errors.push(format!("Duplicate endpoint id '{}'", endpoint.id));
            }
            if endpoint.patterns.is_empty() {
                errors.push(format!(
                    "Endpoint '{}' has no search patterns",
                    endpoint.id
                ));
            }
        }

        for mapping in &self.attribute_mappings {
            if !endpoint_ids.contains(mapping.endpoint_id.as_str()) {
                errors.push(format!(
                    "Mapping '{}' → '{}' references unknown endpoint '{}'",
                    mapping.rest_attribute, mapping.graphql_field, mapping.endpoint_id
                ));
            }
        }

        for rule in &self.coverage_rules {
            if !repo_names.contains(rule.client.as_str()) {
                errors.push(format!(
                    "Coverage rule names unknown repository '{}'",
                    rule.client
                ));
            }
        }

        for pattern in &self.rollback.check_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(format!("Invalid rollback check pattern '{}': {}", pattern, e));
            }
        }

        if self.options.phase_timeout_secs == 0 {
            errors.push("options.phase_timeout_secs must be greater than 0".to_string());
        }
        if self.options.build_checks && self.options.gradle_cmd.trim().is_empty() {
            errors.push("options.gradle_cmd cannot be empty when build_checks is on".to_string());
        }
        if self.options.max_turns_per_phase == 0 {
            errors.push("options.max_turns_per_phase must be greater than 0".to_string());
        }

        errors
    }
}
