//! Phase result shapes exchanged between the worker and the orchestrator.
//!
//! Every result is a [`PhaseResult`] discriminated by its `phase` tag. Each
//! variant declares the fields the gates rely on; any other keys the worker
//! adds are kept verbatim in an `extra` map so they survive persistence
//! untouched. Item types carry their own `extra` map for the same reason.

use crate::errors::DecodeError;
use crate::phase::PipelinePhase;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unvalidated enrichment fields attached by the worker.
pub type Extra = serde_json::Map<String, Value>;

/// One located call site of a tracked REST endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub endpoint_id: String,
    pub repo: String,
    pub file: String,
    pub line: u32,
    pub snippet: String,
    pub language: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Estimated effort to migrate a usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// A usage whose attributes all have GraphQL mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowedUsage {
    pub endpoint_id: String,
    pub repo: String,
    pub file: String,
    pub line: u32,
    pub snippet: String,
    pub language: String,
    /// Ids of the attribute mappings that cover this usage
    pub matched_mappings: Vec<String>,
    pub complexity: Complexity,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Proposed replacement code for one narrowed usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMigration {
    pub endpoint_id: String,
    pub repo: String,
    pub file: String,
    pub graphql_query: String,
    pub new_code: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Outcome of applying one generated migration to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub endpoint_id: String,
    pub repo: String,
    pub file: String,
    pub status: MigrationStatus,
    #[serde(default)]
    pub diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A named pass/fail check produced by the Validation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub check_name: String,
    pub passed: bool,
    #[serde(default)]
    pub details: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub usages: Vec<Usage>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub narrowed_usages: Vec<NarrowedUsage>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub generated_migrations: Vec<GeneratedMigration>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub applied_migrations: Vec<AppliedMigration>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl MigrationResult {
    pub fn count(&self, status: MigrationStatus) -> usize {
        self.applied_migrations
            .iter()
            .filter(|m| m.status == status)
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &AppliedMigration> {
        self.applied_migrations
            .iter()
            .filter(|m| m.status == MigrationStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub checks: Vec<ValidationCheck>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ValidationResult {
    pub fn failed_checks(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// A phase's validated output, tagged by `phase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum PhaseResult {
    Discovery(DiscoveryResult),
    Narrowing(NarrowingResult),
    Generation(GenerationResult),
    Migration(MigrationResult),
    Validation(ValidationResult),
}

impl PhaseResult {
    pub fn phase(&self) -> PipelinePhase {
        match self {
            PhaseResult::Discovery(_) => PipelinePhase::Discovery,
            PhaseResult::Narrowing(_) => PipelinePhase::Narrowing,
            PhaseResult::Generation(_) => PipelinePhase::Generation,
            PhaseResult::Migration(_) => PipelinePhase::Migration,
            PhaseResult::Validation(_) => PipelinePhase::Validation,
        }
    }

    /// Number of primary entries (usages, migrations, checks).
    pub fn item_count(&self) -> usize {
        match self {
            PhaseResult::Discovery(r) => r.usages.len(),
            PhaseResult::Narrowing(r) => r.narrowed_usages.len(),
            PhaseResult::Generation(r) => r.generated_migrations.len(),
            PhaseResult::Migration(r) => r.applied_migrations.len(),
            PhaseResult::Validation(r) => r.checks.len(),
        }
    }

    /// One-line description for progress records and logs.
    pub fn summary(&self) -> String {
        match self {
            PhaseResult::Discovery(r) => format!("{} usages discovered", r.usages.len()),
            PhaseResult::Narrowing(r) => {
                format!("{} usages with complete mappings", r.narrowed_usages.len())
            }
            PhaseResult::Generation(r) => {
                format!("{} migrations generated", r.generated_migrations.len())
            }
            PhaseResult::Migration(r) => format!(
                "{} applied, {} skipped, {} failed",
                r.count(MigrationStatus::Applied),
                r.count(MigrationStatus::Skipped),
                r.count(MigrationStatus::Failed)
            ),
            PhaseResult::Validation(r) => format!(
                "{} of {} checks passed",
                r.checks.len() - r.failed_checks().count(),
                r.checks.len()
            ),
        }
    }

    pub fn as_discovery(&self) -> Option<&DiscoveryResult> {
        match self {
            PhaseResult::Discovery(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_migration(&self) -> Option<&MigrationResult> {
        match self {
            PhaseResult::Migration(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_validation(&self) -> Option<&ValidationResult> {
        match self {
            PhaseResult::Validation(r) => Some(r),
            _ => None,
        }
    }
}

/// Decode an untyped worker payload into the result variant for `phase`.
///
/// Fails when the payload is not an object, carries no or the wrong `phase`
/// tag, or when a required field is missing or of the wrong kind. Unknown
/// keys are preserved.
pub fn decode(phase: PipelinePhase, raw: Value) -> Result<PhaseResult, DecodeError> {
    let Value::Object(map) = &raw else {
        return Err(DecodeError::NotAnObject {
            found: json_kind(&raw).to_string(),
        });
    };

    let tag = map
        .get("phase")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingPhaseTag)?;
    if tag != phase.as_str() {
        return Err(DecodeError::WrongPhaseTag {
            expected: phase,
            found: tag.to_string(),
        });
    }

    serde_json::from_value(raw).map_err(|e| DecodeError::InvalidShape {
        phase,
        detail: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn discovery_payload() -> Value {
        json!({
            "phase": "discovery",
            "timestamp": "2026-01-01T00:00:00Z",
            "usages": [{
                "endpoint_id": "get-user",
                "repo": "frontend",
                "file": "src/api/users.js",
                "line": 42,
                "snippet": "fetch(`/api/v1/users/${id}`)",
                "language": "javascript",
                "confidence": 0.9
            }],
            "scan_stats": {"files_scanned": 120}
        })
    }

    #[test]
    fn test_decode_discovery_keeps_extra_fields() {
        let result = decode(PipelinePhase::Discovery, discovery_payload()).unwrap();
        let discovery = result.as_discovery().unwrap();
        assert_eq!(discovery.usages.len(), 1);
        assert_eq!(discovery.usages[0].line, 42);
        assert_eq!(discovery.extra["scan_stats"]["files_scanned"], 120);
        assert_eq!(discovery.usages[0].extra["confidence"], 0.9);
        assert!(!discovery.extra.contains_key("phase"));
    }

    #[test]
    fn test_serialize_restores_tag_and_extras() {
        let raw = discovery_payload();
        let result = decode(PipelinePhase::Discovery, raw.clone()).unwrap();
        let back = serde_json::to_value(&result).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let err = decode(PipelinePhase::Discovery, json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            DecodeError::NotAnObject {
                found: "array".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_missing_tag() {
        let err = decode(PipelinePhase::Discovery, json!({"usages": []})).unwrap_err();
        assert_eq!(err, DecodeError::MissingPhaseTag);
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let err = decode(
            PipelinePhase::Narrowing,
            json!({"phase": "discovery", "usages": []}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "wrong_phase_tag");
        assert!(err.to_string().contains("expected 'narrowing'"));
    }

    #[test]
    fn test_decode_rejects_missing_required_list() {
        let err = decode(
            PipelinePhase::Generation,
            json!({"phase": "generation", "notes": "ran out of turns"}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_shape");
        assert!(err.to_string().contains("generated_migrations"));
    }

    #[test]
    fn test_decode_rejects_wrong_field_kind() {
        let err = decode(
            PipelinePhase::Narrowing,
            json!({"phase": "narrowing", "narrowed_usages": "none"}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_shape");
    }

    #[test]
    fn test_decode_rejects_unknown_complexity() {
        let err = decode(
            PipelinePhase::Narrowing,
            json!({
                "phase": "narrowing",
                "narrowed_usages": [{
                    "endpoint_id": "get-user",
                    "repo": "frontend",
                    "file": "a.js",
                    "line": 1,
                    "snippet": "x",
                    "language": "javascript",
                    "matched_mappings": ["m1"],
                    "complexity": "extreme"
                }]
            }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_shape");
    }

    #[test]
    fn test_empty_discovery_decodes() {
        // Emptiness is a gate concern, not a shape concern.
        let result = decode(
            PipelinePhase::Discovery,
            json!({"phase": "discovery", "usages": []}),
        )
        .unwrap();
        assert_eq!(result.item_count(), 0);
        assert_eq!(result.phase(), PipelinePhase::Discovery);
    }

    #[test]
    fn test_migration_summary_counts_statuses() {
        let result = decode(
            PipelinePhase::Migration,
            json!({
                "phase": "migration",
                "applied_migrations": [
                    {"endpoint_id": "a", "repo": "r", "file": "1.js", "status": "applied", "diff": "+x", "commit": "abc"},
                    {"endpoint_id": "b", "repo": "r", "file": "2.js", "status": "applied", "diff": "+y", "commit": "def"},
                    {"endpoint_id": "c", "repo": "r", "file": "3.js", "status": "failed", "error": "conflict"}
                ]
            }),
        )
        .unwrap();
        assert_eq!(result.summary(), "2 applied, 0 skipped, 1 failed");
        let migration = result.as_migration().unwrap();
        assert_eq!(migration.failed().next().unwrap().file, "3.js");
    }

    #[test]
    fn test_validation_failed_checks() {
        let result = decode(
            PipelinePhase::Validation,
            json!({
                "phase": "validation",
                "checks": [
                    {"check_name": "build", "passed": true, "details": "ok"},
                    {"check_name": "tests", "passed": false}
                ]
            }),
        )
        .unwrap();
        let validation = result.as_validation().unwrap();
        let failed: Vec<_> = validation.failed_checks().map(|c| &c.check_name).collect();
        assert_eq!(failed, vec!["tests"]);
        assert_eq!(validation.checks[1].details, "");
        assert_eq!(result.summary(), "1 of 2 checks passed");
    }
}
