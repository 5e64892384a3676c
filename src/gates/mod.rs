//! Per-phase admission checks.
//!
//! A gate looks only at the decoded result in hand (plus the persisted
//! Discovery result for the coverage rule) and is a pure function of its
//! inputs. The first violated rule is returned as a [`GateError`].

pub mod coverage;

use crate::errors::GateError;
use crate::phase::PipelinePhase;
use crate::schema::{
    DiscoveryResult, GenerationResult, MigrationResult, NarrowingResult, PhaseResult,
    ValidationResult,
};
use coverage::ClientRule;

/// A passed gate, with any non-blocking observations to record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateVerdict {
    pub notes: Vec<String>,
}

/// Results a gate may consult besides the one being checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateContext<'a> {
    /// Validated result of the preceding phase
    pub predecessor: Option<&'a PhaseResult>,
    /// Persisted Discovery result, used by the coverage rule
    pub discovery: Option<&'a DiscoveryResult>,
}

pub struct GateValidator {
    coverage_rules: Vec<ClientRule>,
}

impl GateValidator {
    pub fn new(coverage_rules: Vec<ClientRule>) -> Self {
        Self { coverage_rules }
    }

    pub fn has_coverage_rules(&self) -> bool {
        !self.coverage_rules.is_empty()
    }

    pub fn check(
        &self,
        result: &PhaseResult,
        ctx: GateContext<'_>,
    ) -> Result<GateVerdict, GateError> {
        match result {
            PhaseResult::Discovery(r) => check_discovery(r),
            PhaseResult::Narrowing(r) => check_narrowing(r),
            PhaseResult::Generation(r) => check_generation(r),
            PhaseResult::Migration(r) => Ok(check_migration(r)),
            PhaseResult::Validation(r) => self.check_validation(r, ctx),
        }
    }

    fn check_validation(
        &self,
        result: &ValidationResult,
        ctx: GateContext<'_>,
    ) -> Result<GateVerdict, GateError> {
        let phase = PipelinePhase::Validation;

        if self.has_coverage_rules() {
            let usages = ctx.discovery.map(|d| d.usages.as_slice()).unwrap_or(&[]);
            let uncovered: Vec<String> = coverage::compare(&self.coverage_rules, usages)
                .into_iter()
                .filter(|c| c.is_uncovered())
                .map(|c| c.client)
                .collect();
            if !uncovered.is_empty() {
                return Err(GateError::new(
                    phase,
                    "client_coverage",
                    format!("0% endpoint coverage for: {}", uncovered.join(", ")),
                ));
            }
        }

        if result.checks.is_empty() {
            return Err(GateError::new(phase, "min_checks", "no validation checks reported"));
        }

        let failed: Vec<&str> = result
            .failed_checks()
            .map(|c| c.check_name.as_str())
            .collect();
        if !failed.is_empty() {
            return Err(GateError::new(
                phase,
                "checks_passed",
                format!("failed checks: {}", failed.join(", ")),
            ));
        }

        Ok(GateVerdict::default())
    }
}

fn check_discovery(result: &DiscoveryResult) -> Result<GateVerdict, GateError> {
    if result.usages.is_empty() {
        return Err(GateError::new(
            PipelinePhase::Discovery,
            "min_usages",
            "no usages found",
        ));
    }
    Ok(GateVerdict::default())
}

fn check_narrowing(result: &NarrowingResult) -> Result<GateVerdict, GateError> {
    if result.narrowed_usages.is_empty() {
        return Err(GateError::new(
            PipelinePhase::Narrowing,
            "min_narrowed_usages",
            "no usages with complete attribute mappings",
        ));
    }
    Ok(GateVerdict::default())
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn check_generation(result: &GenerationResult) -> Result<GateVerdict, GateError> {
    let phase = PipelinePhase::Generation;
    if result.generated_migrations.is_empty() {
        return Err(GateError::new(phase, "min_migrations", "no migrations generated"));
    }

    // One degenerate entry rejects the whole batch.
    for (i, m) in result.generated_migrations.iter().enumerate() {
        if is_blank(&m.graphql_query) {
            return Err(GateError::new(
                phase,
                "non_empty_query",
                format!("migration #{} ({} in {}) has an empty graphql_query", i, m.endpoint_id, m.file),
            ));
        }
        if is_blank(&m.new_code) {
            return Err(GateError::new(
                phase,
                "non_empty_code",
                format!("migration #{} ({} in {}) has empty new_code", i, m.endpoint_id, m.file),
            ));
        }
    }
    Ok(GateVerdict::default())
}

fn check_migration(result: &MigrationResult) -> GateVerdict {
    let failed: Vec<String> = result
        .failed()
        .map(|m| format!("{}:{}", m.repo, m.file))
        .collect();
    if failed.is_empty() {
        return GateVerdict::default();
    }
    GateVerdict {
        notes: vec![format!(
            "{} migration(s) failed to apply: {}",
            failed.len(),
            failed.join(", ")
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::decode;
    use serde_json::{Value, json};

    fn result(phase: PipelinePhase, raw: Value) -> PhaseResult {
        decode(phase, raw).unwrap()
    }

    fn generated(query: &str, code: &str) -> Value {
        json!({
            "endpoint_id": "get-user",
            "repo": "web",
            "file": "src/users.js",
            "graphql_query": query,
            "new_code": code
        })
    }

    fn validator() -> GateValidator {
        GateValidator::new(Vec::new())
    }

    #[test]
    fn test_empty_discovery_fails_with_reason() {
        let r = result(
            PipelinePhase::Discovery,
            json!({"phase": "discovery", "usages": []}),
        );
        let err = validator().check(&r, GateContext::default()).unwrap_err();
        assert_eq!(err.phase, PipelinePhase::Discovery);
        assert_eq!(err.rule, "min_usages");
        assert_eq!(err.reason, "no usages found");
    }

    #[test]
    fn test_empty_narrowing_fails() {
        let r = result(
            PipelinePhase::Narrowing,
            json!({"phase": "narrowing", "narrowed_usages": []}),
        );
        let err = validator().check(&r, GateContext::default()).unwrap_err();
        assert_eq!(err.rule, "min_narrowed_usages");
    }

    #[test]
    fn test_generation_rejects_whole_batch_for_one_empty_code() {
        let r = result(
            PipelinePhase::Generation,
            json!({
                "phase": "generation",
                "generated_migrations": [
                    generated("query { user { id } }", "const u = await gql(q);"),
                    generated("query { user { name } }", ""),
                    generated("query { user { email } }", "const e = await gql(q);"),
                ]
            }),
        );
        let err = validator().check(&r, GateContext::default()).unwrap_err();
        assert_eq!(err.rule, "non_empty_code");
        assert!(err.reason.contains("#1"));
    }

    #[test]
    fn test_generation_whitespace_query_is_empty() {
        let r = result(
            PipelinePhase::Generation,
            json!({
                "phase": "generation",
                "generated_migrations": [generated("  \n\t", "x()")]
            }),
        );
        let err = validator().check(&r, GateContext::default()).unwrap_err();
        assert_eq!(err.rule, "non_empty_query");
    }

    #[test]
    fn test_generation_passes_when_all_complete() {
        let r = result(
            PipelinePhase::Generation,
            json!({
                "phase": "generation",
                "generated_migrations": [generated("query { a }", "a()")]
            }),
        );
        assert!(validator().check(&r, GateContext::default()).is_ok());
    }

    #[test]
    fn test_migration_failures_are_non_blocking() {
        let r = result(
            PipelinePhase::Migration,
            json!({
                "phase": "migration",
                "applied_migrations": [
                    {"endpoint_id": "a", "repo": "web", "file": "1.js", "status": "applied"},
                    {"endpoint_id": "b", "repo": "web", "file": "2.js", "status": "applied"},
                    {"endpoint_id": "c", "repo": "web", "file": "3.js", "status": "failed"}
                ]
            }),
        );
        let verdict = validator().check(&r, GateContext::default()).unwrap();
        assert_eq!(verdict.notes.len(), 1);
        assert!(verdict.notes[0].contains("web:3.js"));
    }

    #[test]
    fn test_validation_requires_checks_and_all_passed() {
        let empty = result(
            PipelinePhase::Validation,
            json!({"phase": "validation", "checks": []}),
        );
        assert_eq!(
            validator()
                .check(&empty, GateContext::default())
                .unwrap_err()
                .rule,
            "min_checks"
        );

        let failing = result(
            PipelinePhase::Validation,
            json!({"phase": "validation", "checks": [
                {"check_name": "gradle-build", "passed": false, "details": "3.js: cannot resolve symbol"},
                {"check_name": "lint", "passed": true}
            ]}),
        );
        let err = validator()
            .check(&failing, GateContext::default())
            .unwrap_err();
        assert_eq!(err.rule, "checks_passed");
        assert!(err.reason.contains("gradle-build"));
    }

    #[test]
    fn test_validation_coverage_uses_discovery() {
        let gates = GateValidator::new(vec![
            ClientRule {
                client: "web".to_string(),
                endpoints: vec!["get-user".to_string()],
            },
            ClientRule {
                client: "mobile".to_string(),
                endpoints: vec!["get-user".to_string()],
            },
        ]);
        let discovery = result(
            PipelinePhase::Discovery,
            json!({"phase": "discovery", "usages": [{
                "endpoint_id": "get-user", "repo": "web", "file": "a.js",
                "line": 1, "snippet": "", "language": "javascript"
            }]}),
        );
        let validation = result(
            PipelinePhase::Validation,
            json!({"phase": "validation", "checks": [{"check_name": "build", "passed": true}]}),
        );
        let ctx = GateContext {
            predecessor: None,
            discovery: discovery.as_discovery(),
        };
        let err = gates.check(&validation, ctx).unwrap_err();
        assert_eq!(err.rule, "client_coverage");
        assert!(err.reason.contains("mobile"));
        assert!(!err.reason.contains("web"));
    }

    #[test]
    fn test_check_is_deterministic() {
        let r = result(
            PipelinePhase::Discovery,
            json!({"phase": "discovery", "usages": []}),
        );
        let gates = validator();
        let first = gates.check(&r, GateContext::default());
        let second = gates.check(&r, GateContext::default());
        assert_eq!(first, second);
    }
}
