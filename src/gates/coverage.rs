//! Client endpoint coverage: which of a client's expected endpoints were
//! actually observed during discovery.

use crate::schema::Usage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Endpoints a client repository is expected to call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRule {
    /// Repository name of the client
    pub client: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientCoverage {
    pub client: String,
    pub expected: usize,
    pub found: Vec<String>,
    pub missing: Vec<String>,
    pub coverage_pct: f64,
}

impl ClientCoverage {
    pub fn is_uncovered(&self) -> bool {
        self.expected > 0 && self.found.is_empty()
    }
}

/// Compare each rule against the discovered usages.
///
/// A client with no expected endpoints is vacuously fully covered.
pub fn compare(rules: &[ClientRule], usages: &[Usage]) -> Vec<ClientCoverage> {
    rules
        .iter()
        .map(|rule| {
            let seen: BTreeSet<&str> = usages
                .iter()
                .filter(|u| u.repo == rule.client)
                .map(|u| u.endpoint_id.as_str())
                .collect();

            let expected: BTreeSet<&str> = rule.endpoints.iter().map(String::as_str).collect();
            let (found, missing): (Vec<&str>, Vec<&str>) =
                expected.iter().copied().partition(|id| seen.contains(id));

            let coverage_pct = if expected.is_empty() {
                100.0
            } else {
                found.len() as f64 / expected.len() as f64 * 100.0
            };

            ClientCoverage {
                client: rule.client.clone(),
                expected: expected.len(),
                found: found.into_iter().map(String::from).collect(),
                missing: missing.into_iter().map(String::from).collect(),
                coverage_pct,
            }
        })
        .collect()
}
