//! The fixed five-stage migration pipeline.
//!
//! Phases form a total order: `Discovery → Narrowing → Generation →
//! Migration → Validation`. The string ids returned by [`PipelinePhase::as_str`]
//! are the persisted lookup keys for results and progress records, so they
//! must never change.

use serde::{Deserialize, Serialize};

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Discovery,
    Narrowing,
    Generation,
    Migration,
    Validation,
}

impl PipelinePhase {
    /// All phases in execution order.
    pub const ALL: [PipelinePhase; 5] = [
        PipelinePhase::Discovery,
        PipelinePhase::Narrowing,
        PipelinePhase::Generation,
        PipelinePhase::Migration,
        PipelinePhase::Validation,
    ];

    /// Stable identifier used as the `phase` tag and as a storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Discovery => "discovery",
            PipelinePhase::Narrowing => "narrowing",
            PipelinePhase::Generation => "generation",
            PipelinePhase::Migration => "migration",
            PipelinePhase::Validation => "validation",
        }
    }

    /// Zero-based position in the pipeline.
    pub fn index(&self) -> usize {
        match self {
            PipelinePhase::Discovery => 0,
            PipelinePhase::Narrowing => 1,
            PipelinePhase::Generation => 2,
            PipelinePhase::Migration => 3,
            PipelinePhase::Validation => 4,
        }
    }

    /// The phase that runs after this one, `None` for Validation.
    pub fn next(&self) -> Option<PipelinePhase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// The phase whose result feeds this one, `None` for Discovery.
    pub fn prev(&self) -> Option<PipelinePhase> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// This phase and every phase after it.
    pub fn remaining(&self) -> &'static [PipelinePhase] {
        &Self::ALL[self.index()..]
    }

    /// Whether this phase mutates the source repositories.
    pub fn is_mutating(&self) -> bool {
        matches!(self, PipelinePhase::Migration)
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelinePhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discovery" => Ok(PipelinePhase::Discovery),
            "narrowing" => Ok(PipelinePhase::Narrowing),
            "generation" => Ok(PipelinePhase::Generation),
            "migration" => Ok(PipelinePhase::Migration),
            "validation" => Ok(PipelinePhase::Validation),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: discovery, narrowing, generation, migration, validation",
                s
            ),
        }
    }
}
