//! Experiment documents and their status state machine.
//!
//! An experiment wraps one evolution candidate from enqueue through
//! evaluation and the promotion decision. Status moves through a closed
//! enum with an explicit transition table; an illegal transition is a
//! programming error surfaced as a typed failure, never a silent field
//! assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::genome::StrategyGenome;

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Promoted,
    Archived,
    Rejected,
    Failed,
}

impl ExperimentStatus {
    /// Valid edges: pending→running, running→{completed, failed},
    /// completed→{promoted, rejected}.
    pub fn can_transition(self, to: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Promoted)
                | (Completed, Rejected)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("invalid status transition {from:?} -> {to:?} on experiment {experiment_id}")]
    InvalidTransition {
        experiment_id: String,
        from: ExperimentStatus,
        to: ExperimentStatus,
    },
    #[error("experiment not found: {0}")]
    NotFound(String),
}

/// A not-yet-persisted genome variant produced by the mutation engine.
/// Owned by the generating cycle until enqueued as an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionCandidate {
    pub genome: StrategyGenome,
    pub parent_id: Option<String>,
    /// Ordered labels of the mutation operations that produced this genome
    pub operations: Vec<String>,
    #[serde(default)]
    pub horizon: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Timestamped free-form note on an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentNote {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Persisted wrapper around a candidate under evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub candidate: EvolutionCandidate,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Ancestor genome ids, oldest first
    #[serde(default)]
    pub lineage: Vec<String>,
    #[serde(default)]
    pub notes: Vec<ExperimentNote>,
    /// Error context captured when evaluation fails
    #[serde(default)]
    pub insights: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// Wrap a candidate as a new pending experiment
    pub fn from_candidate(candidate: EvolutionCandidate) -> Self {
        let now = Utc::now();
        Self {
            experiment_id: Uuid::new_v4().to_string(),
            candidate,
            status: ExperimentStatus::Pending,
            score: 0.0,
            metrics: HashMap::new(),
            lineage: Vec::new(),
            notes: Vec::new(),
            insights: None,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validated status transition; stamps updated_at on success
    pub fn transition(&mut self, to: ExperimentStatus) -> Result<(), ExperimentError> {
        if !self.status.can_transition(to) {
            return Err(ExperimentError::InvalidTransition {
                experiment_id: self.experiment_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a note without touching any other field
    pub fn push_note(&mut self, text: &str) {
        self.notes.push(ExperimentNote {
            timestamp: Utc::now(),
            text: text.to_string(),
        });
        self.updated_at = Utc::now();
    }

    pub fn strategy_id(&self) -> &str {
        &self.candidate.genome.id
    }
}
