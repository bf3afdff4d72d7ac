//! Persisted pipeline state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::ErrorKind;

/// Lifecycle of a pipeline run.
///
/// Transitions only go `pending -> processing -> {completed, failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Not started.
    #[default]
    Pending,
    /// Steps are running.
    Processing,
    /// Every step succeeded.
    Completed,
    /// A step failed; later steps never ran.
    Failed,
}

impl PipelineStatus {
    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A step that returned successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    /// Step id.
    pub step: String,
    /// The unit that ran it.
    pub target: String,
    /// The operation.
    pub operation: String,
    /// What it returned.
    pub result: serde_json::Value,
    /// When it returned.
    pub completed_at: DateTime<Utc>,
}

/// A step that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Step id.
    pub step: String,
    /// The unit it was addressed to.
    pub target: String,
    /// The operation.
    pub operation: String,
    /// Error description.
    pub error: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// When it failed.
    pub failed_at: DateTime<Utc>,
}

/// The state an orchestrator persists for its run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Current status.
    pub status: PipelineStatus,
    /// Logical name of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// Completed steps, in execution order.
    #[serde(default)]
    pub completed: Vec<CompletedStep>,
    /// Step errors, in execution order. Fail-fast keeps this at most one long.
    #[serde(default)]
    pub errors: Vec<StepError>,
    /// When processing started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Results of completed steps keyed by step id.
    #[must_use]
    pub fn results(&self) -> BTreeMap<String, serde_json::Value> {
        self.completed
            .iter()
            .map(|c| (c.step.clone(), c.result.clone()))
            .collect()
    }

    /// The first recorded failure.
    #[must_use]
    pub fn failure(&self) -> Option<&StepError> {
        self.errors.first()
    }
}

/// Aggregate outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// The orchestrator identity.
    pub identity: String,
    /// Every step's output keyed by step id.
    pub results: BTreeMap<String, serde_json::Value>,
    /// The completed-step log.
    pub completed: Vec<CompletedStep>,
}

impl PipelineResult {
    /// Builds the result from a completed state.
    #[must_use]
    pub fn from_state(identity: impl Into<String>, state: &PipelineState) -> Self {
        Self {
            identity: identity.into(),
            results: state.results(),
            completed: state.completed.clone(),
        }
    }
}
