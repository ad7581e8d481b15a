//! Evaluation definitions, lifecycle status, and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::EvaluateResult;

/// Pass threshold applied when a validation block does not override it.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.7;

/// How an evaluation's output is classified.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationType {
    /// Score the output with the judge model.
    LlmJudge,
    /// Judge scoring combined with agent-side checks; judged like `llm-judge`.
    Hybrid,
    /// Output is stored without classification.
    #[default]
    None,
}

/// Validation block of an evaluation definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ValidationSpec {
    /// Validation strategy.
    #[serde(rename = "type", default)]
    pub kind: ValidationType,
    /// Criteria handed to the judge.
    #[serde(default)]
    pub criteria: Vec<String>,
    /// Minimum score that counts as passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Judge model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ValidationSpec {
    /// Whether this block requires a judge call.
    #[must_use]
    pub fn uses_judge(&self) -> bool {
        matches!(self.kind, ValidationType::LlmJudge | ValidationType::Hybrid)
    }

    /// Effective pass threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_PASS_THRESHOLD)
    }
}

/// A stored evaluation definition owned by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationDefinition {
    /// Identifier, unique within the owning client.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Task description handed to the judge alongside the name.
    #[serde(default)]
    pub description: String,
    /// Agent tool to run.
    pub tool: String,
    /// Page the agent should operate on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Tool arguments.
    #[serde(default)]
    pub input: Value,
    /// RPC window in milliseconds; the dispatcher default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Free-form metadata forwarded to the agent.
    #[serde(default)]
    pub metadata: Value,
    /// Output classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
}

/// Lifecycle status of one evaluation on one connection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    /// Not yet dispatched, or reset for a re-run.
    #[default]
    Pending,
    /// An `evaluate` call is in flight.
    Running,
    /// The call returned and validation (if any) ran.
    Completed,
    /// The call or its validation failed.
    Failed,
}

impl EvaluationStatus {
    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Terminal states may only go back to `Pending` (a re-run); `Running`
    /// may be reset to `Pending` manually.
    #[must_use]
    pub fn can_transition_to(self, next: EvaluationStatus) -> bool {
        matches!(
            (self, next),
            (EvaluationStatus::Pending, EvaluationStatus::Running)
                | (
                    EvaluationStatus::Running,
                    EvaluationStatus::Completed
                        | EvaluationStatus::Failed
                        | EvaluationStatus::Pending
                )
                | (
                    EvaluationStatus::Completed | EvaluationStatus::Failed,
                    EvaluationStatus::Pending
                )
        )
    }

    /// Whether the status is `Completed` or `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, EvaluationStatus::Completed | EvaluationStatus::Failed)
    }
}

/// Judge verdict attached to a completed evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ValidationOutcome {
    /// `score >= threshold`.
    pub passed: bool,
    /// Judge score in `0..=1`.
    pub score: f64,
    /// Threshold the score was compared against.
    pub threshold: f64,
    /// Strengths noted by the judge.
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Weaknesses noted by the judge.
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Last-known state of one evaluation on one connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationRecord {
    /// Composite client id of the connection the evaluation ran on.
    pub client_id: String,
    /// Evaluation definition id.
    pub evaluation_id: String,
    /// Lifecycle status.
    pub status: EvaluationStatus,
    /// Last progress reported by a `status` frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Last message reported by a `status` frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Tracker-assigned number of the current or last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    /// When the current or last run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the last finished run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Agent response of the last completed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<EvaluateResult>,
    /// Judge verdict of the last completed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    /// Error of the last failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationRecord {
    /// A fresh `Pending` record.
    #[must_use]
    pub fn pending(client_id: &str, evaluation_id: &str) -> Self {
        Self {
            client_id: client_id.to_owned(),
            evaluation_id: evaluation_id.to_owned(),
            status: EvaluationStatus::Pending,
            progress: None,
            message: None,
            run_id: None,
            started_at: None,
            duration_ms: None,
            response: None,
            validation: None,
            error: None,
        }
    }
}
