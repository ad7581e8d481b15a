//! Judge collaborator used to classify evaluation output.
//!
//! The dispatcher only sees the [`Judge`] trait. [`openai::OpenAiJudge`] is
//! the shipped implementation; tests substitute fixed-score judges.

pub mod openai;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Criteria and model selection for one judge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JudgeCriteria {
    /// Criteria the output is scored against.
    pub criteria: Vec<String>,
    /// Model override; the judge's default applies when `None`.
    pub model: Option<String>,
}

/// A judge's scored assessment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JudgeVerdict {
    /// Score in `0..=1`.
    pub overall_score: f64,
    /// What the output did well.
    #[serde(default)]
    pub strengths: Vec<String>,
    /// What the output did poorly.
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Model-backed scorer.
pub trait Judge: Send + Sync {
    /// Score `output` as a solution to `task` under `criteria`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`](crate::AppError::Validation) when the
    /// judge cannot produce a score. A low score is not an error.
    fn evaluate(
        &self,
        task: &str,
        output: &str,
        criteria: &JudgeCriteria,
    ) -> Pin<Box<dyn Future<Output = Result<JudgeVerdict>> + Send + '_>>;
}

/// Classify a score: passed when `score >= threshold`.
#[must_use]
pub fn classify(score: f64, threshold: f64) -> bool {
    score >= threshold
}
