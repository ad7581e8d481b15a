//! Persisted client identity and its evaluation definitions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::evaluation::EvaluationDefinition;
use crate::{AppError, Result};

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    /// Whether the credentials were accepted.
    pub valid: bool,
    /// Rejection reason when `valid` is false.
    pub reason: Option<String>,
}

impl CredentialCheck {
    /// Accepted credentials.
    #[must_use]
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    /// Rejected credentials with a reason.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// A logical automation client, one per definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Client {
    /// Base client identifier.
    pub client_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Shared secret; any secret is accepted when absent.
    #[serde(default, skip_serializing)]
    pub secret_key: Option<String>,
    /// Evaluations owned by the client.
    #[serde(default)]
    pub evaluations: Vec<EvaluationDefinition>,
}

impl Client {
    /// Check a presented secret against the stored one.
    #[must_use]
    pub fn check_secret(&self, presented: Option<&str>) -> CredentialCheck {
        match (self.secret_key.as_deref(), presented) {
            (None, _) => CredentialCheck::valid(),
            (Some(expected), Some(given)) if expected == given => CredentialCheck::valid(),
            (Some(_), Some(_)) => CredentialCheck::invalid("invalid secret key"),
            (Some(_), None) => CredentialCheck::invalid("secret key required"),
        }
    }

    /// Look up one of the client's evaluations.
    #[must_use]
    pub fn evaluation(&self, evaluation_id: &str) -> Option<&EvaluationDefinition> {
        self.evaluations.iter().find(|e| e.id == evaluation_id)
    }

    /// Reject definitions that cannot be dispatched unambiguously.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the client id is blank, an evaluation has
    /// a blank id or tool, or two evaluations share an id.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AppError::Store("client_id must not be empty".into()));
        }
        if self.client_id.contains(':') {
            return Err(AppError::Store(format!(
                "client_id '{}' must not contain ':'",
                self.client_id
            )));
        }

        let mut seen = HashSet::new();
        for evaluation in &self.evaluations {
            if evaluation.id.trim().is_empty() {
                return Err(AppError::Store(format!(
                    "client '{}' has an evaluation with an empty id",
                    self.client_id
                )));
            }
            if evaluation.tool.trim().is_empty() {
                return Err(AppError::Store(format!(
                    "evaluation '{}' of client '{}' has no tool",
                    evaluation.id, self.client_id
                )));
            }
            if !seen.insert(evaluation.id.as_str()) {
                return Err(AppError::Store(format!(
                    "client '{}' defines evaluation '{}' twice",
                    self.client_id, evaluation.id
                )));
            }
        }
        Ok(())
    }
}
