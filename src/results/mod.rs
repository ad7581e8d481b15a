//! Durable log of finished evaluation runs.
//!
//! Provides the [`ResultLogger`] trait and the [`ResultEntry`] record. The
//! shipped implementation, [`JsonlResultWriter`], appends one JSON object per
//! finished run to daily-rotating files under the configured results
//! directory.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::evaluation::{EvaluationRecord, EvaluationStatus, ValidationOutcome};
use crate::protocol::EvaluateResult;

/// One finished evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Composite client id the run was dispatched to.
    pub client_id: String,
    /// Evaluation definition id.
    pub evaluation_id: String,
    /// `completed` or `failed`.
    pub status: EvaluationStatus,
    /// Wall-clock duration measured by the server.
    pub duration_ms: Option<u64>,
    /// Agent response, for completed runs.
    pub response: Option<EvaluateResult>,
    /// Judge verdict, when validation ran.
    pub validation: Option<ValidationOutcome>,
    /// Failure reason, for failed runs.
    pub error: Option<String>,
}

impl ResultEntry {
    /// Snapshot a finished tracker record.
    #[must_use]
    pub fn from_record(record: &EvaluationRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            client_id: record.client_id.clone(),
            evaluation_id: record.evaluation_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms,
            response: record.response.clone(),
            validation: record.validation.clone(),
            error: record.error.clone(),
        }
    }
}

/// Writes finished runs to a persistent sink.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait ResultLogger: Send + Sync {
    /// Record one finished run.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_result(&self, entry: &ResultEntry) -> crate::Result<()>;
}

pub use writer::JsonlResultWriter;
