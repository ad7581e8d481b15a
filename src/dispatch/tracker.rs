//! Per-(connection, evaluation) status bookkeeping.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::debug;

use crate::models::evaluation::{EvaluationRecord, EvaluationStatus};
use crate::{AppError, Result};

type Key = (String, String);

/// Last-known record of every evaluation dispatched by this server,
/// keyed by composite client id and evaluation id.
#[derive(Debug, Default)]
pub struct EvaluationTracker {
    records: Mutex<Records>,
}

#[derive(Debug, Default)]
struct Records {
    by_key: HashMap<Key, EvaluationRecord>,
    last_run_id: u64,
}

impl EvaluationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an evaluation to `Running` and return the fresh record.
    ///
    /// A terminal record is reset to `Pending` first; re-runs keep the id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotReady` if the evaluation is already running on
    /// this connection.
    pub fn begin(&self, client_id: &str, evaluation_id: &str) -> Result<EvaluationRecord> {
        let mut records = self.lock();
        let Records {
            by_key,
            last_run_id,
        } = &mut *records;
        let record = by_key
            .entry(key(client_id, evaluation_id))
            .or_insert_with(|| EvaluationRecord::pending(client_id, evaluation_id));

        if record.status.is_terminal() {
            *record = EvaluationRecord::pending(client_id, evaluation_id);
        }
        if !record.status.can_transition_to(EvaluationStatus::Running) {
            return Err(AppError::NotReady(format!(
                "evaluation '{evaluation_id}' is already running on {client_id}"
            )));
        }

        *last_run_id += 1;
        record.status = EvaluationStatus::Running;
        record.run_id = Some(*last_run_id);
        record.started_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Store a terminal record produced by the dispatcher.
    ///
    /// Ignored unless the tracked record is still `Running` under the same
    /// run id that [`begin`](Self::begin) handed out, so neither a manual
    /// reset nor a newer run is overwritten by a late result. Progress and
    /// message reported by `status` frames during the run are kept. Returns
    /// whether the record was stored.
    pub fn finish(&self, mut record: EvaluationRecord) -> bool {
        let mut records = self.lock();
        let k = key(&record.client_id, &record.evaluation_id);
        match records.by_key.get_mut(&k) {
            Some(current)
                if current.run_id == record.run_id
                    && current.status.can_transition_to(record.status) =>
            {
                record.progress = current.progress.take().or(record.progress);
                record.message = current.message.take().or(record.message);
                *current = record;
                true
            }
            _ => {
                debug!(
                    client_id = %record.client_id,
                    evaluation_id = %record.evaluation_id,
                    "evaluation no longer running, result discarded"
                );
                false
            }
        }
    }

    /// Apply a proactive `status` frame. Only a `Running` record is touched,
    /// and only its progress and message change.
    pub fn update_progress(
        &self,
        client_id: &str,
        evaluation_id: &str,
        progress: Option<f64>,
        message: Option<String>,
    ) -> bool {
        let mut records = self.lock();
        match records.by_key.get_mut(&key(client_id, evaluation_id)) {
            Some(record) if record.status == EvaluationStatus::Running => {
                if progress.is_some() {
                    record.progress = progress;
                }
                if message.is_some() {
                    record.message = message;
                }
                true
            }
            _ => false,
        }
    }

    /// Reset every tracked record of `evaluation_id` that belongs to
    /// `client`, which is either a composite id or a base client id (all
    /// tabs).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when nothing matched.
    pub fn reset(&self, client: &str, evaluation_id: &str) -> Result<Vec<EvaluationRecord>> {
        let mut records = self.lock();
        let mut reset: Vec<EvaluationRecord> = records
            .by_key
            .iter_mut()
            .filter(|((owner, eval), _)| eval == evaluation_id && owner_matches(owner, client))
            .map(|((owner, _), record)| {
                *record = EvaluationRecord::pending(owner, evaluation_id);
                record.clone()
            })
            .collect();

        if reset.is_empty() {
            return Err(AppError::NotFound(format!(
                "no tracked evaluation '{evaluation_id}' for client '{client}'"
            )));
        }
        reset.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(reset)
    }

    /// Current record of one evaluation on one connection.
    #[must_use]
    pub fn get(&self, client_id: &str, evaluation_id: &str) -> Option<EvaluationRecord> {
        self.lock().by_key.get(&key(client_id, evaluation_id)).cloned()
    }

    /// All records, optionally restricted to one client, ordered by key.
    #[must_use]
    pub fn list(&self, client: Option<&str>) -> Vec<EvaluationRecord> {
        let mut list: Vec<EvaluationRecord> = self
            .lock()
            .by_key
            .iter()
            .filter(|((owner, _), _)| client.is_none_or(|c| owner_matches(owner, c)))
            .map(|(_, record)| record.clone())
            .collect();
        list.sort_by(|a, b| {
            (a.client_id.as_str(), a.evaluation_id.as_str())
                .cmp(&(b.client_id.as_str(), b.evaluation_id.as_str()))
        });
        list
    }

    /// Number of records currently `Running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.lock()
            .by_key
            .values()
            .filter(|record| record.status == EvaluationStatus::Running)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(client_id: &str, evaluation_id: &str) -> Key {
    (client_id.to_owned(), evaluation_id.to_owned())
}

fn owner_matches(owner: &str, client: &str) -> bool {
    owner == client
        || owner
            .strip_prefix(client)
            .is_some_and(|rest| rest.starts_with(':'))
}
