//! Evaluation dispatcher and result classification.
//!
//! Turns a stored [`EvaluationDefinition`] into an `evaluate` RPC call on one
//! ready connection, tracks its status, optionally scores the output with the
//! [`Judge`], and records the outcome. Every attempt that reaches the
//! connection leaves a stored record, successful or not.

pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DispatchConfig;
use crate::directory::{composite_client_id, Connection, ConnectionRegistry};
use crate::judge::{classify, Judge, JudgeCriteria};
use crate::models::evaluation::{
    EvaluationDefinition, EvaluationRecord, EvaluationStatus, ValidationOutcome,
};
use crate::models::progress::validate_progress;
use crate::protocol::rpc::METHOD_EVALUATE;
use crate::protocol::{EvaluateParams, EvaluateResult, StatusUpdate};
use crate::results::{ResultEntry, ResultLogger};
use crate::store::ClientStore;
use crate::{AppError, Result};

pub use tracker::EvaluationTracker;

/// Which evaluations a batch run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSelector {
    /// Every evaluation each client owns.
    All,
    /// Only the named evaluation, on clients that own it.
    Evaluation(String),
}

impl BatchSelector {
    /// Parse the operator form: `all` or an evaluation id.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Evaluation(raw.to_owned())
        }
    }

    fn selects(&self, definition: &EvaluationDefinition) -> bool {
        match self {
            Self::All => true,
            Self::Evaluation(id) => definition.id == *id,
        }
    }
}

/// Outcome of one dispatch attempt inside a batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchAttempt {
    /// Composite client id the attempt targeted.
    pub client_id: String,
    /// Evaluation definition id.
    pub evaluation_id: String,
    /// Terminal status, when the attempt got that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EvaluationStatus>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchAttempt {
    /// Whether the attempt failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Counters reported by the operator `status` command.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Open sockets, registered or not.
    pub connections: usize,
    /// Registered connections.
    pub registered: usize,
    /// Ready connections.
    pub ready: usize,
    /// Evaluations with an `evaluate` call in flight.
    pub running: usize,
    /// Evaluation records kept by the tracker.
    pub tracked: usize,
}

/// Dispatches evaluations to ready connections.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ClientStore>,
    judge: Option<Arc<dyn Judge>>,
    results: Option<Arc<dyn ResultLogger>>,
    tracker: EvaluationTracker,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher without a judge or result log.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ClientStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            store,
            judge: None,
            results: None,
            tracker: EvaluationTracker::new(),
            config,
        }
    }

    /// Attach the judge used for `llm-judge` and `hybrid` validation.
    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Attach a sink for finished runs.
    #[must_use]
    pub fn with_results(mut self, results: Arc<dyn ResultLogger>) -> Self {
        self.results = Some(results);
        self
    }

    /// The shared connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The client definition store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ClientStore> {
        &self.store
    }

    /// The evaluation status tracker.
    #[must_use]
    pub fn tracker(&self) -> &EvaluationTracker {
        &self.tracker
    }

    /// Run one evaluation on one connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotReady` without touching any record when the
    /// connection is not ready or the evaluation is already running there.
    /// Otherwise the attempt is recorded as `Failed` and the cause is
    /// returned: `Timeout`, `Rpc`, `ConnectionClosed`, `Protocol`, or
    /// `Validation` (judge call failed).
    pub async fn execute_evaluation(
        &self,
        connection: &Connection,
        definition: &EvaluationDefinition,
    ) -> Result<EvaluationRecord> {
        let composite_id = match connection.composite_id() {
            Some(id) if connection.is_ready() => id,
            _ => {
                return Err(AppError::NotReady(format!(
                    "client '{}' is not ready for evaluation '{}'",
                    connection.label(),
                    definition.id
                )))
            }
        };

        let span = info_span!("dispatch", client_id = %composite_id, evaluation_id = %definition.id);
        async move {
            let _slot = connection.acquire_dispatch_slot().await?;
            let mut record = self.tracker.begin(&composite_id, &definition.id)?;
            info!(tool = %definition.tool, "evaluation started");

            let started = Instant::now();
            let outcome = self.call_and_validate(connection, definition).await;
            record.duration_ms =
                Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

            let result = match outcome {
                Ok((response, validation)) => {
                    record.status = EvaluationStatus::Completed;
                    record.response = Some(response);
                    info!(
                        duration_ms = record.duration_ms,
                        passed = validation.as_ref().map(|v| v.passed),
                        "evaluation completed"
                    );
                    record.validation = validation;
                    Ok(record.clone())
                }
                Err(err) => {
                    record.status = EvaluationStatus::Failed;
                    record.error = Some(err.to_string());
                    warn!(duration_ms = record.duration_ms, %err, "evaluation failed");
                    Err(err)
                }
            };

            if self.tracker.finish(record.clone()) {
                self.log_result(&record);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run one evaluation by client and evaluation id.
    ///
    /// `client` is either a composite id or a base id; a base id targets the
    /// first ready tab of that client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown target or evaluation, and
    /// otherwise whatever [`Self::execute_evaluation`] returns.
    pub async fn run(&self, client: &str, evaluation_id: &str) -> Result<EvaluationRecord> {
        let connection = self.resolve_target(client)?;
        let definition = self.definition_for(&connection, evaluation_id)?;
        self.execute_evaluation(&connection, &definition).await
    }

    /// Run one evaluation on a specific tab of a client.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_tab(
        &self,
        client_id: &str,
        tab_id: &str,
        evaluation_id: &str,
    ) -> Result<EvaluationRecord> {
        self.run(&composite_client_id(client_id, tab_id), evaluation_id)
            .await
    }

    /// Run every evaluation a client owns on one of its connections.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`/`NotReady` when the target cannot be
    /// resolved; individual evaluation failures are reported per attempt.
    pub async fn run_all(&self, client: &str) -> Result<Vec<BatchAttempt>> {
        let connection = self.resolve_target(client)?;
        let definitions = self.definitions_for(&connection, &BatchSelector::All);
        Ok(self.run_batch(&connection, definitions).await)
    }

    /// Run the selected evaluations on every ready connection.
    ///
    /// Connections are driven concurrently; each one runs its evaluations in
    /// groups of its declared `maxConcurrency`, pausing for the configured
    /// inter-call delay between groups.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotReady` only when no connection is ready.
    pub async fn evaluate_all_clients(&self, selector: &BatchSelector) -> Result<Vec<BatchAttempt>> {
        let ready = self.registry.ready_connections();
        if ready.is_empty() {
            return Err(AppError::NotReady("no ready clients".into()));
        }

        let batches = ready.iter().map(|connection| {
            let definitions = self.definitions_for(connection, selector);
            self.run_batch(connection, definitions)
        });
        let attempts: Vec<BatchAttempt> = join_all(batches).await.into_iter().flatten().collect();

        info!(
            clients = ready.len(),
            attempts = attempts.len(),
            failures = attempts.iter().filter(|a| a.is_failure()).count(),
            "batch evaluation finished"
        );
        Ok(attempts)
    }

    /// Apply a proactive `status` frame to the connection's running record.
    pub fn handle_status(&self, connection: &Connection, update: StatusUpdate) {
        let Some(composite_id) = connection.composite_id() else {
            warn!(connection_id = connection.id(), "status frame from unregistered connection ignored");
            return;
        };

        let progress = match update.progress.map(validate_progress).transpose() {
            Ok(progress) => progress,
            Err(err) => {
                warn!(client_id = %composite_id, evaluation_id = %update.evaluation_id, %err, "status frame dropped");
                return;
            }
        };

        let applied = self.tracker.update_progress(
            &composite_id,
            &update.evaluation_id,
            progress,
            update.message,
        );
        debug!(
            client_id = %composite_id,
            evaluation_id = %update.evaluation_id,
            agent_status = %update.status,
            applied,
            "status frame"
        );
    }

    /// Reset tracked evaluations back to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when nothing matched.
    pub fn reset(&self, client: &str, evaluation_id: &str) -> Result<Vec<EvaluationRecord>> {
        let reset = self.tracker.reset(client, evaluation_id)?;
        info!(client, evaluation_id, records = reset.len(), "evaluation reset to pending");
        Ok(reset)
    }

    /// Counters for the operator `status` command.
    #[must_use]
    pub fn summary(&self) -> DispatchSummary {
        DispatchSummary {
            connections: self.registry.connection_count(),
            registered: self.registry.list_connected().len(),
            ready: self.registry.ready_connections().len(),
            running: self.tracker.running_count(),
            tracked: self.tracker.list(None).len(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn call_and_validate(
        &self,
        connection: &Connection,
        definition: &EvaluationDefinition,
    ) -> Result<(EvaluateResult, Option<ValidationOutcome>)> {
        let timeout_ms = definition
            .timeout
            .unwrap_or(self.config.default_timeout_ms);
        let params = EvaluateParams {
            evaluation_id: definition.id.clone(),
            name: definition.name.clone(),
            url: definition.url.clone(),
            tool: definition.tool.clone(),
            input: definition.input.clone(),
            timeout: timeout_ms,
            metadata: definition.metadata.clone(),
        };

        let value = connection
            .rpc()
            .call(
                METHOD_EVALUATE,
                serde_json::to_value(&params)?,
                Duration::from_millis(timeout_ms),
            )
            .await?;
        let response: EvaluateResult = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("invalid evaluate result: {e}")))?;

        let validation = self.validate(definition, &response).await?;
        Ok((response, validation))
    }

    async fn validate(
        &self,
        definition: &EvaluationDefinition,
        response: &EvaluateResult,
    ) -> Result<Option<ValidationOutcome>> {
        let Some(spec) = definition.validation.as_ref().filter(|s| s.uses_judge()) else {
            return Ok(None);
        };
        let judge = self
            .judge
            .as_ref()
            .ok_or_else(|| AppError::Validation("no judge configured".into()))?;

        let task = if definition.description.is_empty() {
            definition.name.clone()
        } else {
            format!("{}\n\n{}", definition.name, definition.description)
        };
        let criteria = JudgeCriteria {
            criteria: spec.criteria.clone(),
            model: spec.model.clone(),
        };
        let verdict = judge
            .evaluate(&task, &output_text(&response.output), &criteria)
            .await?;

        let threshold = spec.threshold();
        Ok(Some(ValidationOutcome {
            passed: classify(verdict.overall_score, threshold),
            score: verdict.overall_score,
            threshold,
            strengths: verdict.strengths,
            weaknesses: verdict.weaknesses,
        }))
    }

    async fn run_batch(
        &self,
        connection: &Connection,
        definitions: Vec<EvaluationDefinition>,
    ) -> Vec<BatchAttempt> {
        let label = connection.label();
        let label = label.as_str();
        let group_size = connection.capabilities().effective_max_concurrency();
        let delay = Duration::from_millis(self.config.inter_call_delay_ms);
        let mut attempts = Vec::with_capacity(definitions.len());

        for (index, group) in definitions.chunks(group_size).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let runs = group.iter().map(|definition| async move {
                let outcome = self.execute_evaluation(connection, definition).await;
                BatchAttempt {
                    client_id: label.to_owned(),
                    evaluation_id: definition.id.clone(),
                    status: outcome.as_ref().ok().map(|record| record.status),
                    error: outcome.err().map(|err| err.to_string()),
                }
            });
            attempts.extend(join_all(runs).await);
        }
        attempts
    }

    fn resolve_target(&self, client: &str) -> Result<Arc<Connection>> {
        if client.contains(':') {
            return self.registry.get_client(client);
        }
        let tabs = self.registry.get_tabs(client);
        if tabs.is_empty() {
            return Err(AppError::NotFound(format!("client '{client}' is not connected")));
        }
        tabs.into_iter()
            .find(|connection| connection.is_ready())
            .ok_or_else(|| AppError::NotReady(format!("client '{client}' has no ready tab")))
    }

    fn definition_for(
        &self,
        connection: &Connection,
        evaluation_id: &str,
    ) -> Result<EvaluationDefinition> {
        let base = connection.client_id().unwrap_or_default();
        self.store
            .get_evaluation(&base, evaluation_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "evaluation '{evaluation_id}' is not defined for client '{base}'"
                ))
            })
    }

    fn definitions_for(
        &self,
        connection: &Connection,
        selector: &BatchSelector,
    ) -> Vec<EvaluationDefinition> {
        let base = connection.client_id().unwrap_or_default();
        self.store
            .list_evaluations(&base)
            .into_iter()
            .filter(|definition| selector.selects(definition))
            .collect()
    }

    fn log_result(&self, record: &EvaluationRecord) {
        if let Some(results) = &self.results {
            if let Err(err) = results.log_result(&ResultEntry::from_record(record)) {
                warn!(%err, "failed to record evaluation result");
            }
        }
    }
}

/// Text handed to the judge: strings verbatim, anything else as JSON.
fn output_text(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
