//! Evaluation job runner: the retry/backoff state machine.
//!
//! One job drives one call record from `pending` to a terminal status. Jobs
//! run as spawned tasks so the request path that created the call never
//! blocks; each transition is persisted before the next step, so pollers of
//! `evaluation_status` observe monotonic progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::EvalError;
use crate::evaluator::EvaluationService;
use crate::model::EvaluationPatch;
use crate::report::Report;
use crate::store::CallStore;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Attempts before the record is marked `failed`.
    pub max_attempts: u32,
    /// First retry delay; doubles per subsequent attempt.
    pub base_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// Schedules and tracks evaluation jobs.
/// At most one job per call record is in flight at a time.
pub struct JobRunner {
    store: Arc<dyn CallStore>,
    service: Arc<dyn EvaluationService>,
    config: RunnerConfig,
    /// Map from call id to the job handle for in-flight evaluations.
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn CallStore>,
        service: Arc<dyn EvaluationService>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            service,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule evaluation for a freshly inserted record. Returns `false`
    /// (and spawns nothing) when a job for this record is already in flight.
    pub async fn schedule(&self, call_id: &str, url: &str, prior_context: Option<String>) -> bool {
        self.spawn_job(call_id, url, prior_context, 1).await
    }

    /// Startup reconciliation: demote `running` records not touched for
    /// `stale_after` back to `retrying` and re-drive them. The interrupted
    /// attempt is re-run without consuming extra budget (its outcome was
    /// never persisted). Returns the number of jobs re-scheduled.
    pub async fn recover(&self, stale_after: Duration) -> Result<usize> {
        let stale_after =
            chrono::Duration::from_std(stale_after).context("stale_after out of range")?;
        let demoted = self
            .store
            .demote_stale_running(Utc::now() - stale_after)
            .await?;

        let mut rescheduled = 0;
        for record in demoted {
            let thread = record.thread_key();
            let prior = self
                .store
                .find_latest_report(&thread, record.call_count)
                .await?
                .map(|r| serde_json::to_string(&r))
                .transpose()
                .context("Failed to serialize prior report")?;
            let resume_from = record.evaluation_attempts.max(1);
            tracing::info!(
                call_id = %record.id,
                attempt = resume_from,
                "re-driving evaluation stranded in running state"
            );
            if self.spawn_job(&record.id, &record.url, prior, resume_from).await {
                rescheduled += 1;
            }
        }
        Ok(rescheduled)
    }

    /// Wait for every in-flight job to reach a terminal persisted state.
    /// Jobs are never killed mid-write; a record left `running` afterwards
    /// can only come from a hard crash, which `recover` handles at startup.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.running.lock().await.drain().collect();
        let (ids, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (call_id, result) in ids.into_iter().zip(join_all(joins).await) {
            if let Err(e) = result {
                tracing::warn!(call_id = %call_id, error = %e, "evaluation job panicked");
            }
        }
    }

    /// Number of jobs currently in flight.
    pub async fn in_flight(&self) -> usize {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        running.len()
    }

    async fn spawn_job(
        &self,
        call_id: &str,
        url: &str,
        prior_context: Option<String>,
        first_attempt: u32,
    ) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.contains_key(call_id) {
            tracing::warn!(
                call_id = %call_id,
                "evaluation already in flight, refusing duplicate schedule"
            );
            return false;
        }

        let store = Arc::clone(&self.store);
        let service = Arc::clone(&self.service);
        let config = self.config.clone();
        let id = call_id.to_string();
        let url = url.to_string();
        let handle = tokio::spawn(async move {
            run_to_terminal(store, service, config, id, url, prior_context, first_attempt).await;
        });
        running.insert(call_id.to_string(), handle);
        true
    }
}

/// Drive one record to `done` or `failed`.
///
/// Attempt `k` persists `{running|retrying, attempts: k}`, invokes the
/// service, then persists either the report or the error. Failed attempts
/// back off `base_delay * 2^(k-1)` before the next one. A store failure
/// aborts the job between checkpoints; the stale-`running` reconciliation
/// picks such records up on the next startup.
async fn run_to_terminal(
    store: Arc<dyn CallStore>,
    service: Arc<dyn EvaluationService>,
    config: RunnerConfig,
    call_id: String,
    url: String,
    prior_context: Option<String>,
    first_attempt: u32,
) {
    let max_attempts = config.max_attempts.max(1);
    let first_attempt = first_attempt.clamp(1, max_attempts);

    for attempt in first_attempt..=max_attempts {
        if let Err(e) = store
            .update_evaluation(&call_id, EvaluationPatch::attempt_started(attempt))
            .await
        {
            tracing::error!(call_id = %call_id, error = %e, "failed to persist attempt start");
            return;
        }

        match run_attempt(service.as_ref(), &url, prior_context.as_deref()).await {
            Ok(report) => {
                match store
                    .update_evaluation(&call_id, EvaluationPatch::succeeded(report))
                    .await
                {
                    Ok(_) => {
                        tracing::info!(call_id = %call_id, attempt, "evaluation finished");
                    }
                    Err(e) => {
                        tracing::error!(
                            call_id = %call_id,
                            error = %e,
                            "evaluation succeeded but report write failed"
                        );
                    }
                }
                return;
            }
            Err(err) => {
                tracing::warn!(
                    call_id = %call_id,
                    attempt,
                    error = %err,
                    "evaluation attempt failed"
                );
                if let Err(e) = store
                    .update_evaluation(&call_id, EvaluationPatch::attempt_failed(err.to_string()))
                    .await
                {
                    tracing::error!(call_id = %call_id, error = %e, "failed to persist attempt error");
                    return;
                }
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(backoff_delay(config.base_delay, attempt)).await;
        }
    }

    if let Err(e) = store
        .update_evaluation(&call_id, EvaluationPatch::exhausted())
        .await
    {
        tracing::error!(call_id = %call_id, error = %e, "failed to persist failed status");
    }
}

/// One service invocation plus the schema checks its result must satisfy.
async fn run_attempt(
    service: &dyn EvaluationService,
    url: &str,
    prior: Option<&str>,
) -> Result<Report, EvalError> {
    let report = service.evaluate(url, prior).await?;
    report.validate().map_err(EvalError::InvalidReport)?;
    Ok(report)
}

/// `base * 2^(attempt-1)`: 5s, 10s, 20s... with the defaults.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}
