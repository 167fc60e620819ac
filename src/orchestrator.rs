//! Call lifecycle orchestration.
//!
//! Composes the sequencer, context chainer, store and job runner. All
//! collaborators are injected handles; nothing here reaches into process
//! globals, so tests swap in scripted services and in-memory stores.

use std::sync::Arc;

use crate::chain::ContextChainer;
use crate::errors::CallError;
use crate::model::{CallBrief, CallRecord, NewCall, ThreadKey};
use crate::runner::JobRunner;
use crate::sequencer::Sequencer;
use crate::store::CallStore;

pub struct CallOrchestrator {
    store: Arc<dyn CallStore>,
    sequencer: Sequencer,
    chainer: ContextChainer,
    runner: Arc<JobRunner>,
}

impl CallOrchestrator {
    pub fn new(store: Arc<dyn CallStore>, runner: Arc<JobRunner>) -> Self {
        Self {
            sequencer: Sequencer::new(Arc::clone(&store)),
            chainer: ContextChainer::new(Arc::clone(&store)),
            store,
            runner,
        }
    }

    /// Create a call record and schedule its evaluation.
    ///
    /// The returned record is always `pending`; evaluation progress is
    /// observed only through subsequent reads. Each step is its own failure
    /// boundary — a sequencing or store failure surfaces to the caller with
    /// no partial record persisted, while evaluation failures after this
    /// point never do.
    pub async fn create_call(
        &self,
        user_id: &str,
        customer_num: &str,
        url: &str,
    ) -> Result<CallRecord, CallError> {
        if user_id.trim().is_empty() {
            return Err(CallError::Validation("user_id must not be empty".into()));
        }
        if customer_num.trim().is_empty() {
            return Err(CallError::Validation(
                "customer_num must not be empty".into(),
            ));
        }
        if url.trim().is_empty() {
            return Err(CallError::Validation("audio url must not be empty".into()));
        }

        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(CallError::Store)?
            .ok_or_else(|| CallError::UserNotFound {
                user_id: user_id.to_string(),
            })?;

        let thread = ThreadKey::new(user_id, customer_num);
        let call_count = self.sequencer.next_count(&thread).await?;

        let prior = if call_count > 1 {
            self.chainer.prior_context(&thread, call_count).await?
        } else {
            None
        };

        let record = self
            .store
            .insert_call(NewCall {
                user_id: user.id,
                agent_id: user.agent_id,
                customer_num: customer_num.to_string(),
                call_count,
                url: url.to_string(),
            })
            .await
            .map_err(CallError::Store)?;

        self.runner.schedule(&record.id, &record.url, prior).await;
        tracing::info!(
            call_id = %record.id,
            thread = %thread,
            call_count,
            "call created, evaluation scheduled"
        );
        Ok(record)
    }

    pub async fn get_call(&self, id: &str) -> Result<CallRecord, CallError> {
        self.store
            .get_call(id)
            .await
            .map_err(CallError::Store)?
            .ok_or_else(|| CallError::CallNotFound { id: id.to_string() })
    }

    /// All calls of one user, newest first.
    pub async fn list_calls(&self, user_id: &str) -> Result<Vec<CallBrief>, CallError> {
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(CallError::Store)?;
        if user.is_none() {
            return Err(CallError::UserNotFound {
                user_id: user_id.to_string(),
            });
        }
        self.store.list_calls(user_id).await.map_err(CallError::Store)
    }
}
