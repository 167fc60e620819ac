//! Prior-report lookup for evaluation continuity.

use std::sync::Arc;

use crate::errors::CallError;
use crate::model::ThreadKey;
use crate::store::CallStore;

/// Fetches the most recent finished report of a thread and serializes it as
/// input context for the next evaluation.
///
/// Policy: an unfinished prior evaluation (`pending`/`running`/`retrying`,
/// or one that ended `failed`) contributes nothing — the chainer never waits
/// for it. Only consolidated `done` results feed continuity scoring.
pub struct ContextChainer {
    store: Arc<dyn CallStore>,
}

impl ContextChainer {
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self { store }
    }

    /// The serialized report of the highest-count call below `below_count`
    /// that finished, or `None` for a first call / no finished predecessor.
    pub async fn prior_context(
        &self,
        thread: &ThreadKey,
        below_count: u32,
    ) -> Result<Option<String>, CallError> {
        let report = self
            .store
            .find_latest_report(thread, below_count)
            .await
            .map_err(CallError::Store)?;
        match report {
            Some(report) => {
                let json = serde_json::to_string(&report)
                    .map_err(|e| CallError::Store(anyhow::Error::new(e)))?;
                Ok(Some(json))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvaluationPatch, NewCall};
    use crate::report::{Report, test_report};
    use crate::store::{CallDb, CallStore, DbHandle};

    async fn seeded_store() -> (Arc<DbHandle>, ThreadKey) {
        let store = Arc::new(DbHandle::new(CallDb::new_in_memory().unwrap()));
        let user = store.create_user("agent-1", None).await.unwrap();
        let thread = ThreadKey::new(user.id.clone(), "555-0100".to_string());
        store
            .insert_call(NewCall {
                user_id: user.id.clone(),
                agent_id: user.agent_id.clone(),
                customer_num: "555-0100".to_string(),
                call_count: 1,
                url: "https://blobs.example/first.mp3".to_string(),
            })
            .await
            .unwrap();
        (store, thread)
    }

    #[tokio::test]
    async fn test_first_call_has_no_context() {
        let store = Arc::new(DbHandle::new(CallDb::new_in_memory().unwrap()));
        let chainer = ContextChainer::new(store);
        let thread = ThreadKey::new("u1", "555-0100");
        assert!(
            chainer
                .prior_context(&thread, 1)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unfinished_prior_call_yields_no_context() {
        let (store, thread) = seeded_store().await;
        let chainer = ContextChainer::new(store);
        // The single prior call is still pending.
        assert!(
            chainer
                .prior_context(&thread, 2)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_finished_prior_report_round_trips() {
        let (store, thread) = seeded_store().await;
        let calls = store.list_calls(&thread.user_id).await.unwrap();
        store
            .update_evaluation(&calls[0].id, EvaluationPatch::succeeded(test_report(82)))
            .await
            .unwrap();

        let chainer = ContextChainer::new(Arc::clone(&store) as Arc<dyn CallStore>);
        let context = chainer.prior_context(&thread, 2).await.unwrap().unwrap();

        let parsed: Report = serde_json::from_str(&context).unwrap();
        assert_eq!(parsed, test_report(82));
    }
}
