//! Race-free call-count assignment.

use std::sync::Arc;

use crate::errors::CallError;
use crate::model::ThreadKey;
use crate::store::CallStore;

/// Hands out the next call-count for a thread. The heavy lifting is the
/// store's atomic upsert-and-increment on the per-thread counter row; the
/// read-max-then-insert approach it replaces let two concurrent creations
/// observe the same maximum and collide on the unique index.
pub struct Sequencer {
    store: Arc<dyn CallStore>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self { store }
    }

    /// Next count for `thread`, starting at 1. A counter failure aborts the
    /// whole creation; no call record has been written at this point.
    pub async fn next_count(&self, thread: &ThreadKey) -> Result<u32, CallError> {
        self.store
            .increment_and_get(thread)
            .await
            .map_err(CallError::Sequencing)
    }
}
