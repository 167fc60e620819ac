//! Persistence boundary for users and call records.
//!
//! Components above this module never talk to the database directly; every
//! mutation and query round-trips through the `CallStore` trait so the store
//! exclusively owns the stored truth.

mod sqlite;

pub use sqlite::{CallDb, DbHandle};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CallBrief, CallRecord, EvaluationPatch, NewCall, ThreadKey, User};
use crate::report::Report;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_user(&self, agent_id: &str, phone_id: Option<&str>) -> Result<User>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Atomically bumps the per-thread call counter and returns the new
    /// value. This is the single write the sequencer builds on: concurrent
    /// callers for one thread each observe a distinct, gap-free count.
    async fn increment_and_get(&self, thread: &ThreadKey) -> Result<u32>;

    async fn insert_call(&self, call: NewCall) -> Result<CallRecord>;

    async fn get_call(&self, id: &str) -> Result<Option<CallRecord>>;

    /// All calls of one user, newest first, projected to listing briefs.
    async fn list_calls(&self, user_id: &str) -> Result<Vec<CallBrief>>;

    /// The report of the highest-`call_count` record strictly below
    /// `below_count` that has one. `None` when no earlier call reached `done`.
    async fn find_latest_report(
        &self,
        thread: &ThreadKey,
        below_count: u32,
    ) -> Result<Option<Report>>;

    /// Applies one evaluation transition and returns the updated record.
    async fn update_evaluation(&self, id: &str, patch: EvaluationPatch) -> Result<CallRecord>;

    /// Demotes `running` records not touched since `cutoff` to `retrying`
    /// and returns them, so the runner can re-drive jobs stranded by a crash.
    async fn demote_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>>;
}
