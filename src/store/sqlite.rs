use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::CallStore;
use crate::model::{
    CallBrief, CallRecord, EvaluationPatch, EvaluationStatus, NewCall, ReportBrief, ThreadKey,
    User,
};
use crate::report::Report;

/// UTC timestamp with fixed fractional precision, so stored strings compare
/// correctly as text (the staleness cutoff relies on this).
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Async-safe handle to the call database.
///
/// Wraps `CallDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CallDb>>,
}

impl DbHandle {
    pub fn new(db: CallDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CallDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct CallDb {
    conn: Connection,
}

impl CallDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    phone_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS calls (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    agent_id TEXT NOT NULL,
                    customer_num TEXT NOT NULL,
                    call_count INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    evaluation_status TEXT NOT NULL DEFAULT 'pending',
                    evaluation_attempts INTEGER NOT NULL DEFAULT 0,
                    evaluation_last_error TEXT,
                    report TEXT,
                    UNIQUE(user_id, customer_num, call_count)
                );

                CREATE TABLE IF NOT EXISTS call_counters (
                    user_id TEXT NOT NULL,
                    customer_num TEXT NOT NULL,
                    count INTEGER NOT NULL,
                    PRIMARY KEY (user_id, customer_num)
                );

                CREATE INDEX IF NOT EXISTS idx_calls_user ON calls(user_id);
                CREATE INDEX IF NOT EXISTS idx_calls_thread
                    ON calls(user_id, customer_num, call_count);
                CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(evaluation_status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, agent_id: &str, phone_id: Option<&str>) -> Result<User> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let created_at = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users (id, agent_id, phone_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, agent_id, phone_id, created_at],
            )
            .context("Failed to insert user")?;
        self.get_user(&id)?.context("User not found after insert")
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, agent_id, phone_id, created_at FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        agent_id: row.get(1)?,
                        phone_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")
    }

    // ── Sequencing ────────────────────────────────────────────────────

    /// Upsert-and-increment on the per-thread counter row, returning the
    /// post-increment value. A single statement, so two concurrent creations
    /// can never read the same count. A separate read-max-then-insert would
    /// hand both callers the same number.
    pub fn increment_and_get(&self, thread: &ThreadKey) -> Result<u32> {
        let count: i64 = self
            .conn
            .query_row(
                "INSERT INTO call_counters (user_id, customer_num, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(user_id, customer_num) DO UPDATE SET count = count + 1
                 RETURNING count",
                params![thread.user_id, thread.customer_num],
                |row| row.get(0),
            )
            .context("Failed to increment call counter")?;
        Ok(count as u32)
    }

    // ── Calls ─────────────────────────────────────────────────────────

    pub fn insert_call(&self, call: &NewCall) -> Result<CallRecord> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO calls (id, user_id, agent_id, customer_num, call_count, url,
                                    created_at, updated_at, evaluation_status, evaluation_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 'pending', 0)",
                params![
                    id,
                    call.user_id,
                    call.agent_id,
                    call.customer_num,
                    call.call_count,
                    call.url,
                    now
                ],
            )
            .context("Failed to insert call")?;
        self.get_call(&id)?.context("Call not found after insert")
    }

    pub fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, agent_id, customer_num, call_count, url, created_at,
                        updated_at, evaluation_status, evaluation_attempts,
                        evaluation_last_error, report
                 FROM calls WHERE id = ?1",
                params![id],
                Self::read_call_row,
            )
            .optional()
            .context("Failed to query call")?;
        match row {
            Some(r) => Ok(Some(r.into_call()?)),
            None => Ok(None),
        }
    }

    pub fn list_calls(&self, user_id: &str) -> Result<Vec<CallBrief>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, agent_id, customer_num, call_count, url, created_at,
                        updated_at, evaluation_status, evaluation_attempts,
                        evaluation_last_error, report
                 FROM calls WHERE user_id = ?1 ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_calls")?;
        let rows = stmt
            .query_map(params![user_id], Self::read_call_row)
            .context("Failed to query calls")?;
        let mut briefs = Vec::new();
        for row in rows {
            let record = row.context("Failed to read call row")?.into_call()?;
            briefs.push(CallBrief {
                id: record.id,
                user_id: record.user_id,
                agent_id: record.agent_id,
                customer_num: record.customer_num,
                call_count: record.call_count,
                url: record.url,
                created_at: record.created_at,
                evaluation_status: record.evaluation_status,
                evaluation_attempts: record.evaluation_attempts,
                evaluation_last_error: record.evaluation_last_error,
                report: record.report.as_ref().map(ReportBrief::from),
            });
        }
        Ok(briefs)
    }

    pub fn find_latest_report(
        &self,
        thread: &ThreadKey,
        below_count: u32,
    ) -> Result<Option<Report>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT report FROM calls
                 WHERE user_id = ?1 AND customer_num = ?2
                   AND call_count < ?3 AND report IS NOT NULL
                 ORDER BY call_count DESC LIMIT 1",
                params![thread.user_id, thread.customer_num, below_count],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query latest report")?;
        match raw {
            Some(json) => {
                let report: Report =
                    serde_json::from_str(&json).context("Failed to parse stored report JSON")?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    pub fn update_evaluation(&self, id: &str, patch: &EvaluationPatch) -> Result<CallRecord> {
        // Use unchecked_transaction so one transition is one atomic write.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(status) = &patch.status {
            tx.execute(
                "UPDATE calls SET evaluation_status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update evaluation status")?;
        }
        if let Some(attempts) = patch.attempts {
            tx.execute(
                "UPDATE calls SET evaluation_attempts = ?1 WHERE id = ?2",
                params![attempts, id],
            )
            .context("Failed to update evaluation attempts")?;
        }
        if let Some(last_error) = &patch.last_error {
            tx.execute(
                "UPDATE calls SET evaluation_last_error = ?1 WHERE id = ?2",
                params![last_error, id],
            )
            .context("Failed to update evaluation last_error")?;
        }
        if let Some(report) = &patch.report {
            let json = serde_json::to_string(report).context("Failed to serialize report")?;
            tx.execute(
                "UPDATE calls SET report = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update report")?;
        }
        tx.execute(
            "UPDATE calls SET updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )
        .context("Failed to update updated_at")?;

        tx.commit().context("Failed to commit evaluation update")?;
        self.get_call(id)?.context("Call not found after update")
    }

    pub fn demote_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let cutoff = timestamp_rfc3339(cutoff);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM calls
                 WHERE evaluation_status = 'running' AND updated_at < ?1
                 ORDER BY updated_at",
            )
            .context("Failed to prepare stale-running query")?;
        let ids: Vec<String> = stmt
            .query_map(params![cutoff], |row| row.get(0))
            .context("Failed to query stale running calls")?
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read stale call id")?;
        drop(stmt);

        let mut demoted = Vec::new();
        for id in ids {
            self.conn
                .execute(
                    "UPDATE calls SET evaluation_status = 'retrying', updated_at = ?1
                     WHERE id = ?2",
                    params![now_rfc3339(), id],
                )
                .context("Failed to demote stale running call")?;
            demoted.push(
                self.get_call(&id)?
                    .context("Call not found after demotion")?,
            );
        }
        Ok(demoted)
    }

    fn read_call_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRow> {
        Ok(CallRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            agent_id: row.get(2)?,
            customer_num: row.get(3)?,
            call_count: row.get(4)?,
            url: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            evaluation_status: row.get(8)?,
            evaluation_attempts: row.get(9)?,
            evaluation_last_error: row.get(10)?,
            report: row.get(11)?,
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading calls from SQLite before converting
/// the status string and the report JSON column into typed values.
struct CallRow {
    id: String,
    user_id: String,
    agent_id: String,
    customer_num: String,
    call_count: i64,
    url: String,
    created_at: String,
    updated_at: String,
    evaluation_status: String,
    evaluation_attempts: i64,
    evaluation_last_error: Option<String>,
    report: Option<String>,
}

impl CallRow {
    fn into_call(self) -> Result<CallRecord> {
        let status = EvaluationStatus::from_str(&self.evaluation_status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse evaluation status")?;
        let report = match self.report {
            Some(json) => Some(
                serde_json::from_str(&json).context("Failed to parse stored report JSON")?,
            ),
            None => None,
        };
        Ok(CallRecord {
            id: self.id,
            user_id: self.user_id,
            agent_id: self.agent_id,
            customer_num: self.customer_num,
            call_count: self.call_count as u32,
            url: self.url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            evaluation_status: status,
            evaluation_attempts: self.evaluation_attempts as u32,
            evaluation_last_error: self.evaluation_last_error,
            report,
        })
    }
}

// ── Async trait impl ──────────────────────────────────────────────────

#[async_trait]
impl CallStore for DbHandle {
    async fn create_user(&self, agent_id: &str, phone_id: Option<&str>) -> Result<User> {
        let agent_id = agent_id.to_string();
        let phone_id = phone_id.map(|p| p.to_string());
        self.call(move |db| db.create_user(&agent_id, phone_id.as_deref()))
            .await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let user_id = user_id.to_string();
        self.call(move |db| db.get_user(&user_id)).await
    }

    async fn increment_and_get(&self, thread: &ThreadKey) -> Result<u32> {
        let thread = thread.clone();
        self.call(move |db| db.increment_and_get(&thread)).await
    }

    async fn insert_call(&self, call: NewCall) -> Result<CallRecord> {
        self.call(move |db| db.insert_call(&call)).await
    }

    async fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        let id = id.to_string();
        self.call(move |db| db.get_call(&id)).await
    }

    async fn list_calls(&self, user_id: &str) -> Result<Vec<CallBrief>> {
        let user_id = user_id.to_string();
        self.call(move |db| db.list_calls(&user_id)).await
    }

    async fn find_latest_report(
        &self,
        thread: &ThreadKey,
        below_count: u32,
    ) -> Result<Option<Report>> {
        let thread = thread.clone();
        self.call(move |db| db.find_latest_report(&thread, below_count))
            .await
    }

    async fn update_evaluation(&self, id: &str, patch: EvaluationPatch) -> Result<CallRecord> {
        let id = id.to_string();
        self.call(move |db| db.update_evaluation(&id, &patch)).await
    }

    async fn demote_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        self.call(move |db| db.demote_stale_running(cutoff)).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
