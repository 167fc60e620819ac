use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::report::Report;

/// Identifies a recurring conversation between one owner and one counterparty.
/// The call-count sequence is scoped to this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub user_id: String,
    pub customer_num: String,
}

impl ThreadKey {
    pub fn new(user_id: impl Into<String>, customer_num: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            customer_num: customer_num.into(),
        }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.customer_num)
    }
}

/// Lifecycle of a call's evaluation. The string values are persisted and
/// polled by dashboard consumers; the set is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Retrying,
    Done,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses receive no further evaluation writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid evaluation status: {}", s)),
        }
    }
}

/// An agent account that owns call recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub agent_id: String,
    pub phone_id: Option<String>,
    pub created_at: String,
}

/// A recorded call and its evaluation sub-state. `id`, the thread fields,
/// `call_count`, `url` and `created_at` are immutable after insert; only the
/// job runner touches the `evaluation_*` fields and `report` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub customer_num: String,
    pub call_count: u32,
    pub url: String,
    pub created_at: String,
    pub updated_at: String,
    pub evaluation_status: EvaluationStatus,
    pub evaluation_attempts: u32,
    pub evaluation_last_error: Option<String>,
    pub report: Option<Report>,
}

impl CallRecord {
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(self.user_id.clone(), self.customer_num.clone())
    }
}

/// Fields supplied by the orchestrator when inserting a new call record.
/// The store fills in identity, timestamps and the pending evaluation state.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub user_id: String,
    pub agent_id: String,
    pub customer_num: String,
    pub call_count: u32,
    pub url: String,
}

/// Partial update applied to a call's evaluation sub-state. Every runner
/// transition becomes exactly one patch so readers observe whole steps.
#[derive(Debug, Clone, Default)]
pub struct EvaluationPatch {
    pub status: Option<EvaluationStatus>,
    pub attempts: Option<u32>,
    /// `Some(None)` clears the stored error, `Some(Some(_))` overwrites it.
    pub last_error: Option<Option<String>>,
    pub report: Option<Report>,
}

impl EvaluationPatch {
    /// Attempt `n` is starting: `running` for the first, `retrying` after.
    pub fn attempt_started(attempt: u32) -> Self {
        let status = if attempt == 1 {
            EvaluationStatus::Running
        } else {
            EvaluationStatus::Retrying
        };
        Self {
            status: Some(status),
            attempts: Some(attempt),
            ..Self::default()
        }
    }

    pub fn succeeded(report: Report) -> Self {
        Self {
            status: Some(EvaluationStatus::Done),
            last_error: Some(None),
            report: Some(report),
            ..Self::default()
        }
    }

    pub fn attempt_failed(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn exhausted() -> Self {
        Self {
            status: Some(EvaluationStatus::Failed),
            ..Self::default()
        }
    }
}

/// Score summary carried by the per-user call listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBrief {
    pub overall_score: u8,
    pub keyword: Vec<String>,
    pub is_valid: bool,
}

impl From<&Report> for ReportBrief {
    fn from(report: &Report) -> Self {
        Self {
            overall_score: report.overall_score,
            keyword: report.keyword.clone(),
            is_valid: report.is_valid,
        }
    }
}

/// Listing projection of a call: everything but the transcript-heavy report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallBrief {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub customer_num: String,
    pub call_count: u32,
    pub url: String,
    pub created_at: String,
    pub evaluation_status: EvaluationStatus,
    pub evaluation_attempts: u32,
    pub evaluation_last_error: Option<String>,
    pub report: Option<ReportBrief>,
}
