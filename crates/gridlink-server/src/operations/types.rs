//! Queued operation model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle of a queued operation. Terminal states never change again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a multi-step tool workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Assigned on enqueue when empty
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    /// Tool name the operation runs
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Ids that must all be completed before this one is ready
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>, input: Value) -> Self {
        Self {
            id: String::new(),
            session_id: session_id.into(),
            kind: kind.into(),
            status: OperationStatus::Queued,
            input,
            result: None,
            error: None,
            depends_on: Vec::new(),
            batch_id: None,
            priority: 0,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Operations enqueued together under one id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub session_id: String,
    pub operation_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-status counts across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchProgress {
    pub(crate) fn count(&mut self, status: OperationStatus) {
        self.total += 1;
        match status {
            OperationStatus::Queued => self.queued += 1,
            OperationStatus::InProgress => self.in_progress += 1,
            OperationStatus::Completed => self.completed += 1,
            OperationStatus::Failed => self.failed += 1,
            OperationStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Every member reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.queued == 0 && self.in_progress == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("operation id already in use: {0}")]
    DuplicateId(String),

    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("batch not found: {0}")]
    UnknownBatch(String),

    #[error("a batch needs at least one operation")]
    EmptyBatch,

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,
}
