//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the job queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed once `run_after` has passed.
    Pending,
    /// Claimed by the executor; `locked_at` is set.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
}

impl JobStatus {
    /// Whether no further automatic transition applies to this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// Discriminator preventing duplicate concurrent work for one source
    pub scope_key: Option<String>,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Number of failed attempts so far
    pub retry_count: i64,
    /// Failure budget stamped from the job type's retry policy at enqueue
    pub max_retries: i64,
    /// Timestamp gating claim eligibility
    pub run_after: DateTime<Utc>,
    /// Timestamp of the claim holding this job, if any
    pub locked_at: Option<DateTime<Utc>>,
    /// Opaque continuation token for a paginated fetch
    pub cursor: Option<String>,
    /// Message recorded by the most recent failure
    pub error_message: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state transition
    pub updated_at: DateTime<Utc>,
}

/// Row counts by status, for dashboards and health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: i64,
    /// Jobs currently locked by the executor.
    pub processing: i64,
    /// Successfully finished jobs not yet garbage collected.
    pub completed: i64,
    /// Terminally failed jobs not yet garbage collected.
    pub failed: i64,
}
