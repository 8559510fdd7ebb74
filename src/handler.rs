use crate::errors::EnqueueError;
use crate::policy::RetryPolicy;
use crate::schema::Job;
use crate::storage::{self, NewJob};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;
use std::future::Future;
use tracing::instrument;

/// Outcome of a successful handler invocation.
///
/// Only the cursor is interpreted by the queue core; anything else a
/// connector produces (saved row counts, domain results) stays on the
/// connector side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All work for this job is finished.
    Done,
    /// More upstream pages remain; a follow-up job resumes from `cursor`.
    Paginated {
        /// Opaque resume point understood only by the handler.
        cursor: String,
    },
}

/// Trait for defining the handler behind a job type.
///
/// Connectors implement this once per job type and register it on the
/// [`Runner`](crate::Runner). The handler is invoked for every claimed job
/// of its type; `job.cursor` carries the resume point when the invocation
/// continues an earlier page.
///
/// Transient and permanent errors are not distinguished: any `Err` (or
/// panic) is retried per [`Self::RETRY`] and parks the job as failed once
/// the budget is exhausted. Handlers should therefore be idempotent.
pub trait JobHandler: Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Retry, backoff and lock-staleness configuration for this job type.
    const RETRY: RetryPolicy = RetryPolicy::DEFAULT;

    /// The application data provided to this handler at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute one claimed job.
    fn run(
        job: Job,
        ctx: Self::Context,
    ) -> impl Future<Output = anyhow::Result<JobOutcome>> + Send;

    /// Enqueue a job of this type.
    ///
    /// Returns the job ID, or `None` if a pending/processing job already
    /// exists for the same `(job_type, scope_key)`. Deduplication makes
    /// this safe to call unconditionally on every upstream poll.
    #[instrument(name = "jobqueue.enqueue", skip(pool), fields(job_type = Self::JOB_TYPE))]
    fn enqueue<'a>(
        pool: &'a SqlitePool,
        scope_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let job = NewJob {
            job_type: Self::JOB_TYPE,
            scope_key,
            cursor: None,
            run_after: None,
            max_retries: Self::RETRY.max_retries,
        };
        storage::enqueue_job(pool, job).boxed()
    }

    /// Enqueue a job of this type that only becomes eligible at `run_after`.
    #[instrument(name = "jobqueue.enqueue_at", skip(pool), fields(job_type = Self::JOB_TYPE))]
    fn enqueue_at<'a>(
        pool: &'a SqlitePool,
        scope_key: Option<&'a str>,
        run_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let job = NewJob {
            job_type: Self::JOB_TYPE,
            scope_key,
            cursor: None,
            run_after: Some(run_after),
            max_retries: Self::RETRY.max_retries,
        };
        storage::enqueue_job(pool, job).boxed()
    }

    /// Enqueue a job of this type resuming from an explicit cursor, e.g. to
    /// restart an interrupted backfill at a known point.
    #[instrument(name = "jobqueue.enqueue_from", skip(pool), fields(job_type = Self::JOB_TYPE))]
    fn enqueue_from<'a>(
        pool: &'a SqlitePool,
        scope_key: Option<&'a str>,
        cursor: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let job = NewJob {
            job_type: Self::JOB_TYPE,
            scope_key,
            cursor: Some(cursor),
            run_after: None,
            max_retries: Self::RETRY.max_retries,
        };
        storage::enqueue_job(pool, job).boxed()
    }
}
