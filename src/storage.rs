use crate::errors::EnqueueError;
use crate::policy::RetryPolicy;
use crate::schema::{Job, JobStatus, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::warn;

/// Apply the embedded migrations, creating the `jobs` table and its indexes.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// A job about to be inserted.
#[derive(Debug)]
pub(crate) struct NewJob<'a> {
    pub(crate) job_type: &'static str,
    pub(crate) scope_key: Option<&'a str>,
    pub(crate) cursor: Option<&'a str>,
    pub(crate) run_after: Option<DateTime<Utc>>,
    pub(crate) max_retries: u32,
}

/// Insert a job only if no pending/processing job exists for the same
/// `(job_type, scope_key)`.
///
/// The conditional insert is the primary dedup path; the partial unique
/// index on active rows catches the remaining race and is reported as a
/// plain `None` as well, so callers can enqueue on every poll.
pub(crate) async fn enqueue_job(
    pool: &SqlitePool,
    job: NewJob<'_>,
) -> Result<Option<i64>, EnqueueError> {
    let now = Utc::now();
    let run_after = job.run_after.unwrap_or(now);

    let result = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO jobs (job_type, scope_key, status, retry_count, max_retries,
                          run_after, cursor, created_at, updated_at)
        SELECT ?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?6
        WHERE NOT EXISTS (
            SELECT 1 FROM jobs
            WHERE job_type = ?1 AND scope_key IS ?2
              AND status IN ('pending', 'processing')
        )
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(job.scope_key)
    .bind(i64::from(job.max_retries))
    .bind(run_after)
    .bind(job.cursor)
    .bind(now)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(id) => Ok(id),
        Err(sqlx::Error::Database(error)) if error.is_unique_violation() => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Atomically claim up to `limit` eligible jobs.
///
/// Eligible means pending, due, of a registered type, and either unlocked
/// or carrying a lock older than `stale_after`. Selection and the flip to
/// processing happen in one statement, so concurrent callers can never
/// claim the same row twice.
pub async fn claim_jobs(
    pool: &SqlitePool,
    limit: u32,
    job_types: &[String],
    stale_after: Duration,
) -> Result<Vec<Job>, sqlx::Error> {
    if job_types.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let stale_cutoff = saturating_sub(now, stale_after);

    let placeholders = vec!["?"; job_types.len()].join(", ");
    let query = format!(
        r"
        UPDATE jobs
        SET status = 'processing', locked_at = ?, updated_at = ?
        WHERE id IN (
            SELECT id FROM jobs
            WHERE status = 'pending'
              AND run_after <= ?
              AND (locked_at IS NULL OR locked_at < ?)
              AND job_type IN ({placeholders})
            ORDER BY created_at ASC, id ASC
            LIMIT ?
        )
        RETURNING *
        ",
    );

    let mut statement = sqlx::query_as::<_, Job>(&query)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(stale_cutoff);
    for job_type in job_types {
        statement = statement.bind(job_type);
    }
    statement.bind(i64::from(limit)).fetch_all(pool).await
}

/// Reset processing jobs of one type whose lock is older than `stale_after`
/// back to pending, leaving `retry_count` untouched.
///
/// This is the crash-recovery path: a worker claimed the job and died
/// before finishing, and the abandoned attempt does not count against the
/// retry budget. Returns the number of reclaimed jobs.
pub async fn recover_stale_jobs(
    pool: &SqlitePool,
    job_type: &str,
    stale_after: Duration,
) -> Result<u64, sqlx::Error> {
    let now = Utc::now();
    let stale_cutoff = saturating_sub(now, stale_after);

    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'pending', locked_at = NULL, updated_at = ?
        WHERE job_type = ? AND status = 'processing' AND locked_at < ?
        ",
    )
    .bind(now)
    .bind(job_type)
    .bind(stale_cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark a job completed and, when `next_cursor` is given, enqueue the
/// follow-up page job in the same transaction.
///
/// The follow-up inherits `job_type`, `scope_key` and `max_retries` from
/// the source row and skips the duplicate pre-check; the source job is
/// already terminal by then. Should an unrelated pending job for the same
/// scope have appeared in the meantime, the active-scope index fires, the
/// collision is logged and the completion still commits. Returns the id of
/// the follow-up job, if one was created.
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: i64,
    next_cursor: Option<&str>,
) -> Result<Option<i64>, sqlx::Error> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE jobs SET status = 'completed', locked_at = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    let mut follow_up = None;
    if let Some(cursor) = next_cursor {
        let inserted = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (job_type, scope_key, status, retry_count, max_retries,
                              run_after, cursor, created_at, updated_at)
            SELECT job_type, scope_key, 'pending', 0, max_retries, ?2, ?3, ?2, ?2
            FROM jobs
            WHERE id = ?1
            RETURNING id
            ",
        )
        .bind(job_id)
        .bind(now)
        .bind(cursor)
        .fetch_optional(&mut *tx)
        .await;

        match inserted {
            Ok(id) => follow_up = id,
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                warn!(job_id, "Follow-up page job skipped: scope already has a pending job");
            }
            Err(error) => return Err(error),
        }
    }

    tx.commit().await?;
    Ok(follow_up)
}

/// Record a failed attempt.
///
/// Below the retry budget the job is requeued: retry count incremented,
/// lock cleared, `run_after` pushed out by the policy's capped exponential
/// backoff. Once `retry_count` has reached `max_retries` the job flips to
/// terminal `failed` instead. The whole transition is one statement.
///
/// Transient and permanent errors are deliberately not distinguished here;
/// there is no classification hook, so a permanently broken job burns its
/// retries and then parks as `failed`.
pub async fn fail_job(
    pool: &SqlitePool,
    job: &Job,
    policy: &RetryPolicy,
    error_message: &str,
) -> Result<JobStatus, sqlx::Error> {
    let now = Utc::now();
    let next_attempt =
        u32::try_from((job.retry_count + 1).min(job.max_retries)).unwrap_or(u32::MAX);
    let run_after = saturating_add(now, policy.backoff_delay(next_attempt));

    sqlx::query_scalar::<_, JobStatus>(
        r"
        UPDATE jobs
        SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
            retry_count = MIN(retry_count + 1, max_retries),
            run_after = CASE WHEN retry_count < max_retries THEN ?2 ELSE run_after END,
            locked_at = NULL,
            error_message = ?3,
            updated_at = ?4
        WHERE id = ?1
        RETURNING status
        ",
    )
    .bind(job.id)
    .bind(run_after)
    .bind(error_message)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Delete completed and failed jobs whose last transition is older than
/// `retention`. Pending and processing rows are never touched, whatever
/// their age. Returns the number of deleted rows.
pub async fn cleanup_expired_jobs(
    pool: &SqlitePool,
    retention: Duration,
) -> Result<u64, sqlx::Error> {
    let cutoff = saturating_sub(Utc::now(), retention);

    let result =
        sqlx::query("DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Count jobs by status.
pub async fn queue_stats(pool: &SqlitePool) -> Result<QueueStats, sqlx::Error> {
    sqlx::query_as::<_, QueueStats>(
        r"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed
        FROM jobs
        ",
    )
    .fetch_one(pool)
    .await
}

/// Fetch a single job by id.
pub async fn find_job(pool: &SqlitePool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

fn saturating_add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn saturating_sub(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
