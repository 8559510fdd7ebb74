#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_none, assert_some};
use jobqueue::schema::{Job, JobStatus};
use jobqueue::{
    JobHandler, JobOutcome, RetryPolicy, claim_jobs, cleanup_expired_jobs, complete_job, fail_job,
    find_job, queue_stats, recover_stale_jobs,
};
use sqlx::SqlitePool;
use std::time::Duration;

const STALE_WINDOW: Duration = Duration::from_secs(600);

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Create an in-memory database with the schema applied
    pub(super) async fn setup_test_db() -> anyhow::Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        jobqueue::setup_database(&pool).await?;
        Ok(pool)
    }

    pub(super) async fn set_retry_count(pool: &SqlitePool, id: i64, retry_count: i64) {
        sqlx::query("UPDATE jobs SET retry_count = ? WHERE id = ?")
            .bind(retry_count)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    pub(super) async fn backdate_locked_at(pool: &SqlitePool, id: i64, minutes: i64) {
        sqlx::query("UPDATE jobs SET locked_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(minutes))
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    pub(super) async fn backdate_updated_at(pool: &SqlitePool, id: i64, days: i64) {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::days(days))
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    pub(super) async fn backdate_run_after(pool: &SqlitePool, id: i64, minutes: i64) {
        sqlx::query("UPDATE jobs SET run_after = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(minutes))
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }
}

struct FetchChat;

impl JobHandler for FetchChat {
    const JOB_TYPE: &'static str = "fetch_chat";
    type Context = ();

    async fn run(_job: Job, _ctx: ()) -> anyhow::Result<JobOutcome> {
        Ok(JobOutcome::Done)
    }
}

struct FetchRepo;

impl JobHandler for FetchRepo {
    const JOB_TYPE: &'static str = "fetch_repo";
    type Context = ();

    async fn run(_job: Job, _ctx: ()) -> anyhow::Result<JobOutcome> {
        Ok(JobOutcome::Done)
    }
}

fn registered_types() -> Vec<String> {
    vec![FetchChat::JOB_TYPE.to_string(), FetchRepo::JOB_TYPE.to_string()]
}

#[tokio::test]
async fn enqueue_deduplicates_while_a_job_is_live() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    assert_none!(FetchChat::enqueue(&pool, Some("s1")).await?);

    let stats = queue_stats(&pool).await?;
    assert_eq!(stats.pending, 1);

    // Still deduplicated while the job is processing.
    let claimed = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(claimed.len(), 1);
    assert_none!(FetchChat::enqueue(&pool, Some("s1")).await?);

    // Once the job is terminal the scope is free again.
    complete_job(&pool, job_id, None).await?;
    let second_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    assert_ne!(second_id, job_id);

    Ok(())
}

#[tokio::test]
async fn enqueue_distinguishes_type_and_scope() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    assert_some!(FetchChat::enqueue(&pool, Some("s2")).await?);
    assert_some!(FetchRepo::enqueue(&pool, Some("s1")).await?);

    // A missing scope key deduplicates against itself.
    assert_some!(FetchChat::enqueue(&pool, None).await?);
    assert_none!(FetchChat::enqueue(&pool, None).await?);

    let stats = queue_stats(&pool).await?;
    assert_eq!(stats.pending, 4);

    Ok(())
}

#[tokio::test]
async fn claim_respects_the_limit() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    for scope in ["s1", "s2", "s3", "s4", "s5"] {
        assert_some!(FetchChat::enqueue(&pool, Some(scope)).await?);
    }

    let first_batch = claim_jobs(&pool, 2, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(first_batch.len(), 2);
    for job in &first_batch {
        assert_eq!(job.status, JobStatus::Processing);
        assert_some!(job.locked_at);
    }

    let second_batch = claim_jobs(&pool, 10, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(second_batch.len(), 3);

    let third_batch = claim_jobs(&pool, 10, &registered_types(), STALE_WINDOW).await?;
    assert!(third_batch.is_empty());

    Ok(())
}

#[tokio::test]
async fn claim_is_ordered_by_creation() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let first = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    let second = assert_some!(FetchChat::enqueue(&pool, Some("s2")).await?);

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, first);

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, second);

    Ok(())
}

#[tokio::test]
async fn claim_skips_jobs_scheduled_for_later() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(
        FetchChat::enqueue_at(&pool, Some("s1"), Utc::now() + chrono::Duration::hours(1)).await?
    );

    let batch = claim_jobs(&pool, 10, &registered_types(), STALE_WINDOW).await?;
    assert!(batch.is_empty());

    // Once due, the job is claimable.
    test_utils::backdate_run_after(&pool, job_id, 1).await;
    let batch = claim_jobs(&pool, 10, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, job_id);

    Ok(())
}

#[tokio::test]
async fn claim_only_returns_requested_types() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    let repo_id = assert_some!(FetchRepo::enqueue(&pool, Some("s1")).await?);

    let repo_only = vec![FetchRepo::JOB_TYPE.to_string()];
    let batch = claim_jobs(&pool, 10, &repo_only, STALE_WINDOW).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, repo_id);

    let batch = claim_jobs(&pool, 10, &[], STALE_WINDOW).await?;
    assert!(batch.is_empty());

    Ok(())
}

#[tokio::test]
async fn claim_never_returns_the_same_job_twice() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);

    let batch = claim_jobs(&pool, 5, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch.len(), 1);
    assert!(claim_jobs(&pool, 5, &registered_types(), STALE_WINDOW).await?.is_empty());

    // A failure resets the job to pending, but backoff keeps it ineligible
    // until `run_after` has passed.
    fail_job(&pool, &batch[0], &RetryPolicy::DEFAULT, "timeout").await?;
    assert!(claim_jobs(&pool, 5, &registered_types(), STALE_WINDOW).await?.is_empty());

    test_utils::backdate_run_after(&pool, job_id, 1).await;
    let batch = claim_jobs(&pool, 5, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, job_id);

    Ok(())
}

#[tokio::test]
async fn fail_requeues_with_exponential_backoff() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    test_utils::set_retry_count(&pool, job_id, 2).await;

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    let before = Utc::now();
    let status = fail_job(&pool, &batch[0], &RetryPolicy::DEFAULT, "timeout").await?;
    assert_eq!(status, JobStatus::Pending);

    let job = assert_some!(find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 3);
    assert_none!(job.locked_at);
    assert_eq!(job.error_message.as_deref(), Some("timeout"));

    // Third retry backs off by 8 seconds.
    let delay_ms = (job.run_after - before).num_milliseconds();
    assert!((7_500..=9_000).contains(&delay_ms), "unexpected backoff: {delay_ms}ms");

    Ok(())
}

#[tokio::test]
async fn fail_at_the_retry_budget_is_terminal() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    test_utils::set_retry_count(&pool, job_id, 3).await;

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    let status = fail_job(&pool, &batch[0], &RetryPolicy::DEFAULT, "timeout").await?;
    assert_eq!(status, JobStatus::Failed);

    let job = assert_some!(find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);

    // Failed is sticky: another failure report cannot resurrect the job.
    let status = fail_job(&pool, &job, &RetryPolicy::DEFAULT, "timeout").await?;
    assert_eq!(status, JobStatus::Failed);
    assert!(claim_jobs(&pool, 5, &registered_types(), STALE_WINDOW).await?.is_empty());

    // The scope is free for new work once the old job is terminal.
    assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);

    Ok(())
}

#[tokio::test]
async fn recovery_resets_stale_locks_without_counting_a_retry() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;

    // Simulate a worker that claimed the job and died 20 minutes ago.
    test_utils::backdate_locked_at(&pool, job_id, 20).await;

    let recovered = recover_stale_jobs(&pool, FetchChat::JOB_TYPE, STALE_WINDOW).await?;
    assert_eq!(recovered, 1);

    let job = assert_some!(find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_none!(job.locked_at);
    assert_eq!(job.retry_count, 0);

    // Nothing left to recover.
    let recovered = recover_stale_jobs(&pool, FetchChat::JOB_TYPE, STALE_WINDOW).await?;
    assert_eq!(recovered, 0);

    Ok(())
}

#[tokio::test]
async fn recovery_ignores_fresh_locks() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;

    let recovered = recover_stale_jobs(&pool, FetchChat::JOB_TYPE, STALE_WINDOW).await?;
    assert_eq!(recovered, 0);

    let job = assert_some!(find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Processing);
    assert_some!(job.locked_at);

    Ok(())
}

#[tokio::test]
async fn completing_with_a_cursor_enqueues_the_next_page() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, job_id);

    let follow_up_id = assert_some!(complete_job(&pool, job_id, Some("page-2")).await?);
    assert_ne!(follow_up_id, job_id);

    let source = assert_some!(find_job(&pool, job_id).await?);
    assert_eq!(source.status, JobStatus::Completed);

    let follow_up = assert_some!(find_job(&pool, follow_up_id).await?);
    assert_eq!(follow_up.status, JobStatus::Pending);
    assert_eq!(follow_up.job_type, source.job_type);
    assert_eq!(follow_up.scope_key, source.scope_key);
    assert_eq!(follow_up.cursor.as_deref(), Some("page-2"));
    assert_eq!(follow_up.retry_count, 0);
    assert_eq!(follow_up.max_retries, source.max_retries);

    // The follow-up is immediately claimable.
    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, follow_up_id);

    Ok(())
}

#[tokio::test]
async fn completing_without_a_cursor_is_final() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let job_id = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;

    assert_none!(complete_job(&pool, job_id, None).await?);

    let stats = queue_stats(&pool).await?;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);

    Ok(())
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_rows() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let retention = Duration::from_secs(7 * 24 * 60 * 60);

    // Old completed row.
    let old_completed = assert_some!(FetchChat::enqueue(&pool, Some("done")).await?);
    claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    complete_job(&pool, old_completed, None).await?;
    test_utils::backdate_updated_at(&pool, old_completed, 10).await;

    // Old failed row.
    let old_failed = assert_some!(FetchChat::enqueue(&pool, Some("broken")).await?);
    test_utils::set_retry_count(&pool, old_failed, 3).await;
    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    fail_job(&pool, &batch[0], &RetryPolicy::DEFAULT, "bad input").await?;
    test_utils::backdate_updated_at(&pool, old_failed, 10).await;

    // Old but still pending, and a fresh completed row.
    let old_pending = assert_some!(FetchChat::enqueue(&pool, Some("waiting")).await?);
    test_utils::backdate_updated_at(&pool, old_pending, 30).await;

    let fresh_completed = assert_some!(FetchChat::enqueue(&pool, Some("recent")).await?);
    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, fresh_completed);
    complete_job(&pool, fresh_completed, None).await?;

    let deleted = cleanup_expired_jobs(&pool, retention).await?;
    assert_eq!(deleted, 2);

    assert_none!(find_job(&pool, old_completed).await?);
    assert_none!(find_job(&pool, old_failed).await?);
    assert_some!(find_job(&pool, old_pending).await?);
    assert_some!(find_job(&pool, fresh_completed).await?);

    Ok(())
}

#[tokio::test]
async fn stats_count_rows_by_status() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;

    let completed = assert_some!(FetchChat::enqueue(&pool, Some("s1")).await?);
    let failed = assert_some!(FetchChat::enqueue(&pool, Some("s2")).await?);
    let processing = assert_some!(FetchChat::enqueue(&pool, Some("s3")).await?);
    let _pending = assert_some!(FetchChat::enqueue(&pool, Some("s4")).await?);

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, completed);
    complete_job(&pool, completed, None).await?;

    test_utils::set_retry_count(&pool, failed, 3).await;
    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, failed);
    fail_job(&pool, &batch[0], &RetryPolicy::DEFAULT, "bad input").await?;

    let batch = claim_jobs(&pool, 1, &registered_types(), STALE_WINDOW).await?;
    assert_eq!(batch[0].id, processing);

    let stats = queue_stats(&pool).await?;
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    Ok(())
}
