//! Minimal daemon wiring for the job queue.
//!
//! Two simulated connectors are registered: a paginated message fetcher and
//! a flaky summarization job whose first attempt times out. The scheduler is
//! driven manually here so the drain loop also waits out retry backoff.
//!
//! ```bash
//! cargo run --example daemon
//! ```

use anyhow::Result;
use jobqueue::schema::Job;
use jobqueue::{JobHandler, JobOutcome, RetryPolicy, Runner, queue_stats, setup_database};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Clone, Default)]
struct Connectors {
    summarize_attempts: Arc<AtomicU32>,
}

/// Fetches one page of messages per job and chains the next page.
struct FetchMessages;

impl JobHandler for FetchMessages {
    const JOB_TYPE: &'static str = "fetch_messages";
    type Context = Connectors;

    async fn run(job: Job, _ctx: Connectors) -> Result<JobOutcome> {
        let page: u32 = job.cursor.as_deref().map_or(0, |c| c.parse().unwrap_or(0));
        let source = job.scope_key.as_deref().unwrap_or("-");
        info!(source, page, "Fetched a page of messages");
        tokio::time::sleep(Duration::from_millis(50)).await;

        if page < 3 {
            Ok(JobOutcome::Paginated {
                cursor: (page + 1).to_string(),
            })
        } else {
            Ok(JobOutcome::Done)
        }
    }
}

/// Summarizes a day of activity; the first attempt hits a simulated
/// upstream timeout and is retried with backoff.
struct SummarizeDay;

impl JobHandler for SummarizeDay {
    const JOB_TYPE: &'static str = "summarize_day";
    const RETRY: RetryPolicy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(100),
        cap_delay: Duration::from_secs(1),
        stale_after: Duration::from_secs(60),
    };
    type Context = Connectors;

    async fn run(job: Job, ctx: Connectors) -> Result<JobOutcome> {
        if ctx.summarize_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("model endpoint timed out");
        }
        info!(day = job.scope_key.as_deref().unwrap_or("-"), "Summary stored");
        Ok(JobOutcome::Done)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,daemon=info,jobqueue=info".into()),
        )
        .compact()
        .init();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    setup_database(&pool).await?;

    let scheduler = Runner::new(pool.clone(), Connectors::default())
        .register_job_type::<FetchMessages>()
        .register_job_type::<SummarizeDay>()
        .batch_limit(4)
        .into_scheduler();

    FetchMessages::enqueue(&pool, Some("chat:general")).await?;
    FetchMessages::enqueue(&pool, Some("code:reviews")).await?;
    SummarizeDay::enqueue(&pool, Some("2026-08-06")).await?;

    // Connectors enqueue on every poll; a duplicate for a live scope is a no-op.
    assert!(
        FetchMessages::enqueue(&pool, Some("chat:general"))
            .await?
            .is_none()
    );

    // Tick until the queue has drained, covering retry backoff as well.
    loop {
        scheduler.tick().await?;
        let stats = queue_stats(&pool).await?;
        if stats.pending == 0 && stats.processing == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = queue_stats(&pool).await?;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "Queue drained"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
