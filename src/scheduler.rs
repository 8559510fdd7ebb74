use crate::job_registry::JobRegistry;
use crate::storage;
use crate::worker::Worker;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Tunables for the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of jobs claimed and executed per tick.
    pub batch_limit: u32,
    /// How long completed and failed rows are kept before deletion.
    pub retention: Duration,
    /// Minimum time between garbage collection passes.
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_limit: 4,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Result of a [`Scheduler::tick`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick ran to completion.
    Completed(TickSummary),
    /// A previous tick was still in flight; nothing was done.
    Skipped,
}

/// What a completed tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Processing jobs whose stale locks were reset to pending.
    pub recovered: u64,
    /// Jobs claimed and executed this tick.
    pub claimed: usize,
    /// Terminal rows deleted by garbage collection.
    pub cleaned: u64,
}

/// Drives the queue: stale recovery, then claim plus parallel execution,
/// then retention cleanup on a slower cadence.
///
/// Ticks never overlap. The gate is an atomic flag owned by the scheduler
/// itself, so a manual trigger racing the poll loop is skipped outright
/// rather than queued.
pub struct Scheduler<Context> {
    pool: SqlitePool,
    job_registry: Arc<JobRegistry<Context>>,
    worker: Worker<Context>,
    config: SchedulerConfig,
    in_flight: AtomicBool,
    last_cleanup: AtomicI64,
}

impl<Context: Clone + Send + Sync + 'static> Scheduler<Context> {
    pub(crate) fn new(
        pool: SqlitePool,
        context: Context,
        job_registry: Arc<JobRegistry<Context>>,
        config: SchedulerConfig,
    ) -> Self {
        let worker = Worker {
            connection_pool: pool.clone(),
            context,
            job_registry: Arc::clone(&job_registry),
        };

        Self {
            pool,
            job_registry,
            worker,
            config,
            in_flight: AtomicBool::new(false),
            last_cleanup: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    /// Run one tick, unless the previous one is still in flight.
    ///
    /// A skipped tick is not queued for later; the next interval or manual
    /// trigger simply tries again.
    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("Previous tick still in flight, skipping");
            return Ok(TickOutcome::Skipped);
        }

        let result = self.run_tick().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result.map(TickOutcome::Completed)
    }

    async fn run_tick(&self) -> anyhow::Result<TickSummary> {
        let mut recovered = 0;
        for (job_type, policy) in self.job_registry.policies() {
            recovered +=
                storage::recover_stale_jobs(&self.pool, job_type, policy.stale_after).await?;
        }
        if recovered > 0 {
            info!(recovered, "Reset stale locks back to pending");
        }

        let job_types = self.job_registry.job_types();
        let stale_after = self.job_registry.shortest_stale_window();
        let jobs =
            storage::claim_jobs(&self.pool, self.config.batch_limit, &job_types, stale_after)
                .await?;
        let claimed = jobs.len();
        if claimed > 0 {
            debug!(claimed, "Claimed a batch of jobs");
        }
        self.worker.execute_batch(jobs).await?;

        let cleaned = self.maybe_cleanup().await?;

        Ok(TickSummary {
            recovered,
            claimed,
            cleaned,
        })
    }

    async fn maybe_cleanup(&self) -> anyhow::Result<u64> {
        let now = Utc::now().timestamp();
        let interval = i64::try_from(self.config.cleanup_interval.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(self.last_cleanup.load(Ordering::SeqCst)) < interval {
            return Ok(0);
        }
        self.last_cleanup.store(now, Ordering::SeqCst);

        let cleaned = storage::cleanup_expired_jobs(&self.pool, self.config.retention).await?;
        if cleaned > 0 {
            debug!(cleaned, "Garbage collected terminal jobs");
        }
        Ok(cleaned)
    }
}
