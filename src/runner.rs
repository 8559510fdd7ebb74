use crate::handler::JobHandler;
use crate::job_registry::JobRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig, TickOutcome};
use futures_util::future::join_all;
use rand::Rng;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// The core runner responsible for registering job types and driving the
/// scheduler loop.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: SqlitePool,
    job_registry: JobRegistry<Context>,
    context: Context,
    config: SchedulerConfig,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug
    for Runner<Context>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.job_registry.job_types())
            .field("context", &self.context)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: SqlitePool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            config: SchedulerConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            shutdown_when_queue_empty: false,
        }
    }

    /// Configure a job type to be claimed and executed by this runner.
    #[must_use]
    pub fn register_job_type<H: JobHandler<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<H>();
        self
    }

    /// Set the maximum number of jobs claimed and executed per tick.
    #[must_use]
    pub fn batch_limit(mut self, batch_limit: u32) -> Self {
        self.config.batch_limit = batch_limit;
        self
    }

    /// Set how often the scheduler polls for new jobs.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each poll interval.
    ///
    /// Jitter spreads the polling of several processes sharing one store,
    /// e.g. a daemon and a management CLI. The actual jitter applied is a
    /// random value between 0 and the specified duration.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long completed and failed jobs are kept before deletion.
    #[must_use]
    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    /// Set the minimum time between garbage collection passes.
    #[must_use]
    pub fn cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.config.cleanup_interval = cleanup_interval;
        self
    }

    /// Set the runner to shut down once a tick finds no eligible work.
    ///
    /// Jobs parked on a future `run_after` do not keep the runner alive.
    /// Mostly useful for drain-style batch runs and tests.
    #[must_use]
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Build the scheduler without starting the poll loop.
    ///
    /// Useful for driving ticks manually, e.g. from a management endpoint
    /// or in tests.
    #[must_use]
    pub fn into_scheduler(self) -> Scheduler<Context> {
        Scheduler::new(
            self.connection_pool,
            self.context,
            Arc::new(self.job_registry),
            self.config,
        )
    }

    /// Start the scheduler loop.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the loop
    /// to shut down.
    pub fn start(&self) -> RunHandle {
        let scheduler = Scheduler::new(
            self.connection_pool.clone(),
            self.context.clone(),
            Arc::new(self.job_registry.clone()),
            self.config,
        );

        info!("Starting scheduler loop…");
        let poll_interval = self.poll_interval;
        let jitter = self.jitter;
        let shutdown_when_queue_empty = self.shutdown_when_queue_empty;

        let span = info_span!("scheduler");
        let handle = tokio::spawn(
            async move {
                run_scheduler_loop(scheduler, poll_interval, jitter, shutdown_when_queue_empty)
                    .await;
            }
            .instrument(span),
        );

        RunHandle {
            handles: vec![handle],
        }
    }
}

async fn run_scheduler_loop<Context: Clone + Send + Sync + 'static>(
    scheduler: Scheduler<Context>,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
) {
    loop {
        match scheduler.tick().await {
            Ok(TickOutcome::Completed(summary)) => {
                if shutdown_when_queue_empty && summary.claimed == 0 && summary.recovered == 0 {
                    debug!("No eligible jobs found. Shutting down the scheduler…");
                    break;
                }
            }
            Ok(TickOutcome::Skipped) => {}
            Err(tick_error) => {
                error!("Scheduler tick failed: {tick_error:#}");
                break;
            }
        }

        sleep(sleep_duration_with_jitter(poll_interval, jitter)).await;
    }
}

/// Calculate the sleep duration with random jitter applied.
fn sleep_duration_with_jitter(poll_interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return poll_interval;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    poll_interval + Duration::from_millis(random_jitter)
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for the scheduler loop to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(join_error) = result {
                warn!(%join_error, "Scheduler task panicked");
            }
        });
    }
}
