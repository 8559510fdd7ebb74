use crate::handler::JobOutcome;
use crate::job_registry::JobRegistry;
use crate::policy::RetryPolicy;
use crate::schema::{Job, JobStatus};
use crate::storage;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Run a claimed batch to completion, all jobs concurrently.
    ///
    /// Handler errors and panics are routed through the retry path per job
    /// and never affect siblings in the batch; only store-level errors
    /// surface from here.
    pub(crate) async fn execute_batch(&self, jobs: Vec<Job>) -> anyhow::Result<()> {
        let results = join_all(jobs.into_iter().map(|job| self.execute_job(job))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn execute_job(&self, job: Job) -> anyhow::Result<()> {
        let span = info_span!("job", job.id = %job.id, job.job_type = %job.job_type);
        let pool = &self.connection_pool;
        let context = self.context.clone();

        async move {
            debug!("Running job…");

            let registered = self.job_registry.get(&job.job_type);
            let policy = registered.map_or(RetryPolicy::DEFAULT, |registered| registered.policy);

            let result = match registered {
                Some(registered) => {
                    let future = (registered.run)(context, job.clone());
                    AssertUnwindSafe(future)
                        .catch_unwind()
                        .await
                        .map_err(|panic| try_to_extract_panic_info(&*panic))
                        // TODO: Replace with flatten() once that stabilizes
                        .and_then(std::convert::identity)
                }
                None => Err(anyhow!("Unknown job type {}", job.job_type)),
            };

            match result {
                Ok(JobOutcome::Done) => {
                    debug!("Job completed");
                    storage::complete_job(pool, job.id, None).await?;
                }
                Ok(JobOutcome::Paginated { cursor }) => {
                    debug!(%cursor, "Job completed, enqueueing the next page");
                    storage::complete_job(pool, job.id, Some(&cursor)).await?;
                }
                Err(job_error) => {
                    warn!("Failed to run job: {job_error:#}");
                    let message = format!("{job_error:#}");
                    let status = storage::fail_job(pool, &job, &policy, &message).await?;
                    if status == JobStatus::Failed {
                        error!("Job exhausted its retries and is permanently failed");
                    }
                }
            }

            Ok(())
        }
        .instrument(span)
        .await
    }
}
