use crate::handler::{JobHandler, JobOutcome};
use crate::policy::RetryPolicy;
use crate::schema::Job;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Job) -> BoxFuture<'static, anyhow::Result<JobOutcome>> + Send + Sync>;

pub(crate) struct RegisteredJob<Context> {
    pub(crate) run: RunTaskFn<Context>,
    pub(crate) policy: RetryPolicy,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            policy: self.policy,
        }
    }
}

/// Dispatch table from job type name to handler and retry policy.
pub(crate) struct JobRegistry<Context> {
    jobs: HashMap<String, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<H: JobHandler<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = Arc::new(|ctx, job| H::run(job, ctx).boxed());
        self.jobs.insert(
            H::JOB_TYPE.to_string(),
            RegisteredJob {
                run,
                policy: H::RETRY,
            },
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.jobs.get(job_type)
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub(crate) fn policies(&self) -> impl Iterator<Item = (&str, &RetryPolicy)> {
        self.jobs
            .iter()
            .map(|(job_type, registered)| (job_type.as_str(), &registered.policy))
    }

    /// Shortest stale window across registered types, used by the claim
    /// statement's stale-lock escape clause. Conservative: a lock another
    /// type would still consider live is never stolen.
    pub(crate) fn shortest_stale_window(&self) -> Duration {
        self.jobs
            .values()
            .map(|registered| registered.policy.stale_after)
            .min()
            .unwrap_or(RetryPolicy::DEFAULT.stale_after)
    }
}
