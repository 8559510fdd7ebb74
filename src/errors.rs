use thiserror::Error;

/// Errors that can occur while enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The insert failed at the database level.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
