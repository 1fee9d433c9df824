/// Job handlers
///
/// A handler receives the decoded payload and a `JobInfo`. Returning
/// `JobError::Failed` counts as a failed attempt and is reported; returning
/// `JobError::Retry` asks for another attempt without treating the failure as
/// an error worth reporting.

use crate::job::JobInfo;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// Outcome of a handler that did not succeed
#[derive(Debug, Error)]
pub enum JobError {
    /// Expected, transient condition; try again shortly
    #[error("Retry requested: {0}")]
    Retry(String),

    /// The attempt failed
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl JobError {
    /// Requests another attempt
    pub fn retry(reason: impl Into<String>) -> Self {
        JobError::Retry(reason.into())
    }
}

/// Processes jobs of one queue
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    /// Handles one attempt of a job
    async fn handle(&self, payload: T, job: &JobInfo) -> Result<(), JobError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as a `JobHandler`
///
/// The closure gets the payload and its own copy of the job info.
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut, E> JobHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T, JobInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<JobError>,
{
    async fn handle(&self, payload: T, job: &JobInfo) -> Result<(), JobError> {
        (self.f)(payload, job.clone()).await.map_err(Into::into)
    }
}
